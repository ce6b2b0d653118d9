//! Environmental state tracking.
//!
//! Watches page visibility and media playback through an injected
//! [`SignalSource`] and exposes the derived [`ThrottleLevel`]. The two
//! booleans live in atomics so interception wrappers can read them on every
//! scheduling call without taking a lock.
//!
//! Missing signal APIs degrade to no throttling: if visibility or any of the
//! play/pause/ended signals cannot be observed, the tracker registers no
//! listeners and the page stays visible and idle (`ACTIVE`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::host::{GlobalScope, SignalKind, SignalSource, SubscriptionId};
use crate::level::{EnvironmentalState, ThrottleLevel};

/// Shared environmental flags.
#[derive(Debug, Default)]
pub struct TrackerState {
    hidden: AtomicBool,
    media_playing: AtomicBool,
}

impl TrackerState {
    #[must_use]
    pub fn snapshot(&self) -> EnvironmentalState {
        EnvironmentalState::new(
            self.hidden.load(Ordering::Acquire),
            self.media_playing.load(Ordering::Acquire),
        )
    }

    /// Level derived from the current flags.
    #[must_use]
    pub fn level(&self) -> ThrottleLevel {
        self.snapshot().level()
    }

    fn set_hidden(&self, hidden: bool) {
        self.update(|| self.hidden.store(hidden, Ordering::Release));
    }

    fn set_media_playing(&self, playing: bool) {
        self.update(|| self.media_playing.store(playing, Ordering::Release));
    }

    fn update(&self, apply: impl FnOnce()) {
        let before = self.level();
        apply();
        let after = self.level();
        if before != after {
            tracing::debug!(from = %before, to = %after, "throttle level changed");
        }
    }

    fn reset(&self) {
        self.hidden.store(false, Ordering::Release);
        self.media_playing.store(false, Ordering::Release);
    }
}

/// What [`EnvironmentTracker::start`] managed to wire up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStart {
    /// Listeners registered with the signal source. Zero when any signal is
    /// unavailable.
    pub listeners: usize,
    /// Signals the host could not provide.
    pub unavailable: Vec<SignalKind>,
    /// State the tracker started from.
    pub initial: EnvironmentalState,
}

/// Derives the throttle level from visibility and media signals.
#[derive(Debug, Default)]
pub struct EnvironmentTracker {
    state: Arc<TrackerState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl EnvironmentTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current throttle level (lock-free read).
    #[must_use]
    pub fn current_level(&self) -> ThrottleLevel {
        self.state.level()
    }

    #[must_use]
    pub fn snapshot(&self) -> EnvironmentalState {
        self.state.snapshot()
    }

    /// Shared handle to the flags, for readers that outlive a borrow of the
    /// tracker (interception wrappers).
    #[must_use]
    pub fn state_handle(&self) -> Arc<TrackerState> {
        Arc::clone(&self.state)
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        !self.lock_subscriptions().is_empty()
    }

    /// Reset the state from scratch and register signal listeners.
    ///
    /// `hidden` is read from the scope immediately so the initial level is
    /// correct without waiting for a transition. Any listeners left over from
    /// a previous start are removed first.
    ///
    /// The level is only derived when visibility and the full
    /// play/pause/ended set are observable. If any of them is missing, every
    /// listener is dropped again and the state stays visible and idle, so
    /// the level is `Active` and nothing is throttled.
    pub fn start(&self, scope: &Arc<dyn GlobalScope>, signals: &dyn SignalSource) -> TrackerStart {
        self.stop(signals);
        self.state.reset();

        let mut subscriptions = Vec::new();
        let mut unavailable = Vec::new();

        match self.subscribe_visibility(scope, signals) {
            Some(id) => subscriptions.push(id),
            None => unavailable.push(SignalKind::VisibilityChange),
        }

        for kind in [
            SignalKind::MediaPlay,
            SignalKind::MediaPause,
            SignalKind::MediaEnded,
        ] {
            let state = Arc::clone(&self.state);
            let handler = Arc::new(move |fired: SignalKind| {
                state.set_media_playing(fired == SignalKind::MediaPlay);
            });
            match signals.subscribe(kind, handler) {
                Ok(id) => subscriptions.push(id),
                Err(err) => {
                    tracing::warn!(signal = %kind, error = %err, "media signal unavailable");
                    unavailable.push(kind);
                }
            }
        }

        if unavailable.is_empty() {
            self.state.set_hidden(scope.is_hidden().unwrap_or(false));
        } else {
            for id in subscriptions.drain(..) {
                signals.unsubscribe(id);
            }
            self.state.reset();
            tracing::warn!(
                ?unavailable,
                "environment not fully observable; throttling stays at ACTIVE"
            );
        }

        let listeners = subscriptions.len();
        *self.lock_subscriptions() = subscriptions;

        let initial = self.state.snapshot();
        tracing::debug!(
            listeners,
            hidden = initial.hidden,
            level = %initial.level(),
            "environment tracker started"
        );

        TrackerStart {
            listeners,
            unavailable,
            initial,
        }
    }

    /// Remove every listener registered by [`start`](Self::start) and fall
    /// back to the default state.
    pub fn stop(&self, signals: &dyn SignalSource) {
        let subscriptions = std::mem::take(&mut *self.lock_subscriptions());
        if subscriptions.is_empty() {
            return;
        }
        for id in subscriptions {
            signals.unsubscribe(id);
        }
        self.state.reset();
        tracing::debug!("environment tracker stopped");
    }

    fn subscribe_visibility(
        &self,
        scope: &Arc<dyn GlobalScope>,
        signals: &dyn SignalSource,
    ) -> Option<SubscriptionId> {
        if scope.is_hidden().is_none() {
            tracing::warn!("host has no visibility flag");
            return None;
        }

        let state = Arc::clone(&self.state);
        let weak_scope: Weak<dyn GlobalScope> = Arc::downgrade(scope);
        let handler = Arc::new(move |_: SignalKind| {
            let hidden = weak_scope
                .upgrade()
                .and_then(|scope| scope.is_hidden())
                .unwrap_or(false);
            state.set_hidden(hidden);
        });

        match signals.subscribe(SignalKind::VisibilityChange, handler) {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(error = %err, "visibility signal unavailable");
                None
            }
        }
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<SubscriptionId>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
