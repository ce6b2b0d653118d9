//! Deterministic virtual-clock host.
//!
//! [`VirtualHost`] implements [`GlobalScope`] and [`SignalSource`] over a
//! virtual millisecond clock, so throttling behaviour can be checked exactly:
//! timers fire in due-time order, ties in registration order, and frames land
//! on fixed boundaries (every 16 ms by default).
//!
//! Page code is simulated through [`VirtualHost::call`] and friends, which
//! go through whatever primitive is currently installed in the scope (the
//! native one or an interception wrapper). Cancellation goes straight to
//! [`VirtualHost::cancel`], like a host's unwrapped cancellation primitives.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::host::{
    Callback, GlobalScope, Primitive, PrimitiveKind, SignalHandler, SignalKind, SignalRegistry,
    SignalSource, SubscriptionId, TimerId,
};
use crate::{Error, Result};

/// Default frame boundary spacing (~60 fps).
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;

/// One callback delivery recorded by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firing {
    pub id: TimerId,
    pub kind: PrimitiveKind,
    pub at_ms: u64,
}

struct Timer {
    kind: PrimitiveKind,
    callback: Callback,
    repeat_ms: Option<u64>,
    key: (u64, u64),
}

struct SimState {
    now_ms: u64,
    next_timer: u64,
    next_seq: u64,
    queue: BTreeMap<(u64, u64), TimerId>,
    timers: HashMap<TimerId, Timer>,
    primitives: [Option<Primitive>; 3],
    sealed: [bool; 3],
    hidden: bool,
    firings: Vec<Firing>,
}

/// Builder for hosts with missing APIs or a custom frame cadence.
#[derive(Debug, Clone)]
pub struct VirtualHostBuilder {
    visibility_api: bool,
    media_api: bool,
    missing: Vec<PrimitiveKind>,
    frame_interval_ms: u64,
}

impl Default for VirtualHostBuilder {
    fn default() -> Self {
        Self {
            visibility_api: true,
            media_api: true,
            missing: Vec::new(),
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
        }
    }
}

impl VirtualHostBuilder {
    #[must_use]
    pub fn without_visibility_api(mut self) -> Self {
        self.visibility_api = false;
        self
    }

    #[must_use]
    pub fn without_media_api(mut self) -> Self {
        self.media_api = false;
        self
    }

    #[must_use]
    pub fn without_primitive(mut self, kind: PrimitiveKind) -> Self {
        self.missing.push(kind);
        self
    }

    #[must_use]
    pub fn frame_interval_ms(mut self, interval: u64) -> Self {
        self.frame_interval_ms = interval.max(1);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<VirtualHost> {
        Arc::new_cyclic(|weak: &Weak<VirtualHost>| {
            let mut primitives: [Option<Primitive>; 3] = [None, None, None];
            let mut supported = [true; 3];
            for kind in PrimitiveKind::ALL {
                if self.missing.contains(&kind) {
                    supported[kind.index()] = false;
                } else {
                    primitives[kind.index()] = Some(native_primitive(weak.clone(), kind));
                }
            }
            VirtualHost {
                state: Mutex::new(SimState {
                    now_ms: 0,
                    next_timer: 0,
                    next_seq: 0,
                    queue: BTreeMap::new(),
                    timers: HashMap::new(),
                    primitives,
                    sealed: [false; 3],
                    hidden: false,
                    firings: Vec::new(),
                }),
                signals: SignalRegistry::new(),
                supported,
                visibility_api: self.visibility_api,
                media_api: self.media_api,
                frame_interval_ms: self.frame_interval_ms,
            }
        })
    }
}

fn native_primitive(host: Weak<VirtualHost>, kind: PrimitiveKind) -> Primitive {
    Arc::new(move |callback: Callback, delay: Duration| {
        host.upgrade()
            .map_or(TimerId(0), |host| host.schedule(kind, callback, delay))
    })
}

/// Virtual-clock host environment.
pub struct VirtualHost {
    state: Mutex<SimState>,
    signals: SignalRegistry,
    supported: [bool; 3],
    visibility_api: bool,
    media_api: bool,
    frame_interval_ms: u64,
}

impl std::fmt::Debug for VirtualHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("VirtualHost")
            .field("now_ms", &state.now_ms)
            .field("pending", &state.timers.len())
            .field("hidden", &state.hidden)
            .finish()
    }
}

impl VirtualHost {
    /// Host with every primitive and signal API available.
    #[must_use]
    pub fn new() -> Arc<Self> {
        VirtualHostBuilder::default().build()
    }

    #[must_use]
    pub fn builder() -> VirtualHostBuilder {
        VirtualHostBuilder::default()
    }

    // -------------------------------------------------------------------------
    // Page-side calls
    // -------------------------------------------------------------------------

    /// Call the primitive currently installed for `kind`, as page code would.
    /// Returns `None` when the host lacks it.
    pub fn call(
        &self,
        kind: PrimitiveKind,
        callback: Callback,
        delay: Duration,
    ) -> Option<TimerId> {
        let primitive = self.lock().primitives[kind.index()].clone()?;
        Some(primitive(callback, delay))
    }

    pub fn set_interval(&self, callback: Callback, delay: Duration) -> Option<TimerId> {
        self.call(PrimitiveKind::Periodic, callback, delay)
    }

    pub fn set_timeout(&self, callback: Callback, delay: Duration) -> Option<TimerId> {
        self.call(PrimitiveKind::OneShot, callback, delay)
    }

    pub fn request_frame(&self, callback: Callback) -> Option<TimerId> {
        self.call(PrimitiveKind::FrameAligned, callback, Duration::ZERO)
    }

    /// Native cancellation, shared by all three kinds. Returns false for ids
    /// that already fired (one-shot) or were never issued.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.lock();
        match state.timers.remove(&id) {
            Some(timer) => {
                state.queue.remove(&timer.key);
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Environment control
    // -------------------------------------------------------------------------

    /// Flip the visibility flag and notify visibility listeners.
    pub fn set_hidden(&self, hidden: bool) {
        self.lock().hidden = hidden;
        self.signals.dispatch(SignalKind::VisibilityChange);
    }

    /// Raise a document-level media notification.
    pub fn media(&self, kind: SignalKind) {
        debug_assert!(kind.is_media(), "media() expects a media signal");
        self.signals.dispatch(kind);
    }

    /// Make the slot for `kind` read-only: later writes through
    /// [`GlobalScope::set_primitive`] fail until it is unsealed.
    pub fn set_sealed(&self, kind: PrimitiveKind, sealed: bool) {
        self.lock().sealed[kind.index()] = sealed;
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.signals.len()
    }

    // -------------------------------------------------------------------------
    // Clock
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.lock().now_ms
    }

    /// Advance the clock, firing every timer that comes due on the way.
    /// Callbacks run without the host lock held and may schedule or cancel.
    pub fn advance(&self, by: Duration) {
        let target = self.now_ms() + by.as_millis() as u64;
        while let Some(callback) = self.pop_due(target) {
            callback();
        }
        let mut state = self.lock();
        state.now_ms = state.now_ms.max(target);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// Number of registrations still pending.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().timers.len()
    }

    /// Due time of a pending registration.
    #[must_use]
    pub fn due_at(&self, id: TimerId) -> Option<u64> {
        self.lock().timers.get(&id).map(|timer| timer.key.0)
    }

    #[must_use]
    pub fn firings(&self) -> Vec<Firing> {
        self.lock().firings.clone()
    }

    /// Times at which `id` fired.
    #[must_use]
    pub fn fired_at(&self, id: TimerId) -> Vec<u64> {
        self.lock()
            .firings
            .iter()
            .filter(|firing| firing.id == id)
            .map(|firing| firing.at_ms)
            .collect()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, kind: PrimitiveKind, callback: Callback, delay: Duration) -> TimerId {
        let delay_ms = delay.as_millis() as u64;
        let mut state = self.lock();
        let now = state.now_ms;
        let (due, repeat_ms) = match kind {
            PrimitiveKind::Periodic => {
                let every = delay_ms.max(1);
                (now + every, Some(every))
            }
            PrimitiveKind::OneShot => (now + delay_ms, None),
            PrimitiveKind::FrameAligned => {
                (next_frame_boundary(now, delay_ms, self.frame_interval_ms), None)
            }
        };

        state.next_timer += 1;
        let id = TimerId(state.next_timer);
        let key = (due, state.next_seq);
        state.next_seq += 1;
        state.queue.insert(key, id);
        state.timers.insert(
            id,
            Timer {
                kind,
                callback,
                repeat_ms,
                key,
            },
        );
        id
    }

    fn pop_due(&self, target: u64) -> Option<Callback> {
        let mut state = self.lock();
        loop {
            let (&key, &id) = state.queue.iter().next()?;
            if key.0 > target {
                return None;
            }
            state.queue.remove(&key);
            state.now_ms = key.0;

            let Some((callback, kind, repeat_ms)) = state
                .timers
                .get(&id)
                .map(|timer| (Arc::clone(&timer.callback), timer.kind, timer.repeat_ms))
            else {
                continue;
            };

            match repeat_ms {
                Some(every) => {
                    let next_key = (key.0 + every, state.next_seq);
                    state.next_seq += 1;
                    state.queue.insert(next_key, id);
                    if let Some(timer) = state.timers.get_mut(&id) {
                        timer.key = next_key;
                    }
                }
                None => {
                    state.timers.remove(&id);
                }
            }
            state.firings.push(Firing {
                id,
                kind,
                at_ms: key.0,
            });
            return Some(callback);
        }
    }
}

/// First frame boundary strictly after `now` and at or after `now + delay`.
pub(crate) fn next_frame_boundary(now: u64, delay_ms: u64, interval: u64) -> u64 {
    let earliest = (now + delay_ms).max(now + 1);
    earliest.div_ceil(interval) * interval
}

impl GlobalScope for VirtualHost {
    fn primitive(&self, kind: PrimitiveKind) -> Option<Primitive> {
        self.lock().primitives[kind.index()].clone()
    }

    fn set_primitive(&self, kind: PrimitiveKind, primitive: Primitive) -> Result<()> {
        if !self.supported[kind.index()] {
            return Err(Error::PrimitiveUnavailable(kind));
        }
        let mut state = self.lock();
        if state.sealed[kind.index()] {
            return Err(Error::PrimitiveUnavailable(kind));
        }
        state.primitives[kind.index()] = Some(primitive);
        Ok(())
    }

    fn is_hidden(&self) -> Option<bool> {
        self.visibility_api.then(|| self.lock().hidden)
    }
}

impl SignalSource for VirtualHost {
    fn subscribe(&self, kind: SignalKind, handler: SignalHandler) -> Result<SubscriptionId> {
        let available = if kind.is_media() {
            self.media_api
        } else {
            self.visibility_api
        };
        if !available {
            return Err(Error::SignalSourceUnavailable(kind));
        }
        Ok(self.signals.subscribe(kind, handler))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.signals.unsubscribe(id);
    }
}
