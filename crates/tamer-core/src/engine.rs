//! Lifecycle controller for the throttling engine.
//!
//! Owns the captured primitives, the environment tracker, and the critical
//! allowlist, and moves the engine between `Uninstalled` and `Installed`.
//! Transitions are idempotent: installing twice or uninstalling twice is a
//! [`LifecycleOutcome::NoOp`].
//!
//! The phase lock is only held to flip the phase. Host calls made during a
//! transition (capture, replace, restore, listener registration) run without
//! it, so a reentrant lifecycle call from inside host code sees the
//! `Transitioning` phase and returns `NoOp` instead of deadlocking.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use serde::{Deserialize, Serialize};

use crate::allowlist::CriticalCallbacks;
use crate::config::{ConfigStore, EnhancerConfig};
use crate::events::{Event, EventBus, EventKind, Subscription};
use crate::host::{Callback, GlobalScope, PrimitiveKind, SignalKind, SignalSource};
use crate::intercept::{
    InterceptContext, InterceptStats, InterceptStatsSnapshot, InterceptedPrimitiveSet,
};
use crate::level::{EnvironmentalState, ThrottleLevel};
use crate::policy::ThrottlePolicy;
use crate::tracker::EnvironmentTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninstalled,
    Transitioning,
    Installed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninstalled => write!(f, "uninstalled"),
            Self::Transitioning => write!(f, "transitioning"),
            Self::Installed => write!(f, "installed"),
        }
    }
}

struct Lifecycle {
    phase: Phase,
    primitives: InterceptedPrimitiveSet,
}

/// What a lifecycle transition changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionReport {
    /// Primitives now wrapped (install).
    pub wrapped: Vec<PrimitiveKind>,
    /// Primitives the host lacks or refused to replace (install).
    pub skipped: Vec<PrimitiveKind>,
    /// Signals the host could not deliver (install).
    pub unavailable_signals: Vec<SignalKind>,
    /// Primitives put back to their originals (uninstall).
    pub restored: Vec<PrimitiveKind>,
    /// Primitives the scope would not take back (uninstall). Retried on the
    /// next uninstall.
    pub restore_failed: Vec<PrimitiveKind>,
}

/// Result of [`ThrottleEngine::install`] and [`ThrottleEngine::uninstall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LifecycleOutcome {
    Transitioned(TransitionReport),
    /// Already in the requested state, or another transition is running.
    NoOp,
}

impl LifecycleOutcome {
    #[must_use]
    pub const fn is_transitioned(&self) -> bool {
        matches!(self, Self::Transitioned(_))
    }

    #[must_use]
    pub const fn report(&self) -> Option<&TransitionReport> {
        match self {
            Self::Transitioned(report) => Some(report),
            Self::NoOp => None,
        }
    }
}

/// Adaptive callback throttling engine.
///
/// One engine per page scope. Construct it with the scope whose primitives
/// it intercepts and the signal source it listens to, then call
/// [`install`](Self::install) or wire it to configuration with
/// [`attach`](Self::attach). Dropping the engine uninstalls it.
pub struct ThrottleEngine {
    scope: Arc<dyn GlobalScope>,
    signals: Arc<dyn SignalSource>,
    tracker: EnvironmentTracker,
    ctx: Arc<InterceptContext>,
    lifecycle: Mutex<Lifecycle>,
    bindings: Mutex<Vec<(Weak<EventBus>, Subscription)>>,
}

impl std::fmt::Debug for ThrottleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = self.lock_lifecycle();
        f.debug_struct("ThrottleEngine")
            .field("phase", &lifecycle.phase)
            .field("primitives", &lifecycle.primitives)
            .field("level", &self.current_level())
            .field("critical", &self.ctx.allowlist.len())
            .finish_non_exhaustive()
    }
}

impl ThrottleEngine {
    /// Engine with the default [`ThrottlePolicy`].
    #[must_use]
    pub fn new(scope: Arc<dyn GlobalScope>, signals: Arc<dyn SignalSource>) -> Self {
        Self::with_policy(scope, signals, ThrottlePolicy::default())
    }

    #[must_use]
    pub fn with_policy(
        scope: Arc<dyn GlobalScope>,
        signals: Arc<dyn SignalSource>,
        policy: ThrottlePolicy,
    ) -> Self {
        let tracker = EnvironmentTracker::new();
        let ctx = Arc::new(InterceptContext {
            tracker: tracker.state_handle(),
            allowlist: Arc::new(CriticalCallbacks::new()),
            policy: Arc::new(RwLock::new(policy.sanitized())),
            stats: Arc::new(InterceptStats::default()),
        });
        Self {
            scope,
            signals,
            tracker,
            ctx,
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Uninstalled,
                primitives: InterceptedPrimitiveSet::new(),
            }),
            bindings: Mutex::new(Vec::new()),
        }
    }

    /// Engine over a host that is both the scope and the signal source.
    #[must_use]
    pub fn for_host<H>(host: &Arc<H>) -> Self
    where
        H: GlobalScope + SignalSource + 'static,
    {
        let scope: Arc<dyn GlobalScope> = Arc::clone(host) as Arc<dyn GlobalScope>;
        let signals: Arc<dyn SignalSource> = Arc::clone(host) as Arc<dyn SignalSource>;
        Self::new(scope, signals)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Capture the originals, start the tracker, and install the wrappers.
    pub fn install(&self) -> LifecycleOutcome {
        let Some(mut primitives) = self.begin(Phase::Uninstalled) else {
            return LifecycleOutcome::NoOp;
        };

        let missing = primitives.capture(self.scope.as_ref());
        if !missing.is_empty() {
            tracing::debug!(?missing, "host lacks some scheduling primitives");
        }
        let started = self.tracker.start(&self.scope, self.signals.as_ref());
        let summary = primitives.replace(self.scope.as_ref(), &self.ctx);

        self.finish(Phase::Installed, primitives);

        tracing::info!(
            wrapped = summary.wrapped.len(),
            skipped = summary.skipped.len(),
            listeners = started.listeners,
            level = %started.initial.level(),
            "throttle engine installed"
        );

        LifecycleOutcome::Transitioned(TransitionReport {
            wrapped: summary.wrapped,
            skipped: summary.skipped,
            unavailable_signals: started.unavailable,
            ..TransitionReport::default()
        })
    }

    /// Restore the originals, stop the tracker, and clear the allowlist.
    pub fn uninstall(&self) -> LifecycleOutcome {
        let Some(mut primitives) = self.begin(Phase::Installed) else {
            return LifecycleOutcome::NoOp;
        };

        let summary = primitives.restore(self.scope.as_ref());
        self.tracker.stop(self.signals.as_ref());
        self.ctx.allowlist.clear();

        self.finish(Phase::Uninstalled, primitives);

        tracing::info!(
            restored = summary.restored.len(),
            restore_failed = summary.failed.len(),
            "throttle engine uninstalled"
        );

        LifecycleOutcome::Transitioned(TransitionReport {
            restored: summary.restored,
            restore_failed: summary.failed,
            ..TransitionReport::default()
        })
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.lock_lifecycle().phase == Phase::Installed
    }

    fn begin(&self, from: Phase) -> Option<InterceptedPrimitiveSet> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.phase != from {
            tracing::debug!(phase = %lifecycle.phase, "lifecycle call ignored");
            return None;
        }
        lifecycle.phase = Phase::Transitioning;
        Some(std::mem::take(&mut lifecycle.primitives))
    }

    fn finish(&self, to: Phase, primitives: InterceptedPrimitiveSet) {
        let mut lifecycle = self.lock_lifecycle();
        lifecycle.phase = to;
        lifecycle.primitives = primitives;
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Allowlist and level
    // -------------------------------------------------------------------------

    /// Exempt `callback` from throttling. Returns false if already marked.
    pub fn mark_critical(&self, callback: &Callback) -> bool {
        self.ctx.allowlist.mark(callback)
    }

    /// Remove the exemption. Returns false if `callback` was not marked.
    pub fn unmark_critical(&self, callback: &Callback) -> bool {
        self.ctx.allowlist.unmark(callback)
    }

    #[must_use]
    pub fn is_critical(&self, callback: &Callback) -> bool {
        self.ctx.allowlist.is_critical(callback)
    }

    /// Current throttle level. Always `Active` while uninstalled.
    #[must_use]
    pub fn current_level(&self) -> ThrottleLevel {
        self.tracker.current_level()
    }

    #[must_use]
    pub fn environment(&self) -> EnvironmentalState {
        self.tracker.snapshot()
    }

    // -------------------------------------------------------------------------
    // Policy and stats
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn policy(&self) -> ThrottlePolicy {
        *self.ctx.policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the policy. Applies to registrations made from now on.
    pub fn set_policy(&self, policy: ThrottlePolicy) {
        let policy = policy.sanitized();
        *self.ctx.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
        tracing::debug!(frame_mode = ?policy.frame_mode, "throttle policy updated");
    }

    #[must_use]
    pub fn stats(&self) -> InterceptStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.ctx.stats.reset();
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Apply the throttle policy from `config`, then install or uninstall
    /// according to `features.adaptive_throttling`.
    pub fn apply_config(&self, config: &EnhancerConfig) -> LifecycleOutcome {
        self.set_policy(config.throttle);
        if config.features.adaptive_throttling {
            self.install()
        } else {
            self.uninstall()
        }
    }

    /// React to `ConfigChanged` and `PageUnload` on `bus`.
    ///
    /// Handlers hold a weak reference, so the bus never keeps the engine
    /// alive. Binding the same bus twice is ignored.
    pub fn bind(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let mut bindings = self.lock_bindings();
        if bindings
            .iter()
            .any(|(bound, _)| std::ptr::eq(bound.as_ptr(), Arc::as_ptr(bus)))
        {
            return;
        }

        let weak = Arc::downgrade(self);
        let on_config = bus.subscribe(
            EventKind::ConfigChanged,
            Arc::new(move |event: &Event| {
                if let (Some(engine), Event::ConfigChanged { config }) = (weak.upgrade(), event) {
                    engine.apply_config(config);
                }
            }),
        );

        let weak = Arc::downgrade(self);
        let on_unload = bus.subscribe(
            EventKind::PageUnload,
            Arc::new(move |_: &Event| {
                if let Some(engine) = weak.upgrade() {
                    engine.uninstall();
                }
            }),
        );

        bindings.push((Arc::downgrade(bus), on_config));
        bindings.push((Arc::downgrade(bus), on_unload));
    }

    /// Remove every bus subscription made by [`bind`](Self::bind).
    pub fn unbind(&self) {
        let bindings = std::mem::take(&mut *self.lock_bindings());
        for (bus, subscription) in bindings {
            if let Some(bus) = bus.upgrade() {
                bus.unsubscribe(&subscription);
            }
        }
    }

    /// Bind to `bus` and apply the configuration currently in `store`.
    pub fn attach(self: &Arc<Self>, store: &ConfigStore, bus: &Arc<EventBus>) -> LifecycleOutcome {
        self.bind(bus);
        self.apply_config(&store.load())
    }

    fn lock_bindings(&self) -> MutexGuard<'_, Vec<(Weak<EventBus>, Subscription)>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ThrottleEngine {
    fn drop(&mut self) {
        self.unbind();
        self.uninstall();
    }
}
