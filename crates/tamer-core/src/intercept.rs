//! Scheduling interception layer.
//!
//! Each intercepted primitive is replaced by a wrapper that holds the
//! captured original. On every registration the wrapper
//!
//! 1. delivers critical callbacks unchanged,
//! 2. otherwise applies the [`ThrottlePolicy`] floor for the current level,
//! 3. delegates to the original and returns its [`TimerId`] untouched, so the
//!    host's (unwrapped) cancellation primitives keep working.
//!
//! The wrapper never panics outward. If the allowlist or policy cannot be
//! read, or the decision itself panics, it delegates with the requested
//! delay: an internal fault may cost throttling but never changes what the
//! page asked for.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allowlist::CriticalCallbacks;
use crate::error::panic_message;
use crate::host::{Callback, GlobalScope, Primitive, PrimitiveKind, TimerId, same_primitive};
use crate::policy::{Adjustment, ThrottlePolicy};
use crate::tracker::TrackerState;

// =============================================================================
// Statistics
// =============================================================================

/// In-memory registration counters. Never persisted.
#[derive(Debug, Default)]
pub struct InterceptStats {
    passthrough: AtomicU64,
    floored: AtomicU64,
    critical: AtomicU64,
    fail_open: AtomicU64,
    skipped_frames: AtomicU64,
}

/// Point-in-time copy of [`InterceptStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptStatsSnapshot {
    /// Delivered with the requested delay because no floor applied.
    pub passthrough: u64,
    /// Delivered with a raised delay.
    pub floored: u64,
    /// Delivered unchanged because the callback is marked critical.
    pub critical: u64,
    /// Delivered unchanged because the decision failed.
    pub fail_open: u64,
    /// Frame registrations whose body was skipped.
    pub skipped_frames: u64,
}

impl InterceptStatsSnapshot {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.passthrough + self.floored + self.critical + self.fail_open
    }
}

impl InterceptStats {
    #[must_use]
    pub fn snapshot(&self) -> InterceptStatsSnapshot {
        InterceptStatsSnapshot {
            passthrough: self.passthrough.load(Ordering::Relaxed),
            floored: self.floored.load(Ordering::Relaxed),
            critical: self.critical.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            skipped_frames: self.skipped_frames.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.passthrough,
            &self.floored,
            &self.critical,
            &self.fail_open,
            &self.skipped_frames,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Everything a wrapper consults on the scheduling path.
#[derive(Debug, Clone)]
pub struct InterceptContext {
    pub tracker: Arc<TrackerState>,
    pub allowlist: Arc<CriticalCallbacks>,
    pub policy: Arc<RwLock<ThrottlePolicy>>,
    pub stats: Arc<InterceptStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Critical,
    Adjusted(Adjustment),
}

#[derive(Debug, thiserror::Error)]
enum DecisionFault {
    #[error(transparent)]
    Allowlist(#[from] crate::allowlist::AllowlistPoisoned),
    #[error("throttle policy is poisoned")]
    PolicyPoisoned,
}

impl InterceptContext {
    fn decide(
        &self,
        kind: PrimitiveKind,
        callback: &Callback,
        requested: Duration,
    ) -> Result<Decision, DecisionFault> {
        if self.allowlist.check(callback)? {
            return Ok(Decision::Critical);
        }
        let level = self.tracker.level();
        let policy = self
            .policy
            .read()
            .map_err(|_| DecisionFault::PolicyPoisoned)?;
        Ok(Decision::Adjusted(policy.adjust(kind, level, requested)))
    }

    /// Resolve the delivery for one registration, recording stats. Never
    /// panics.
    fn resolve(&self, kind: PrimitiveKind, callback: &Callback, requested: Duration) -> Adjustment {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.decide(kind, callback, requested)));
        match outcome {
            Ok(Ok(Decision::Critical)) => {
                InterceptStats::bump(&self.stats.critical);
                Adjustment::unchanged(requested)
            }
            Ok(Ok(Decision::Adjusted(adjustment))) => {
                if adjustment.is_floored() {
                    InterceptStats::bump(&self.stats.floored);
                } else {
                    InterceptStats::bump(&self.stats.passthrough);
                }
                if adjustment.skip_body {
                    InterceptStats::bump(&self.stats.skipped_frames);
                }
                adjustment
            }
            Ok(Err(fault)) => {
                InterceptStats::bump(&self.stats.fail_open);
                tracing::warn!(
                    kind = %kind,
                    error = %fault,
                    "throttle decision failed; delivering unchanged"
                );
                Adjustment::unchanged(requested)
            }
            Err(payload) => {
                InterceptStats::bump(&self.stats.fail_open);
                tracing::warn!(
                    kind = %kind,
                    panic = %panic_message(payload.as_ref()),
                    "throttle decision panicked; delivering unchanged"
                );
                Adjustment::unchanged(requested)
            }
        }
    }
}

/// Build the delay-adjusting wrapper for `kind` around `original`.
#[must_use]
pub fn wrap(kind: PrimitiveKind, original: Primitive, ctx: Arc<InterceptContext>) -> Primitive {
    Arc::new(move |callback: Callback, requested: Duration| -> TimerId {
        let adjustment = ctx.resolve(kind, &callback, requested);
        let delivered: Callback = if adjustment.skip_body {
            Arc::new(|| {})
        } else {
            callback
        };
        tracing::trace!(
            kind = %kind,
            requested_ms = u64::try_from(adjustment.requested.as_millis()).unwrap_or(u64::MAX),
            effective_ms = u64::try_from(adjustment.effective.as_millis()).unwrap_or(u64::MAX),
            skip_body = adjustment.skip_body,
            "registration intercepted"
        );
        original(delivered, adjustment.effective)
    })
}

// =============================================================================
// Primitive set
// =============================================================================

#[derive(Default)]
struct Slot {
    original: Option<Primitive>,
    wrapper: Option<Primitive>,
    replaced: bool,
}

/// Which primitives an install pass touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceSummary {
    pub wrapped: Vec<PrimitiveKind>,
    pub skipped: Vec<PrimitiveKind>,
}

/// Which primitives an uninstall pass put back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub restored: Vec<PrimitiveKind>,
    /// Still wrapped because the scope rejected the original.
    pub failed: Vec<PrimitiveKind>,
}

/// Captured originals and wrappers, one slot per [`PrimitiveKind`].
#[derive(Default)]
pub struct InterceptedPrimitiveSet {
    slots: [Slot; 3],
}

impl std::fmt::Debug for InterceptedPrimitiveSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for kind in PrimitiveKind::ALL {
            let slot = &self.slots[kind.index()];
            map.entry(
                &kind,
                &format_args!(
                    "captured={} replaced={}",
                    slot.original.is_some(),
                    slot.replaced
                ),
            );
        }
        map.finish()
    }
}

impl InterceptedPrimitiveSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the scope's current primitives. Kinds the host lacks are
    /// returned and left empty.
    ///
    /// Must run once per install cycle, before [`replace`](Self::replace).
    /// Slots whose wrapper could not be removed by the last
    /// [`restore`](Self::restore) keep their original; capturing again would
    /// capture our own wrapper.
    pub fn capture(&mut self, scope: &dyn GlobalScope) -> Vec<PrimitiveKind> {
        let mut missing = Vec::new();
        for kind in PrimitiveKind::ALL {
            let slot = &mut self.slots[kind.index()];
            if slot.replaced {
                tracing::debug!(kind = %kind, "keeping original from an unfinished restore");
                continue;
            }
            *slot = Slot::default();
            match scope.primitive(kind) {
                Some(original) => slot.original = Some(original),
                None => missing.push(kind),
            }
        }
        missing
    }

    /// Install a wrapper for every captured primitive. Slots already
    /// wrapped are reported as wrapped and left alone.
    pub fn replace(
        &mut self,
        scope: &dyn GlobalScope,
        ctx: &Arc<InterceptContext>,
    ) -> ReplaceSummary {
        let mut summary = ReplaceSummary::default();
        for kind in PrimitiveKind::ALL {
            let slot = &mut self.slots[kind.index()];
            let Some(original) = slot.original.clone() else {
                tracing::warn!(kind = %kind, "scheduling primitive unavailable; not wrapping");
                summary.skipped.push(kind);
                continue;
            };
            if slot.replaced {
                summary.wrapped.push(kind);
                continue;
            }
            let wrapper = wrap(kind, original, Arc::clone(ctx));
            match scope.set_primitive(kind, Arc::clone(&wrapper)) {
                Ok(()) => {
                    slot.wrapper = Some(wrapper);
                    slot.replaced = true;
                    summary.wrapped.push(kind);
                }
                Err(err) => {
                    tracing::warn!(
                        kind = %kind,
                        error = %err,
                        "failed to replace primitive; skipping"
                    );
                    summary.skipped.push(kind);
                }
            }
        }
        summary
    }

    /// Put every captured original back and forget the capture.
    ///
    /// A slot whose original the scope refuses to take back stays captured
    /// and is reported in [`RestoreSummary::failed`]; the next install reuses
    /// it and the next uninstall retries it.
    pub fn restore(&mut self, scope: &dyn GlobalScope) -> RestoreSummary {
        let mut summary = RestoreSummary::default();
        for kind in PrimitiveKind::ALL {
            let slot = &mut self.slots[kind.index()];
            if !slot.replaced {
                *slot = Slot::default();
                continue;
            }
            let Some(original) = slot.original.clone() else {
                *slot = Slot::default();
                continue;
            };
            if let (Some(current), Some(ours)) = (scope.primitive(kind), slot.wrapper.as_ref()) {
                if !same_primitive(&current, ours) {
                    tracing::warn!(
                        kind = %kind,
                        "primitive was replaced by a third party; restoring original anyway"
                    );
                }
            }
            match scope.set_primitive(kind, original) {
                Ok(()) => {
                    *slot = Slot::default();
                    summary.restored.push(kind);
                }
                Err(err) => {
                    tracing::error!(
                        kind = %kind,
                        error = %err,
                        "failed to restore primitive; keeping original for retry"
                    );
                    summary.failed.push(kind);
                }
            }
        }
        summary
    }

    /// The original captured for `kind` in the current cycle.
    #[must_use]
    pub fn original(&self, kind: PrimitiveKind) -> Option<&Primitive> {
        self.slots[kind.index()].original.as_ref()
    }

    #[must_use]
    pub fn is_replaced(&self, kind: PrimitiveKind) -> bool {
        self.slots[kind.index()].replaced
    }

    #[must_use]
    pub fn any_replaced(&self) -> bool {
        self.slots.iter().any(|slot| slot.replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::ThrottleLevel;
    use crate::policy::FrameMode;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<(usize, Duration)>>>;

    /// Primitive that records (callback identity, delay) and returns a
    /// counter id.
    fn recording_primitive(calls: &Calls) -> Primitive {
        let calls = Arc::clone(calls);
        Arc::new(move |cb: Callback, delay: Duration| {
            let mut calls = calls.lock().unwrap();
            calls.push((crate::host::callback_key(&cb), delay));
            TimerId(calls.len() as u64)
        })
    }

    fn context() -> Arc<InterceptContext> {
        Arc::new(InterceptContext {
            tracker: Arc::new(TrackerState::default()),
            allowlist: Arc::new(CriticalCallbacks::new()),
            policy: Arc::new(RwLock::new(ThrottlePolicy::default())),
            stats: Arc::new(InterceptStats::default()),
        })
    }

    fn hidden_idle_context() -> Arc<InterceptContext> {
        let ctx = context();
        let host = crate::sim::VirtualHost::new();
        host.set_hidden(true);
        let tracker = crate::tracker::EnvironmentTracker::new();
        tracker.start(&(Arc::clone(&host) as Arc<dyn GlobalScope>), host.as_ref());
        Arc::new(InterceptContext {
            tracker: tracker.state_handle(),
            ..(*ctx).clone()
        })
    }

    #[test]
    fn wrapper_passes_through_when_active() {
        let calls: Calls = Arc::default();
        let ctx = context();
        let wrapped = wrap(PrimitiveKind::Periodic, recording_primitive(&calls), Arc::clone(&ctx));

        let cb: Callback = Arc::new(|| {});
        let id = wrapped(Arc::clone(&cb), Duration::from_millis(200));

        assert_eq!(id, TimerId(1));
        let calls = calls.lock().unwrap();
        assert_eq!(calls[0], (crate::host::callback_key(&cb), Duration::from_millis(200)));
        assert_eq!(ctx.stats.snapshot().passthrough, 1);
    }

    #[test]
    fn wrapper_applies_floor_when_hidden() {
        let calls: Calls = Arc::default();
        let ctx = hidden_idle_context();
        assert_eq!(ctx.tracker.level(), ThrottleLevel::BackgroundIdle);
        let wrapped = wrap(PrimitiveKind::OneShot, recording_primitive(&calls), Arc::clone(&ctx));

        wrapped(Arc::new(|| {}), Duration::from_millis(500));

        assert_eq!(calls.lock().unwrap()[0].1, Duration::from_millis(10_000));
        assert_eq!(ctx.stats.snapshot().floored, 1);
    }

    #[test]
    fn critical_callback_is_never_floored() {
        let calls: Calls = Arc::default();
        let ctx = hidden_idle_context();
        let wrapped = wrap(PrimitiveKind::Periodic, recording_primitive(&calls), Arc::clone(&ctx));

        let tick: Callback = Arc::new(|| {});
        ctx.allowlist.mark(&tick);
        wrapped(Arc::clone(&tick), Duration::from_millis(500));

        assert_eq!(calls.lock().unwrap()[0].1, Duration::from_millis(500));
        assert_eq!(ctx.stats.snapshot().critical, 1);
    }

    #[test]
    fn skip_mode_swaps_the_body() {
        let calls: Calls = Arc::default();
        let ctx = hidden_idle_context();
        *ctx.policy.write().unwrap() = ThrottlePolicy {
            frame_mode: FrameMode::Skip,
            ..ThrottlePolicy::default()
        };
        let wrapped = wrap(
            PrimitiveKind::FrameAligned,
            recording_primitive(&calls),
            Arc::clone(&ctx),
        );

        let frame: Callback = Arc::new(|| {});
        wrapped(Arc::clone(&frame), Duration::ZERO);

        let calls = calls.lock().unwrap();
        assert_ne!(calls[0].0, crate::host::callback_key(&frame));
        assert_eq!(calls[0].1, Duration::from_millis(1_000));
        assert_eq!(ctx.stats.snapshot().skipped_frames, 1);
    }

    #[test]
    fn poisoned_policy_fails_open() {
        let calls: Calls = Arc::default();
        let ctx = hidden_idle_context();
        let policy = Arc::clone(&ctx.policy);
        let _ = std::thread::spawn(move || {
            let _guard = policy.write().unwrap();
            panic!("poison policy");
        })
        .join();

        let wrapped = wrap(PrimitiveKind::Periodic, recording_primitive(&calls), Arc::clone(&ctx));
        wrapped(Arc::new(|| {}), Duration::from_millis(200));

        assert_eq!(calls.lock().unwrap()[0].1, Duration::from_millis(200));
        assert_eq!(ctx.stats.snapshot().fail_open, 1);
    }

    #[test]
    fn capture_replace_restore_cycle() {
        let host = crate::sim::VirtualHost::new();
        let originals: Vec<Primitive> = PrimitiveKind::ALL
            .iter()
            .map(|k| host.primitive(*k).unwrap())
            .collect();

        let mut set = InterceptedPrimitiveSet::new();
        assert!(set.capture(host.as_ref()).is_empty());
        let summary = set.replace(host.as_ref(), &context());
        assert_eq!(summary.wrapped, PrimitiveKind::ALL.to_vec());
        assert!(summary.skipped.is_empty());

        for (kind, original) in PrimitiveKind::ALL.iter().zip(&originals) {
            assert!(set.is_replaced(*kind));
            assert!(same_primitive(set.original(*kind).unwrap(), original));
            assert!(!same_primitive(&host.primitive(*kind).unwrap(), original));
        }

        let summary = set.restore(host.as_ref());
        assert_eq!(summary.restored, PrimitiveKind::ALL.to_vec());
        assert!(summary.failed.is_empty());
        for (kind, original) in PrimitiveKind::ALL.iter().zip(&originals) {
            assert!(same_primitive(&host.primitive(*kind).unwrap(), original));
            assert!(!set.is_replaced(*kind));
        }
        assert!(!set.any_replaced());
    }

    #[test]
    fn rejected_restore_keeps_the_original() {
        let host = crate::sim::VirtualHost::new();
        let native = host.primitive(PrimitiveKind::OneShot).unwrap();
        let ctx = context();

        let mut set = InterceptedPrimitiveSet::new();
        set.capture(host.as_ref());
        set.replace(host.as_ref(), &ctx);
        let wrapper = host.primitive(PrimitiveKind::OneShot).unwrap();

        host.set_sealed(PrimitiveKind::OneShot, true);
        let summary = set.restore(host.as_ref());
        assert_eq!(summary.restored, vec![PrimitiveKind::Periodic, PrimitiveKind::FrameAligned]);
        assert_eq!(summary.failed, vec![PrimitiveKind::OneShot]);
        assert!(set.is_replaced(PrimitiveKind::OneShot));
        assert!(same_primitive(set.original(PrimitiveKind::OneShot).unwrap(), &native));

        // Reinstalling reuses the slot instead of wrapping our own wrapper.
        set.capture(host.as_ref());
        assert!(same_primitive(set.original(PrimitiveKind::OneShot).unwrap(), &native));
        let summary = set.replace(host.as_ref(), &ctx);
        assert_eq!(summary.wrapped, PrimitiveKind::ALL.to_vec());
        assert!(same_primitive(&host.primitive(PrimitiveKind::OneShot).unwrap(), &wrapper));

        host.set_sealed(PrimitiveKind::OneShot, false);
        let summary = set.restore(host.as_ref());
        assert_eq!(summary.restored, PrimitiveKind::ALL.to_vec());
        assert!(same_primitive(&host.primitive(PrimitiveKind::OneShot).unwrap(), &native));
        assert!(!set.any_replaced());
    }

    #[test]
    fn missing_primitive_is_skipped() {
        let host = crate::sim::VirtualHost::builder()
            .without_primitive(PrimitiveKind::FrameAligned)
            .build();
        let mut set = InterceptedPrimitiveSet::new();
        assert_eq!(set.capture(host.as_ref()), vec![PrimitiveKind::FrameAligned]);

        let summary = set.replace(host.as_ref(), &context());
        assert_eq!(summary.wrapped, vec![PrimitiveKind::Periodic, PrimitiveKind::OneShot]);
        assert_eq!(summary.skipped, vec![PrimitiveKind::FrameAligned]);
        assert!(host.primitive(PrimitiveKind::FrameAligned).is_none());
    }

    #[test]
    fn stats_total_and_reset() {
        let stats = InterceptStats::default();
        InterceptStats::bump(&stats.floored);
        InterceptStats::bump(&stats.critical);
        InterceptStats::bump(&stats.skipped_frames);
        assert_eq!(stats.snapshot().total(), 2);
        stats.reset();
        assert_eq!(stats.snapshot(), InterceptStatsSnapshot::default());
    }
}
