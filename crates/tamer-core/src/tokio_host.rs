//! Runtime host backed by `tokio::time`.
//!
//! Every registration becomes a spawned task: one-shot timers sleep once,
//! periodic timers tick on a [`tokio::time::Interval`], and frame requests
//! sleep for their "not before" hint and then wait for the next frame
//! boundary. Cancellation aborts the task.
//!
//! Requires a tokio runtime with the time driver enabled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::host::{
    Callback, GlobalScope, Primitive, PrimitiveKind, SignalHandler, SignalKind, SignalRegistry,
    SignalSource, SubscriptionId, TimerId,
};
use crate::sim::{DEFAULT_FRAME_INTERVAL_MS, next_frame_boundary};
use crate::Result;

struct HostState {
    primitives: [Option<Primitive>; 3],
    tasks: HashMap<TimerId, AbortHandle>,
    hidden: bool,
}

/// Host whose timers run on a tokio runtime.
pub struct TokioHost {
    me: Weak<TokioHost>,
    runtime: Handle,
    epoch: Instant,
    frame_interval_ms: u64,
    next_timer: AtomicU64,
    state: Mutex<HostState>,
    signals: SignalRegistry,
}

impl std::fmt::Debug for TokioHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("TokioHost")
            .field("pending", &state.tasks.len())
            .field("hidden", &state.hidden)
            .field("listeners", &self.signals.len())
            .finish_non_exhaustive()
    }
}

impl TokioHost {
    /// Host on the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Arc<Self> {
        Self::new(Handle::current())
    }

    #[must_use]
    pub fn new(runtime: Handle) -> Arc<Self> {
        Self::with_frame_interval(runtime, Duration::from_millis(DEFAULT_FRAME_INTERVAL_MS))
    }

    #[must_use]
    pub fn with_frame_interval(runtime: Handle, frame_interval: Duration) -> Arc<Self> {
        let epoch = {
            let _guard = runtime.enter();
            Instant::now()
        };
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let mut primitives: [Option<Primitive>; 3] = [None, None, None];
            for kind in PrimitiveKind::ALL {
                primitives[kind.index()] = Some(native_primitive(weak.clone(), kind));
            }
            Self {
                me: weak.clone(),
                runtime,
                epoch,
                frame_interval_ms: (frame_interval.as_millis() as u64).max(1),
                next_timer: AtomicU64::new(0),
                state: Mutex::new(HostState {
                    primitives,
                    tasks: HashMap::new(),
                    hidden: false,
                }),
                signals: SignalRegistry::new(),
            }
        })
    }

    /// Call the primitive currently installed for `kind`, as page code would.
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

    /// Abort a pending registration. Returns false for ids that already
    /// fired (one-shot, frame) or were never issued.
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.lock().tasks.remove(&id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Flip the visibility flag and notify visibility listeners.
    pub fn set_hidden(&self, hidden: bool) {
        self.lock().hidden = hidden;
        self.signals.dispatch(SignalKind::VisibilityChange);
    }

    pub fn media(&self, kind: SignalKind) {
        debug_assert!(kind.is_media(), "media() expects a media signal");
        self.signals.dispatch(kind);
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().tasks.len()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.signals.len()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, kind: PrimitiveKind, callback: Callback, delay: Duration) -> TimerId {
        let id = TimerId(self.next_timer.fetch_add(1, Ordering::Relaxed) + 1);
        let host = self.me.clone();

        // Hold the lock across spawn so a fast one-shot cannot finish and
        // deregister before its handle is recorded.
        let mut state = self.lock();
        let task = match kind {
            PrimitiveKind::Periodic => {
                let every = delay.max(Duration::from_millis(1));
                self.runtime.spawn(async move {
                    let mut ticks = tokio::time::interval_at(Instant::now() + every, every);
                    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticks.tick().await;
                        callback();
                    }
                })
            }
            PrimitiveKind::OneShot => self.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                finish(&host, id);
                callback();
            }),
            PrimitiveKind::FrameAligned => {
                let epoch = self.epoch;
                let interval = self.frame_interval_ms;
                self.runtime.spawn(async move {
                    let now = Instant::now().saturating_duration_since(epoch).as_millis() as u64;
                    let boundary = next_frame_boundary(now, delay.as_millis() as u64, interval);
                    tokio::time::sleep_until(epoch + Duration::from_millis(boundary)).await;
                    finish(&host, id);
                    callback();
                })
            }
        };
        state.tasks.insert(id, task.abort_handle());
        id
    }
}

fn finish(host: &Weak<TokioHost>, id: TimerId) {
    if let Some(host) = host.upgrade() {
        host.lock().tasks.remove(&id);
    }
}

fn native_primitive(host: Weak<TokioHost>, kind: PrimitiveKind) -> Primitive {
    Arc::new(move |callback: Callback, delay: Duration| {
        host.upgrade()
            .map_or(TimerId(0), |host| host.schedule(kind, callback, delay))
    })
}

impl Drop for TokioHost {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in state.tasks.drain() {
            task.abort();
        }
    }
}

impl GlobalScope for TokioHost {
    fn primitive(&self, kind: PrimitiveKind) -> Option<Primitive> {
        self.lock().primitives[kind.index()].clone()
    }

    fn set_primitive(&self, kind: PrimitiveKind, primitive: Primitive) -> Result<()> {
        self.lock().primitives[kind.index()] = Some(primitive);
        Ok(())
    }

    fn is_hidden(&self) -> Option<bool> {
        Some(self.lock().hidden)
    }
}

impl SignalSource for TokioHost {
    fn subscribe(&self, kind: SignalKind, handler: SignalHandler) -> Result<SubscriptionId> {
        Ok(self.signals.subscribe(kind, handler))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.signals.unsubscribe(id);
    }
}
