//! Host environment capabilities.
//!
//! The engine never reaches for page globals directly. Everything it touches
//! is injected through two capabilities:
//!
//! - [`GlobalScope`]: the table of scheduling primitives (periodic, one-shot,
//!   frame-aligned) that page code calls, plus the host's visibility flag.
//! - [`SignalSource`]: visibility and media-playback notifications.
//!
//! Cancellation primitives are deliberately absent from [`GlobalScope`]: they
//! are never wrapped, so hosts expose them however they like and they keep
//! operating on the [`TimerId`] the original registration returned.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

/// A deferred callback handed to a scheduling primitive.
///
/// Identity (not behaviour) is what the critical-callback allowlist keys on:
/// two clones of the same `Arc` are the same callback, two separately
/// allocated closures never are.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// A registration primitive: takes a callback and a requested delay and
/// returns the host's cancellation token.
///
/// Frame-aligned primitives interpret the delay as "not before": zero means
/// the next frame.
pub type Primitive = Arc<dyn Fn(Callback, Duration) -> TimerId + Send + Sync>;

/// Opaque cancellation token returned by a host primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerId(pub u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// The three kinds of deferred-callback registration the engine intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    /// Repeating callback at a fixed interval.
    Periodic,
    /// Single callback after a delay.
    OneShot,
    /// Callback aligned to the host's render cadence.
    FrameAligned,
}

impl PrimitiveKind {
    /// All kinds, in install order.
    pub const ALL: [Self; 3] = [Self::Periodic, Self::OneShot, Self::FrameAligned];

    /// Stable slot index (0-2).
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Periodic => 0,
            Self::OneShot => 1,
            Self::FrameAligned => 2,
        }
    }
}

impl std::fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Periodic => write!(f, "periodic"),
            Self::OneShot => write!(f, "one_shot"),
            Self::FrameAligned => write!(f, "frame_aligned"),
        }
    }
}

/// Environmental notifications the tracker listens for.
///
/// Media notifications are document-scoped: the host reports play/pause/end
/// for any media element on the page, whichever element raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    VisibilityChange,
    MediaPlay,
    MediaPause,
    MediaEnded,
}

impl SignalKind {
    pub const ALL: [Self; 4] = [
        Self::VisibilityChange,
        Self::MediaPlay,
        Self::MediaPause,
        Self::MediaEnded,
    ];

    /// True for the three media-playback notifications.
    #[must_use]
    pub const fn is_media(self) -> bool {
        matches!(self, Self::MediaPlay | Self::MediaPause | Self::MediaEnded)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VisibilityChange => write!(f, "visibility_change"),
            Self::MediaPlay => write!(f, "media_play"),
            Self::MediaPause => write!(f, "media_pause"),
            Self::MediaEnded => write!(f, "media_ended"),
        }
    }
}

/// Listener invoked with the kind of signal that fired.
pub type SignalHandler = Arc<dyn Fn(SignalKind) + Send + Sync>;

/// Token returned by [`SignalSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// The page-global scope whose scheduling primitives get intercepted.
pub trait GlobalScope: Send + Sync {
    /// Current function installed for `kind`, or `None` when the host lacks it.
    fn primitive(&self, kind: PrimitiveKind) -> Option<Primitive>;

    /// Replace the function installed for `kind`.
    ///
    /// Fails with [`Error::PrimitiveUnavailable`](crate::Error::PrimitiveUnavailable)
    /// when the host has no such slot.
    fn set_primitive(&self, kind: PrimitiveKind, primitive: Primitive) -> Result<()>;

    /// The host's current visibility flag, or `None` when the host has no
    /// visibility API.
    fn is_hidden(&self) -> Option<bool>;
}

/// Injectable notifier for visibility and media signals.
pub trait SignalSource: Send + Sync {
    /// Register `handler` for `kind`.
    ///
    /// Fails with [`Error::SignalSourceUnavailable`](crate::Error::SignalSourceUnavailable)
    /// when the host cannot deliver that signal.
    fn subscribe(&self, kind: SignalKind, handler: SignalHandler) -> Result<SubscriptionId>;

    /// Remove a registration. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Address of the allocation behind a callback, used as its identity.
#[must_use]
pub fn callback_key(callback: &Callback) -> usize {
    Arc::as_ptr(callback).cast::<()>() as usize
}

/// True when both handles point at the same primitive function object.
#[must_use]
pub fn same_primitive(a: &Primitive, b: &Primitive) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Listener table shared by the bundled hosts.
///
/// Dispatch snapshots the matching handlers and releases the lock before
/// calling them, so handlers may subscribe or unsubscribe freely. A handler
/// that panics is logged and skipped; the others still run.
#[derive(Default)]
pub struct SignalRegistry {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<SubscriptionId, (SignalKind, SignalHandler)>>,
}

impl SignalRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: SignalKind, handler: SignalHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (kind, handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Number of live registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `kind` to every matching handler; returns how many ran to
    /// completion.
    pub fn dispatch(&self, kind: SignalKind) -> usize {
        let handlers: Vec<SignalHandler> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, h)| Arc::clone(h))
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(kind))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let err = Error::handler_panicked(format!("signal {kind}"), payload.as_ref());
                    tracing::error!(signal = %kind, error = %err, "signal handler panicked");
                }
            }
        }
        delivered
    }
}
