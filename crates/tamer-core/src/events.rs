//! Event bus for configuration changes and page lifecycle.
//!
//! Publish/subscribe transport between the config store and interested
//! components. Subscribers get an explicit [`Subscription`] token and must
//! hand it back to stop receiving events; nothing polls.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::config::EnhancerConfig;
use crate::error::Error;

/// Event types that flow through the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A configuration was saved; carries the saved configuration.
    ConfigChanged { config: EnhancerConfig },

    /// The page is going away; components should release host resources.
    PageUnload,
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ConfigChanged { .. } => EventKind::ConfigChanged,
            Self::PageUnload => EventKind::PageUnload,
        }
    }
}

/// Discriminant used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConfigChanged,
    PageUnload,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigChanged => write!(f, "config_changed"),
            Self::PageUnload => write!(f, "page_unload"),
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "dropping the token makes the subscription impossible to remove"]
pub struct Subscription {
    id: u64,
    kind: EventKind,
}

impl Subscription {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }
}

/// Event bus for distributing events to subscribers
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<EventKind, Vec<(u64, EventHandler)>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().entry(kind).or_default().push((id, handler));
        Subscription { id, kind }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut handlers = self.lock();
        let Some(list) = handlers.get_mut(&subscription.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        list.len() != before
    }

    /// Publish an event to all subscribers of its kind.
    ///
    /// Handlers are snapshotted first, so a handler may subscribe or
    /// unsubscribe during delivery. A panicking handler is logged and does
    /// not stop delivery to the others. Returns how many handlers completed.
    pub fn publish(&self, event: &Event) -> usize {
        let kind = event.kind();
        let snapshot: Vec<EventHandler> = self
            .lock()
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let err = Error::handler_panicked(format!("event {kind}"), payload.as_ref());
                    tracing::error!(event = %kind, error = %err, "event handler panicked");
                }
            }
        }
        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<EventKind, Vec<(u64, EventHandler)>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(hits: &Arc<AtomicUsize>) -> EventHandler {
        let hits = Arc::clone(hits);
        Arc::new(move |_: &Event| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn event_serializes() {
        let json = serde_json::to_string(&Event::PageUnload).unwrap();
        assert_eq!(json, r#"{"type":"page_unload"}"#);

        let event = Event::ConfigChanged {
            config: EnhancerConfig::default(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("config_changed"));
        assert!(json.contains("adaptive_throttling"));
    }

    #[test]
    fn publish_reaches_matching_subscribers_only() {
        let bus = EventBus::new();
        let config_hits = Arc::new(AtomicUsize::new(0));
        let unload_hits = Arc::new(AtomicUsize::new(0));
        let _a = bus.subscribe(EventKind::ConfigChanged, counting(&config_hits));
        let _b = bus.subscribe(EventKind::PageUnload, counting(&unload_hits));

        assert_eq!(bus.publish(&Event::PageUnload), 1);
        assert_eq!(config_hits.load(Ordering::SeqCst), 0);
        assert_eq!(unload_hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = bus.subscribe(EventKind::PageUnload, counting(&hits));

        assert!(bus.unsubscribe(&sub));
        assert!(!bus.unsubscribe(&sub));
        assert_eq!(bus.publish(&Event::PageUnload), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(sub.kind(), EventKind::PageUnload);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let _bad = bus.subscribe(
            EventKind::PageUnload,
            Arc::new(|_: &Event| panic!("handler bug")),
        );
        let _good = bus.subscribe(EventKind::PageUnload, counting(&hits));

        assert_eq!(bus.publish(&Event::PageUnload), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_can_unsubscribe_during_delivery() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let token = Arc::new(Mutex::new(None::<Subscription>));

        let b = Arc::clone(&bus);
        let t = Arc::clone(&token);
        let h = Arc::clone(&hits);
        let sub = bus.subscribe(
            EventKind::PageUnload,
            Arc::new(move |_: &Event| {
                h.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = t.lock().unwrap().take() {
                    b.unsubscribe(&sub);
                }
            }),
        );
        *token.lock().unwrap() = Some(sub);

        bus.publish(&Event::PageUnload);
        bus.publish(&Event::PageUnload);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
