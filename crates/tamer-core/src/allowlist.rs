//! Critical-callback allowlist.
//!
//! Callbacks marked here are delivered with their requested delay at every
//! throttle level (a clock-tick updater, a heartbeat). Membership is by
//! identity: the allocation behind the [`Callback`] handle.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::host::{Callback, callback_key};

/// Identity set of exempted callbacks.
///
/// Each entry keeps a strong reference so the address used as the key cannot
/// be reused by another allocation while the callback is marked.
#[derive(Default)]
pub struct CriticalCallbacks {
    entries: RwLock<HashMap<usize, Callback>>,
}

impl std::fmt::Debug for CriticalCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CriticalCallbacks")
            .field("len", &self.len())
            .finish()
    }
}

impl CriticalCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Exempt `callback`. Returns false if it was already marked.
    pub fn mark(&self, callback: &Callback) -> bool {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .insert(callback_key(callback), Arc::clone(callback))
            .is_none()
    }

    /// Remove the exemption. Returns false if it was not marked.
    pub fn unmark(&self, callback: &Callback) -> bool {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(&callback_key(callback)).is_some()
    }

    /// Membership check used on the scheduling path.
    ///
    /// Fails (rather than guessing) when the set is poisoned so the caller can
    /// fall back to the unmodified delay.
    pub fn check(&self, callback: &Callback) -> Result<bool, AllowlistPoisoned> {
        self.entries
            .read()
            .map(|entries| entries.contains_key(&callback_key(callback)))
            .map_err(|_| AllowlistPoisoned)
    }

    /// Convenience wrapper around [`check`](Self::check); a poisoned set
    /// reports `true` so nothing gets throttled by mistake.
    #[must_use]
    pub fn is_critical(&self, callback: &Callback) -> bool {
        self.check(callback).unwrap_or(true)
    }

    pub fn clear(&self) {
        match self.entries.write() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => {
                let mut guard = poisoned.into_inner();
                guard.clear();
                drop(guard);
                self.entries.clear_poison();
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The allowlist lock was poisoned by a panic elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("critical-callback allowlist is poisoned")]
pub struct AllowlistPoisoned;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_unmark() {
        let set = CriticalCallbacks::new();
        let tick: Callback = Arc::new(|| {});

        assert!(!set.is_critical(&tick));
        assert!(set.mark(&tick));
        assert!(!set.mark(&tick));
        assert!(set.is_critical(&tick));
        assert!(set.is_critical(&Arc::clone(&tick)));
        assert_eq!(set.len(), 1);

        assert!(set.unmark(&tick));
        assert!(!set.unmark(&tick));
        assert!(!set.is_critical(&tick));
        assert!(set.is_empty());
    }

    #[test]
    fn identical_closures_are_distinct() {
        let set = CriticalCallbacks::new();
        let a: Callback = Arc::new(|| {});
        let b: Callback = Arc::new(|| {});
        set.mark(&a);
        assert!(set.is_critical(&a));
        assert!(!set.is_critical(&b));
    }

    #[test]
    fn marked_callback_is_kept_alive() {
        let set = CriticalCallbacks::new();
        let tick: Callback = Arc::new(|| {});
        set.mark(&tick);
        assert_eq!(Arc::strong_count(&tick), 2);
        set.clear();
        assert_eq!(Arc::strong_count(&tick), 1);
    }

    #[test]
    fn poisoned_set_fails_check() {
        let set = Arc::new(CriticalCallbacks::new());
        let tick: Callback = Arc::new(|| {});
        set.mark(&tick);

        let s = Arc::clone(&set);
        let _ = std::thread::spawn(move || {
            let _guard = s.entries.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert_eq!(set.check(&tick), Err(AllowlistPoisoned));
        assert!(set.is_critical(&tick));

        set.clear();
        assert_eq!(set.check(&tick), Ok(false));
    }
}
