//! Listener registries with per-listener panic isolation.
//!
//! Listener sets are identity-keyed: `add` returns a [`ListenerId`] that
//! `remove` takes back. Dispatch snapshots the set first, so listeners
//! may add or remove listeners (including themselves) while being
//! notified. A panicking listener is logged and never prevents the
//! remaining listeners from running.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;
use uuid::Uuid;

/// Registration handle for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// A set of callables keyed by registration identity.
pub(crate) struct ListenerSet<T: ?Sized> {
    entries: RwLock<HashMap<ListenerId, Arc<T>>>,
}

impl<T: ?Sized> std::fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.entries.read().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("ListenerSet")
            .field("listener_count", &count)
            .finish()
    }
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> ListenerSet<T> {
    /// Create an empty set.
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a listener; O(1).
    pub(crate) fn add(&self, listener: Arc<T>) -> ListenerId {
        let id = ListenerId::new();
        let mut entries = self.entries.write().expect("listener lock poisoned");
        entries.insert(id, listener);
        id
    }

    /// Remove a listener by handle; O(1). Returns `true` if it was
    /// present.
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().expect("listener lock poisoned");
        entries.remove(&id).is_some()
    }

    /// Drop every listener.
    pub(crate) fn clear(&self) {
        let mut entries = self.entries.write().expect("listener lock poisoned");
        entries.clear();
    }

    /// Returns `true` if no listeners are registered.
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.read().expect("listener lock poisoned").is_empty()
    }

    /// Invoke every registered listener.
    ///
    /// Panics raised by a listener are caught and logged; the remaining
    /// listeners still run.
    pub(crate) fn notify(&self, mut invoke: impl FnMut(&T)) {
        let snapshot: Vec<Arc<T>> = {
            let entries = self.entries.read().expect("listener lock poisoned");
            entries.values().cloned().collect()
        };

        for listener in snapshot {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                invoke(listener.as_ref());
            }));
            if let Err(panic) = result {
                warn!(error = ?panic, "listener panicked during dispatch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Callback = dyn Fn() + Send + Sync;

    fn counting(counter: &Arc<AtomicUsize>) -> Arc<Callback> {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn add_notify_remove() {
        let set: ListenerSet<Callback> = ListenerSet::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = set.add(counting(&counter));

        set.notify(|l| l());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(set.remove(id));
        set.notify(|l| l());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_unknown_is_false() {
        let set: ListenerSet<Callback> = ListenerSet::new();
        let id = set.add(Arc::new(|| {}));
        assert!(set.remove(id));
        assert!(!set.remove(id));
    }

    #[test]
    fn clear_empties_the_set() {
        let set: ListenerSet<Callback> = ListenerSet::new();
        set.add(Arc::new(|| {}));
        set.add(Arc::new(|| {}));
        assert!(!set.is_empty());
        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        let set: ListenerSet<Callback> = ListenerSet::new();
        let counter = Arc::new(AtomicUsize::new(0));

        set.add(Arc::new(|| panic!("listener failure")));
        set.add(counting(&counter));
        set.add(counting(&counter));

        set.notify(|l| l());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listeners_may_mutate_the_set_during_dispatch() {
        let set: Arc<ListenerSet<Callback>> = Arc::new(ListenerSet::new());
        let set_clone = Arc::clone(&set);
        let counter = Arc::new(AtomicUsize::new(0));

        set.add(Arc::new(move || {
            set_clone.clear();
        }));
        set.add(counting(&counter));

        // Snapshot semantics: both listeners from the snapshot run even
        // though the first one cleared the set.
        set.notify(|l| l());
        assert!(set.is_empty());
    }
}
