use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

/// Handle returned when a listener is registered. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Observer registry holding weak references, so registering never extends
/// the lifetime of a listener.
///
/// Dispatch works on a snapshot: a listener may add or remove listeners
/// (including itself) from inside a callback without deadlocking, and the
/// change takes effect from the next dispatch on.
pub struct ListenerList<L: ?Sized> {
    entries: Mutex<Vec<(ListenerId, Weak<L>)>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> ListenerList<L> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, listener: Weak<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, listener));
        id
    }

    /// Removes a listener, returning whether it was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Number of registered listeners that are still alive.
    pub fn len(&self) -> usize {
        self.lock()
            .iter()
            .filter(|(_, listener)| listener.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes `f` for every live listener in registration order.
    pub fn call(&self, mut f: impl FnMut(&L)) {
        let snapshot: Vec<Arc<L>> = {
            let mut entries = self.lock();
            entries.retain(|(_, listener)| listener.strong_count() > 0);
            entries
                .iter()
                .filter_map(|(_, listener)| listener.upgrade())
                .collect()
        };

        for listener in &snapshot {
            f(listener.as_ref());
        }
    }

    // Listener bookkeeping stays usable even if a callback panicked elsewhere.
    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, Weak<L>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<L: ?Sized> Default for ListenerList<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> fmt::Debug for ListenerList<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerList")
            .field("entries", &self.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Ping: Send + Sync {
        fn ping(&self);
    }

    #[derive(Default)]
    struct Counter {
        hits: AtomicU64,
    }

    impl Ping for Counter {
        fn ping(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn register(list: &ListenerList<dyn Ping>, counter: &Arc<Counter>) -> ListenerId {
        let weak = Arc::downgrade(counter);
        let weak: Weak<dyn Ping> = weak;
        list.add(weak)
    }

    #[test]
    fn dispatches_to_registered_listeners() {
        let list: ListenerList<dyn Ping> = ListenerList::new();
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());
        register(&list, &first);
        let id = register(&list, &second);

        list.call(|listener| listener.ping());
        assert!(list.remove(id));
        list.call(|listener| listener.ping());

        assert_eq!(first.hits.load(Ordering::SeqCst), 2);
        assert_eq!(second.hits.load(Ordering::SeqCst), 1);
        assert!(!list.remove(id));
    }

    #[test]
    fn dropped_listeners_are_pruned() {
        let list: ListenerList<dyn Ping> = ListenerList::new();
        let counter = Arc::new(Counter::default());
        register(&list, &counter);
        assert_eq!(list.len(), 1);

        drop(counter);
        list.call(|listener| listener.ping());
        assert!(list.is_empty());
    }

    struct SelfRemover {
        list: Arc<ListenerList<dyn Ping>>,
        id: Mutex<Option<ListenerId>>,
        hits: AtomicU64,
    }

    impl Ping for SelfRemover {
        fn ping(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = self.id.lock().unwrap().take() {
                self.list.remove(id);
            }
        }
    }

    #[test]
    fn listeners_can_remove_themselves_during_dispatch() {
        let list: Arc<ListenerList<dyn Ping>> = Arc::new(ListenerList::new());
        let remover = Arc::new(SelfRemover {
            list: list.clone(),
            id: Mutex::new(None),
            hits: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&remover);
        let weak: Weak<dyn Ping> = weak;
        let id = list.add(weak);
        *remover.id.lock().unwrap() = Some(id);

        list.call(|listener| listener.ping());
        list.call(|listener| listener.ping());

        assert_eq!(remover.hits.load(Ordering::SeqCst), 1);
    }
}
