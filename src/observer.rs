//! Multi-observer registration.
//!
//! Each registered callback gets a [`SubscriptionId`] that the caller keeps to
//! unsubscribe later. Notification runs on a copy of the current list so a
//! callback may subscribe or unsubscribe without deadlocking.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`ObserverList::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

pub struct ObserverList<E> {
    next_id: AtomicU64,
    observers: Mutex<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> ObserverList<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Returns false if `id` was not (or no longer) registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in snapshot {
            cb(event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for ObserverList<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("observers", &self.len())
            .finish()
    }
}
