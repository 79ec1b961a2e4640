//! Weak observer registry.
//!
//! The registry never owns an observer. Every entry is a [`Weak`] reference,
//! so a subscriber is reclaimed as soon as its last strong owner lets go, with
//! or without an explicit unregister. Dead entries are pruned lazily during
//! iteration.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use super::observer::{DataObserver, ObserverId};

struct Entry<T> {
    id: ObserverId,
    observer: Weak<dyn DataObserver<T>>,
}

/// Registry of weakly held observers.
pub struct WeakObserverRegistry<T> {
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T> WeakObserverRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Registers a weak reference to `observer`.
    pub fn register(&self, observer: &Arc<dyn DataObserver<T>>) -> ObserverId {
        self.register_weak(Arc::downgrade(observer))
    }

    /// Registers an already downgraded observer.
    pub fn register_weak(&self, observer: Weak<dyn DataObserver<T>>) -> ObserverId {
        let id = ObserverId::new();
        self.lock().push(Entry { id, observer });
        id
    }

    /// Removes an entry. Returns false if it was unknown or already pruned.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Calls `f` for every entry whose observer is still alive.
    ///
    /// Dead entries are pruned while the live set is collected. `f` runs after
    /// the lock is released, so it may register or unregister observers.
    /// Returns the number of observers visited.
    pub fn for_each_live<F>(&self, mut f: F) -> usize
    where
        F: FnMut(ObserverId, &Arc<dyn DataObserver<T>>),
    {
        let live = self.live();
        for (id, observer) in &live {
            f(*id, observer);
        }
        live.len()
    }

    /// Drops entries whose observer is gone. Returns how many were pruned.
    pub fn prune(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.observer.strong_count() > 0);
        before - entries.len()
    }

    /// Number of entries, including dead ones not yet pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns true if `id` is still registered.
    #[must_use]
    pub fn contains(&self, id: ObserverId) -> bool {
        self.lock().iter().any(|e| e.id == id)
    }

    /// Upgrades every live entry, pruning dead ones.
    pub(crate) fn live(&self) -> Vec<(ObserverId, Arc<dyn DataObserver<T>>)> {
        let mut entries = self.lock();
        let mut live = Vec::with_capacity(entries.len());
        entries.retain(|e| match e.observer.upgrade() {
            Some(observer) => {
                live.push((e.id, observer));
                true
            }
            None => false,
        });
        live
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry<T>>> {
        // Entries are plain data; a panic elsewhere cannot leave them half-written.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for WeakObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for WeakObserverRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakObserverRegistry").field("entries", &self.len()).finish()
    }
}
