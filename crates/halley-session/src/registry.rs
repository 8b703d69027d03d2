// Copy-on-write registration lists.
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Ordered registration list with a lock-free read-side snapshot.
///
/// Mutations take the registry lock, rebuild the list, and republish it;
/// traversals iterate the snapshot they captured, so a registration-order
/// pass in progress is never disrupted by a concurrent add or remove.
pub(crate) struct CowList<T: ?Sized> {
    // Inner registry mutated only on add/remove paths.
    entries: Mutex<Vec<Arc<T>>>,
    // Snapshot used by dispatch hot paths: lock-free read.
    snapshot: ArcSwap<Vec<Arc<T>>>,
}

impl<T: ?Sized> CowList<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub(crate) fn add(&self, entry: Arc<T>) {
        let mut entries = self.entries.lock();
        entries.push(entry);
        self.snapshot.store(Arc::new(entries.clone()));
    }

    /// Removes by pointer identity; returns whether anything was removed.
    pub(crate) fn remove(&self, entry: &Arc<T>) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|existing| !Arc::ptr_eq(existing, entry));
        let removed = entries.len() != before;
        if removed {
            self.snapshot.store(Arc::new(entries.clone()));
        }
        removed
    }

    pub(crate) fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.snapshot.store(Arc::new(Vec::new()));
    }

    #[inline]
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.load_full()
    }
}
