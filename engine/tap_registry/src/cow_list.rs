//! Copy-on-write list.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

/// Append-mostly list with lock-free snapshots.
///
/// Writers serialize on an internal mutex and publish a new vector; readers
/// take the current vector with one atomic load and never see a partial write.
pub struct CowList<T> {
    items: ArcSwap<Vec<T>>,
    write: Mutex<()>,
}

impl<T: Clone> CowList<T> {
    pub fn new() -> Self {
        CowList {
            items: ArcSwap::from_pointee(Vec::new()),
            write: Mutex::new(()),
        }
    }

    /// Append `item`; it is visible to snapshots taken afterwards.
    pub fn push(&self, item: T) {
        let _guard = self.write.lock();
        let mut next = Vec::clone(&self.items.load());
        next.push(item);
        self.items.store(Arc::new(next));
    }

    /// Keep only items satisfying `keep`, returning how many were removed.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let _guard = self.write.lock();
        let current = self.items.load_full();
        let next: Vec<T> = current.iter().filter(|item| keep(item)).cloned().collect();
        let removed = current.len() - next.len();
        if removed > 0 {
            self.items.store(Arc::new(next));
        }
        removed
    }

    /// Remove everything, returning the last snapshot.
    pub fn take_all(&self) -> Arc<Vec<T>> {
        let _guard = self.write.lock();
        self.items.swap(Arc::new(Vec::new()))
    }

    /// The current contents.
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.items.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.items.load().is_empty()
    }
}

impl<T: Clone> Default for CowList<T> {
    fn default() -> Self {
        Self::new()
    }
}
