//! Append-only slot array with compaction.
//!
//! # Layout
//!
//! The list is an array of set-once slots published through an [`ArcSwap`].
//! Appends fill the next slot under a mutex; when the array is full it is
//! compacted into a fresh array of `max(live * 2, MIN_CAPACITY)` slots,
//! keeping only entries that are still alive. The first unset slot
//! terminates iteration, so iterators never need the mutex.

use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

/// Smallest array allocated by compaction.
pub const MIN_CAPACITY: usize = 8;

/// An entry that may stop being alive.
pub trait Slot: Clone + Send + Sync {
    type Live;

    /// The live value, or `None` once the entry is dead.
    fn live(&self) -> Option<Self::Live>;
}

impl<T: Send + Sync> Slot for Weak<T> {
    type Live = Arc<T>;

    fn live(&self) -> Option<Arc<T>> {
        self.upgrade()
    }
}

/// Entry that stays alive for the lifetime of the list.
#[derive(Clone)]
pub struct Strong<T>(pub T);

impl<T: Clone + Send + Sync> Slot for Strong<T> {
    type Live = T;

    fn live(&self) -> Option<T> {
        Some(self.0.clone())
    }
}

type Slots<S> = Box<[OnceLock<S>]>;

fn allocate<S>(capacity: usize) -> Slots<S> {
    (0..capacity).map(|_| OnceLock::new()).collect()
}

/// Append-only list of possibly dying entries.
pub struct AsyncList<S> {
    slots: ArcSwap<Slots<S>>,
    next_insertion: Mutex<usize>,
}

/// List of weakly held `T`.
pub type WeakAsyncList<T> = AsyncList<Weak<T>>;

impl<S: Slot> AsyncList<S> {
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        AsyncList {
            slots: ArcSwap::from_pointee(allocate(capacity.max(1))),
            next_insertion: Mutex::new(0),
        }
    }

    /// Append `entry`, compacting first when the array is full.
    pub fn add(&self, entry: S) {
        let mut next = self.next_insertion.lock();
        let mut slots = self.slots.load_full();
        if *next >= slots.len() {
            let (compacted, live) = compact(&slots);
            *next = live;
            slots = Arc::new(compacted);
            self.slots.store(Arc::clone(&slots));
        }
        // the slot at `next` is unset: only this mutex holder writes slots
        let _ = slots[*next].set(entry);
        *next += 1;
    }

    /// Approximate emptiness: true when the first slot is unset.
    pub fn is_empty(&self) -> bool {
        self.slots.load()[0].get().is_none()
    }

    /// Iterate live entries of the current array.
    pub fn iter(&self) -> Iter<S> {
        Iter {
            slots: self.slots.load_full(),
            index: 0,
        }
    }

    /// Number of slots in the current array.
    pub fn capacity(&self) -> usize {
        self.slots.load().len()
    }
}

impl<S: Slot> Default for AsyncList<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn compact<S: Slot>(slots: &Slots<S>) -> (Slots<S>, usize) {
    let live: Vec<S> = slots
        .iter()
        .map_while(OnceLock::get)
        .filter(|entry| entry.live().is_some())
        .cloned()
        .collect();
    let compacted = allocate(MIN_CAPACITY.max(live.len() * 2));
    let count = live.len();
    for (slot, entry) in compacted.iter().zip(live) {
        let _ = slot.set(entry);
    }
    (compacted, count)
}

/// Iterator over the live entries of one array snapshot.
///
/// Entries appended into that array after the iterator was created may be
/// observed; entries appended after a compaction are not.
pub struct Iter<S> {
    slots: Arc<Slots<S>>,
    index: usize,
}

impl<S: Slot> Iterator for Iter<S> {
    type Item = S::Live;

    fn next(&mut self) -> Option<S::Live> {
        while let Some(entry) = self.slots.get(self.index).and_then(OnceLock::get) {
            self.index += 1;
            if let Some(live) = entry.live() {
                return Some(live);
            }
        }
        None
    }
}
