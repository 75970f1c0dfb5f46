//! Per-execution storage.
//!
//! A [`FrameDescriptor`] belongs to a root and hands out engine-managed slot
//! indices keyed by `(binding, location, input index)`. Every execution of
//! the root gets its own [`Frame`], holding language locals and those slots.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tap_ir::Value;

/// Key of an engine-managed frame slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub binding: u64,
    /// Id of the probe owning the slot.
    pub location: u64,
    pub index: usize,
}

/// Slot layout shared by all frames of one root.
#[derive(Debug, Default)]
pub struct FrameDescriptor {
    slots: Mutex<SlotTable>,
}

#[derive(Debug, Default)]
struct SlotTable {
    by_key: FxHashMap<SlotKey, usize>,
    allocated: usize,
}

impl FrameDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the slot for `key`, allocating it on first use.
    pub fn find_or_add(&self, key: SlotKey) -> usize {
        let mut table = self.slots.lock();
        if let Some(&index) = table.by_key.get(&key) {
            return index;
        }
        let index = table.allocated;
        table.allocated += 1;
        table.by_key.insert(key, index);
        index
    }

    pub fn find(&self, key: SlotKey) -> Option<usize> {
        self.slots.lock().by_key.get(&key).copied()
    }

    /// Release the slot for `key`. Indices are never handed out twice, so
    /// frames still holding a value for it cannot leak it to another key.
    pub fn remove(&self, key: SlotKey) -> bool {
        self.slots.lock().by_key.remove(&key).is_some()
    }

    /// Number of live slot keys.
    pub fn len(&self) -> usize {
        self.slots.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Storage of one execution.
#[derive(Debug, Default)]
pub struct Frame {
    locals: Vec<Value>,
    slots: Vec<Option<Value>>,
}

impl Frame {
    pub fn new(locals: usize) -> Self {
        Frame {
            locals: vec![Value::Null; locals],
            slots: Vec::new(),
        }
    }

    /// Local `index`, `Null` if never written.
    pub fn local(&self, index: usize) -> Value {
        self.locals.get(index).cloned().unwrap_or_default()
    }

    pub fn set_local(&mut self, index: usize, value: Value) {
        if index >= self.locals.len() {
            self.locals.resize(index + 1, Value::Null);
        }
        self.locals[index] = value;
    }

    pub fn slot(&self, index: usize) -> Option<&Value> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn set_slot(&mut self, index: usize, value: Option<Value>) {
        if index >= self.slots.len() {
            if value.is_none() {
                return;
            }
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = value;
    }
}
