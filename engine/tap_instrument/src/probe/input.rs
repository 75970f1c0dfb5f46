//! Input-value capture.

use std::sync::Arc;

use tap_ir::Value;

use crate::frame::{Frame, FrameDescriptor, SlotKey};
use crate::probe::EventContext;

/// The input children of one factory-created node and the frame slots their
/// values can be saved into.
///
/// Slots are allocated once per `(binding, location, index)` and reused by
/// every execution and re-entry of the location.
#[derive(Clone, Default)]
pub struct InputHandle {
    inner: Arc<InputSlots>,
}

#[derive(Default)]
struct InputSlots {
    binding: u64,
    location: u64,
    descriptor: Option<Arc<FrameDescriptor>>,
    slots: Box<[usize]>,
    contexts: Box<[EventContext]>,
}

impl InputHandle {
    pub(crate) fn new(
        binding: u64,
        location: u64,
        descriptor: Option<Arc<FrameDescriptor>>,
        contexts: Vec<EventContext>,
    ) -> Self {
        let slots = match &descriptor {
            Some(descriptor) => (0..contexts.len())
                .map(|index| {
                    descriptor.find_or_add(SlotKey {
                        binding,
                        location,
                        index,
                    })
                })
                .collect(),
            None => Box::default(),
        };
        InputHandle {
            inner: Arc::new(InputSlots {
                binding,
                location,
                descriptor,
                slots,
                contexts: contexts.into_boxed_slice(),
            }),
        }
    }

    pub fn input_count(&self) -> usize {
        self.inner.contexts.len()
    }

    pub fn input_context(&self, index: usize) -> Option<&EventContext> {
        self.inner.contexts.get(index)
    }

    /// Keep `value` for input `index` until the location returns.
    pub fn save_input_value(&self, frame: &mut Frame, index: usize, value: Value) {
        if let Some(&slot) = self.inner.slots.get(index) {
            frame.set_slot(slot, Some(value));
        }
    }

    /// Saved values in input order; `None` for inputs not saved in this
    /// execution.
    pub fn saved_input_values(&self, frame: &Frame) -> Vec<Option<Value>> {
        self.inner
            .slots
            .iter()
            .map(|&slot| frame.slot(slot).cloned())
            .collect()
    }

    pub(crate) fn clear(&self, frame: &mut Frame) {
        for &slot in self.inner.slots.iter() {
            frame.set_slot(slot, None);
        }
    }

    /// Give the slots back to the descriptor.
    pub(crate) fn release(&self) {
        let Some(descriptor) = &self.inner.descriptor else {
            return;
        };
        for index in 0..self.inner.slots.len() {
            descriptor.remove(SlotKey {
                binding: self.inner.binding,
                location: self.inner.location,
                index,
            });
        }
    }
}
