//! Multi-listener fan-out without tree traversal.
//!
//! Output streams, allocation reports and context/thread lifecycle events
//! follow the coordinator's attach/dispose shape but never touch a tree:
//! the engine reports an event and every attached listener of the matching
//! kind hears about it, in attachment order.

use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;
use tap_ir::Value;
use tap_registry::CowList;

use crate::binding::{BindingKind, EventBinding};

/// A process stream the engine writes guest output to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives bytes written to one output stream.
pub trait OutputListener: Send + Sync {
    fn on_write(&self, bytes: &[u8]);
}

impl<F: Fn(&[u8]) + Send + Sync> OutputListener for F {
    fn on_write(&self, bytes: &[u8]) {
        self(bytes);
    }
}

/// Output listener that captures everything into a buffer.
#[derive(Default)]
pub struct BufferOutputListener {
    buffer: Mutex<Vec<u8>>,
}

impl BufferOutputListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    /// Captured output, with invalid UTF-8 replaced.
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

impl OutputListener for BufferOutputListener {
    fn on_write(&self, bytes: &[u8]) {
        self.buffer.lock().extend_from_slice(bytes);
    }
}

/// Languages whose allocations a binding wants; empty means all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationFilter {
    languages: Vec<String>,
}

impl AllocationFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn languages<S: Into<String>>(languages: impl IntoIterator<Item = S>) -> Self {
        AllocationFilter {
            languages: languages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn includes(&self, language: &str) -> bool {
        self.languages.is_empty() || self.languages.iter().any(|l| l == language)
    }
}

/// One allocation or reallocation reported by a language.
#[derive(Clone, Debug)]
pub struct AllocationEvent<'a> {
    pub language: &'a str,
    pub value: &'a Value,
    /// Size before the change, 0 for a fresh allocation.
    pub old_size: u64,
    /// Size after the change, `None` when the language cannot tell.
    pub new_size: Option<u64>,
}

#[allow(unused_variables)]
pub trait AllocationListener: Send + Sync {
    /// About to allocate or grow `event.value`.
    fn on_enter(&self, event: &AllocationEvent<'_>) {}

    /// Finished allocating or growing `event.value`.
    fn on_return_value(&self, event: &AllocationEvent<'_>) {}
}

/// Told when a reporter gains its first or loses its last binding.
pub trait ActiveListener: Send + Sync {
    fn on_active_changed(&self, active: bool);
}

impl<F: Fn(bool) + Send + Sync> ActiveListener for F {
    fn on_active_changed(&self, active: bool) {
        self(active);
    }
}

/// The per-language allocation channel.
///
/// Languages ask [`is_active`](Self::is_active) before doing any reporting
/// work, or subscribe to the active/inactive edges to switch their
/// allocation paths.
pub struct AllocationReporter {
    language: String,
    bindings: CowList<EventBinding>,
    active_listeners: CowList<Arc<dyn ActiveListener>>,
    edges: Mutex<()>,
}

impl AllocationReporter {
    pub(crate) fn new(language: impl Into<String>) -> Self {
        AllocationReporter {
            language: language.into(),
            bindings: CowList::new(),
            active_listeners: CowList::new(),
            edges: Mutex::new(()),
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn add_active_listener(&self, listener: Arc<dyn ActiveListener>) {
        self.active_listeners.push(listener);
    }

    /// Returns whether the listener was registered.
    pub fn remove_active_listener(&self, listener: &Arc<dyn ActiveListener>) -> bool {
        self.active_listeners
            .retain(|held| !Arc::ptr_eq(held, listener))
            > 0
    }

    pub fn is_active(&self) -> bool {
        !self.bindings.is_empty()
    }

    pub fn on_enter(&self, value: &Value, old_size: u64, new_size: Option<u64>) {
        self.broadcast(value, old_size, new_size, |listener, event| {
            listener.on_enter(event);
        });
    }

    pub fn on_return_value(&self, value: &Value, old_size: u64, new_size: Option<u64>) {
        self.broadcast(value, old_size, new_size, |listener, event| {
            listener.on_return_value(event);
        });
    }

    fn broadcast(
        &self,
        value: &Value,
        old_size: u64,
        new_size: Option<u64>,
        notify: impl Fn(&dyn AllocationListener, &AllocationEvent<'_>),
    ) {
        let event = AllocationEvent {
            language: &self.language,
            value,
            old_size,
            new_size,
        };
        for binding in self.bindings.snapshot().iter() {
            if !binding.is_active() {
                continue;
            }
            if let BindingKind::Allocation { listener, .. } = binding.kind() {
                notify(listener.as_ref(), &event);
            }
        }
    }

    pub(crate) fn add_binding(&self, binding: EventBinding) {
        let _edge = self.edges.lock();
        let was_active = self.is_active();
        self.bindings.push(binding);
        if !was_active {
            self.notify_edge(true);
        }
    }

    pub(crate) fn remove_binding(&self, binding: &EventBinding) {
        let _edge = self.edges.lock();
        let removed = self.bindings.retain(|held| held != binding);
        if removed > 0 && !self.is_active() {
            self.notify_edge(false);
        }
    }

    fn notify_edge(&self, active: bool) {
        tracing::debug!(language = %self.language, active, "allocation reporter changed state");
        for listener in self.active_listeners.snapshot().iter() {
            listener.on_active_changed(active);
        }
    }
}

/// Identifies one execution context of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

#[allow(unused_variables)]
pub trait ContextsListener: Send + Sync {
    fn on_context_created(&self, context: ContextId) {}

    fn on_context_closed(&self, context: ContextId) {}
}

#[allow(unused_variables)]
pub trait ThreadsListener: Send + Sync {
    fn on_thread_initialized(&self, context: ContextId, thread: ThreadId) {}

    fn on_thread_disposed(&self, context: ContextId, thread: ThreadId) {}
}
