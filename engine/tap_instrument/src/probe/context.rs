//! The per-location view handed to observers.

use std::fmt;
use std::sync::Weak;

use tap_ir::{SourceSection, Tags, Value};

use crate::binding::EventBinding;
use crate::error::{GuestException, Throw};
use crate::tree::{Node, NodeRef};
use crate::unwind::Unwind;

/// A location as observers see it.
///
/// Contexts of probes refer to the wrapper; contexts of unwrapped input
/// children refer to the node itself. Either way the context holds no strong
/// reference into the tree.
#[derive(Clone)]
pub struct EventContext {
    node: Weak<Node>,
    section: Option<SourceSection>,
}

impl EventContext {
    pub(crate) fn new(node: Weak<Node>, section: Option<SourceSection>) -> Self {
        EventContext { node, section }
    }

    /// The node the context was created for: a wrapper or a plain node.
    pub(crate) fn node(&self) -> Option<NodeRef> {
        self.node.upgrade()
    }

    pub fn source_section(&self) -> Option<&SourceSection> {
        self.section.as_ref()
    }

    /// The node whose events this context reports, `None` once the tree
    /// dropped it.
    pub fn instrumented_node(&self) -> Option<NodeRef> {
        let node = self.node()?;
        if node.is_wrapper() {
            node.delegate()
        } else {
            Some(node)
        }
    }

    pub fn tags(&self) -> Tags {
        self.instrumented_node().map_or(Tags::empty(), |node| node.tags())
    }

    pub fn has_tag(&self, tag: Tags) -> bool {
        self.tags().intersects(tag)
    }

    /// A control transfer addressed to `target`, or to the binding whose
    /// hook returns it when `None`.
    pub fn create_unwind(&self, info: Value, target: Option<&EventBinding>) -> Throw {
        Throw::Unwind(Unwind::new(info, target.cloned()))
    }

    /// A guest exception raised on behalf of the observer. Unlike ordinary
    /// observer failures it is never contained.
    pub fn create_error(&self, exception: GuestException) -> Throw {
        Throw::Guest(exception)
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("EventContext");
        if let Some(section) = &self.section {
            debug.field("section", &format_args!("{section}"));
        }
        debug.field("tags", &format_args!("{}", self.tags())).finish()
    }
}
