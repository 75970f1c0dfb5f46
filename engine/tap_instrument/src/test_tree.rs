//! Hand-built trees for unit tests.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tap_ir::{Source, SourceSection, Tags, Value};

use crate::error::Throw;
use crate::frame::Frame;
use crate::tree::{LanguageInfo, Node, NodeRef, RootNode, SyntaxNode};

pub(crate) const TEXT: &str = "let a = f(1) + g(2); print(a); return a;";

pub(crate) fn source() -> Source {
    Source::builder("stub", "stub.txt", TEXT).build()
}

pub(crate) fn language() -> Arc<LanguageInfo> {
    Arc::new(LanguageInfo::new(
        "stub",
        "Stub",
        Tags::STATEMENT | Tags::EXPRESSION | Tags::CALL | Tags::ROOT_BODY,
    ))
}

/// A syntax node with fixed tags. `expands` nodes materialize into a copy
/// tagged `EXPRESSION` when asked for expressions.
pub(crate) struct Stub {
    pub(crate) tags: Tags,
    pub(crate) section: Option<SourceSection>,
    pub(crate) instrumentable: bool,
    pub(crate) expands: bool,
    pub(crate) materialized: Arc<AtomicUsize>,
}

impl SyntaxNode for Stub {
    fn tags(&self) -> Tags {
        self.tags
    }

    fn source_section(&self) -> Option<&SourceSection> {
        self.section.as_ref()
    }

    fn is_instrumentable(&self) -> bool {
        self.instrumentable
    }

    fn materialize(&self, _this: &NodeRef, tags: Tags) -> Option<NodeRef> {
        if !self.expands || !tags.contains(Tags::EXPRESSION) {
            return None;
        }
        self.materialized.fetch_add(1, Ordering::Relaxed);
        Some(Node::new_syntax(
            Stub {
                tags: self.tags | Tags::EXPRESSION,
                section: self.section.clone(),
                instrumentable: true,
                expands: false,
                materialized: Arc::clone(&self.materialized),
            },
            Vec::new(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn stub(
    source: &Source,
    tags: Tags,
    at: (usize, usize),
    children: Vec<NodeRef>,
) -> NodeRef {
    Node::new_syntax(
        Stub {
            tags,
            section: Some(source.section(at.0, at.1)),
            instrumentable: true,
            expands: false,
            materialized: Arc::default(),
        },
        children,
    )
}

/// A node walks look through but never match.
pub(crate) fn opaque(children: Vec<NodeRef>) -> NodeRef {
    Node::new_syntax(
        Stub {
            tags: Tags::empty(),
            section: None,
            instrumentable: false,
            expands: false,
            materialized: Arc::default(),
        },
        children,
    )
}

/// An expanding statement; `counter` counts its materializations.
pub(crate) fn expanding(
    source: &Source,
    at: (usize, usize),
    counter: &Arc<AtomicUsize>,
) -> NodeRef {
    Node::new_syntax(
        Stub {
            tags: Tags::STATEMENT,
            section: Some(source.section(at.0, at.1)),
            instrumentable: true,
            expands: true,
            materialized: Arc::clone(counter),
        },
        Vec::new(),
    )
}

pub(crate) fn root(source: &Source, name: &str, children: Vec<NodeRef>) -> NodeRef {
    let root = RootNode::new(name, language()).with_section(source.section(0, source.char_count()));
    Node::new_root(root, children)
}

/// Run the node at `node`'s position: through its wrapper when it has one.
pub(crate) fn run(node: &NodeRef, frame: &mut Frame, result: i64) -> Result<Value, Throw> {
    match node.wrapper().and_then(|wrapper| wrapper.probe().cloned()) {
        Some(probe) => probe.execute(frame, |_| Ok(Value::Int(result))),
        None => Ok(Value::Int(result)),
    }
}

pub(crate) fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => panic!("unexpected error: {error:?}"),
    }
}

/// A tree that was loaded and has started executing.
pub(crate) fn executed(instrumentation: &crate::Instrumentation, root: &NodeRef) {
    must(instrumentation.on_tree_loaded(root));
    must(instrumentation.on_tree_first_executed(root));
}
