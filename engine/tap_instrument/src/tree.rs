//! The node model.
//!
//! Trees own their children through `Arc`s; parents are weak back
//! references. A node is one of three kinds:
//!
//! - a [`RootNode`], the top of a tree, carrying its language, cached
//!   [`RootBits`] and the structural lock
//! - a language-provided [`SyntaxNode`]
//! - a wrapper, the interposition node the coordinator inserts as the sole
//!   parent of an instrumented node; its only child is the delegate
//!
//! Nodes never leave a tree except by [`Node::replace`]. A replaced node
//! keeps its parent pointer so executions still running inside it can find
//! their way up.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, RwLock};
use smallvec::SmallVec;
use tap_filter::RootSummary;
use tap_ir::{RootBits, SourceSection, Tags};

use crate::error::TreeError;
use crate::frame::{Frame, FrameDescriptor};
use crate::probe::ProbeNode;

/// Shared handle to a node.
pub type NodeRef = Arc<Node>;

/// Children snapshot.
pub type Children = SmallVec<[NodeRef; 4]>;

/// Lock serializing structural edits of one tree.
pub(crate) type StructureLock = ReentrantMutex<()>;

/// A language-provided node.
pub trait SyntaxNode: Send + Sync + 'static {
    fn tags(&self) -> Tags;

    fn has_tag(&self, tag: Tags) -> bool {
        self.tags().intersects(tag)
    }

    fn source_section(&self) -> Option<&SourceSection>;

    /// Whether the node may be wrapped. Non-instrumentable nodes are walked
    /// through but never matched.
    fn is_instrumentable(&self) -> bool {
        true
    }

    /// Produce a fuller shape of `this` exposing `tags`, or `None` to keep
    /// the node as is.
    ///
    /// The returned node must be fresh (not adopted by any parent) and cover
    /// the same source section as `this`.
    fn materialize(&self, this: &NodeRef, tags: Tags) -> Option<NodeRef> {
        let _ = (this, tags);
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Static description of a guest language.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LanguageInfo {
    id: String,
    name: String,
    mime_types: Vec<String>,
    provided_tags: Tags,
}

impl LanguageInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, provided_tags: Tags) -> Self {
        LanguageInfo {
            id: id.into(),
            name: name.into(),
            mime_types: Vec::new(),
            provided_tags,
        }
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_types.push(mime_type.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_types(&self) -> &[String] {
        &self.mime_types
    }

    /// Tags nodes of this language may carry.
    pub fn provided_tags(&self) -> Tags {
        self.provided_tags
    }
}

/// Top of a tree.
pub struct RootNode {
    name: String,
    section: Option<SourceSection>,
    internal: bool,
    language: Arc<LanguageInfo>,
    bits: AtomicU32,
    first_execution: AtomicBool,
    frame: Arc<FrameDescriptor>,
    locals: usize,
    lock: Arc<StructureLock>,
}

impl RootNode {
    pub fn new(name: impl Into<String>, language: Arc<LanguageInfo>) -> Self {
        RootNode {
            name: name.into(),
            section: None,
            internal: false,
            language,
            bits: AtomicU32::new(RootBits::empty().bits()),
            first_execution: AtomicBool::new(true),
            frame: Arc::new(FrameDescriptor::new()),
            locals: 0,
            lock: Arc::new(StructureLock::new(())),
        }
    }

    #[must_use]
    pub fn with_section(mut self, section: SourceSection) -> Self {
        self.section = Some(section);
        self
    }

    #[must_use]
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// Number of language locals each frame starts with.
    #[must_use]
    pub fn with_locals(mut self, locals: usize) -> Self {
        self.locals = locals;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn section(&self) -> Option<&SourceSection> {
        self.section.as_ref()
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn language(&self) -> &Arc<LanguageInfo> {
        &self.language
    }

    pub fn bits(&self) -> RootBits {
        RootBits::from_bits_retain(self.bits.load(Ordering::Acquire))
    }

    pub fn locals(&self) -> usize {
        self.locals
    }

    pub fn frame_descriptor(&self) -> &Arc<FrameDescriptor> {
        &self.frame
    }

    pub fn new_frame(&self) -> Frame {
        Frame::new(self.locals)
    }

    pub(crate) fn summary(&self) -> RootSummary<'_> {
        RootSummary {
            bits: self.bits(),
            section: self.section.as_ref(),
            name: &self.name,
            internal: self.internal,
            provided_tags: self.language.provided_tags(),
        }
    }

    pub(crate) fn refine_bits(&self, computed: RootBits) {
        let _ = self.bits.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(RootBits::from_bits_retain(current).refine(computed).bits())
        });
    }

    pub(crate) fn set_executed(&self) {
        self.bits.fetch_or(RootBits::EXECUTED.bits(), Ordering::AcqRel);
    }

    /// True exactly once, for the caller reporting the first execution.
    pub(crate) fn claim_first_execution(&self) -> bool {
        self.first_execution.swap(false, Ordering::AcqRel)
    }
}

/// What a node is.
pub enum NodeKind {
    Root(RootNode),
    Syntax(Box<dyn SyntaxNode>),
    Wrapper(Arc<ProbeNode>),
}

/// A vertex of an executable tree.
pub struct Node {
    parent: RwLock<Weak<Node>>,
    children: RwLock<Children>,
    kind: NodeKind,
}

impl Node {
    pub fn new_root(root: RootNode, children: Vec<NodeRef>) -> NodeRef {
        Self::adopting(NodeKind::Root(root), children)
    }

    pub fn new_syntax(syntax: impl SyntaxNode, children: Vec<NodeRef>) -> NodeRef {
        Self::adopting(NodeKind::Syntax(Box::new(syntax)), children)
    }

    fn adopting(kind: NodeKind, children: Vec<NodeRef>) -> NodeRef {
        Arc::new_cyclic(|this| {
            for child in &children {
                *child.parent.write() = this.clone();
            }
            Node {
                parent: RwLock::new(Weak::new()),
                children: RwLock::new(children.into_iter().collect()),
                kind,
            }
        })
    }

    /// Wrapper around `delegate`. The delegate is not adopted yet; the caller
    /// swaps the wrapper into the tree first.
    pub(crate) fn new_wrapper(
        delegate: NodeRef,
        probe: impl FnOnce(Weak<Node>) -> ProbeNode,
    ) -> NodeRef {
        Arc::new_cyclic(|this| Node {
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(SmallVec::from_iter([delegate])),
            kind: NodeKind::Wrapper(Arc::new(probe(this.clone()))),
        })
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn as_root(&self) -> Option<&RootNode> {
        match &self.kind {
            NodeKind::Root(root) => Some(root),
            _ => None,
        }
    }

    pub fn as_syntax(&self) -> Option<&dyn SyntaxNode> {
        match &self.kind {
            NodeKind::Syntax(syntax) => Some(syntax.as_ref()),
            _ => None,
        }
    }

    /// The syntax node downcast to a concrete language type.
    pub fn syntax<T: SyntaxNode>(&self) -> Option<&T> {
        self.as_syntax()?.as_any().downcast_ref()
    }

    pub fn probe(&self) -> Option<&Arc<ProbeNode>> {
        match &self.kind {
            NodeKind::Wrapper(probe) => Some(probe),
            _ => None,
        }
    }

    pub fn is_wrapper(&self) -> bool {
        matches!(self.kind, NodeKind::Wrapper(_))
    }

    pub fn is_instrumentable(&self) -> bool {
        self.as_syntax().is_some_and(|syntax| syntax.is_instrumentable())
    }

    pub fn parent(&self) -> Option<NodeRef> {
        self.parent.read().upgrade()
    }

    pub fn children(&self) -> Children {
        self.children.read().clone()
    }

    pub fn child(&self, index: usize) -> Option<NodeRef> {
        self.children.read().get(index).cloned()
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// The wrapped node of a wrapper.
    pub fn delegate(&self) -> Option<NodeRef> {
        if self.is_wrapper() {
            self.child(0)
        } else {
            None
        }
    }

    /// The wrapper directly above this node, if any.
    pub fn wrapper(&self) -> Option<NodeRef> {
        self.parent().filter(|parent| parent.is_wrapper())
    }

    /// Tags of the node; wrappers report their delegate's.
    pub fn tags(&self) -> Tags {
        match &self.kind {
            NodeKind::Syntax(syntax) => syntax.tags(),
            NodeKind::Wrapper(_) => self.delegate().map_or(Tags::empty(), |d| d.tags()),
            NodeKind::Root(_) => Tags::empty(),
        }
    }

    pub fn source_section(&self) -> Option<SourceSection> {
        match &self.kind {
            NodeKind::Syntax(syntax) => syntax.source_section().cloned(),
            NodeKind::Wrapper(_) => self.delegate().and_then(|d| d.source_section()),
            NodeKind::Root(root) => root.section.clone(),
        }
    }

    /// The root above this node, following parent pointers.
    pub fn root(self: &Arc<Self>) -> Option<NodeRef> {
        let mut current = Arc::clone(self);
        loop {
            if current.as_root().is_some() {
                return Some(current);
            }
            current = current.parent()?;
        }
    }

    /// Closest instrumentable proper ancestor, looking through wrappers.
    pub fn instrumentable_ancestor(&self) -> Option<NodeRef> {
        let mut current = self.parent()?;
        loop {
            if current.is_instrumentable() {
                return Some(current);
            }
            if current.as_root().is_some() {
                return None;
            }
            current = current.parent()?;
        }
    }

    /// Swap this node for `new` under its parent; `new` is adopted.
    pub fn replace(self: &Arc<Self>, new: NodeRef) -> Result<NodeRef, TreeError> {
        let parent = self.parent().ok_or(TreeError::NoParent)?;
        Self::replace_child(&parent, self, &new)?;
        Ok(new)
    }

    /// Swap `old` for `new` among `parent`'s children and adopt `new`.
    pub(crate) fn replace_child(
        parent: &NodeRef,
        old: &NodeRef,
        new: &NodeRef,
    ) -> Result<(), TreeError> {
        let mut children = parent.children.write();
        let slot = children
            .iter_mut()
            .find(|child| Arc::ptr_eq(child, old))
            .ok_or(TreeError::ChildNotFound)?;
        *slot = Arc::clone(new);
        *new.parent.write() = Arc::downgrade(parent);
        Ok(())
    }

    pub(crate) fn set_parent(&self, parent: &NodeRef) {
        *self.parent.write() = Arc::downgrade(parent);
    }

    /// The structural lock of the enclosing tree, `None` when detached.
    pub(crate) fn structure_lock(self: &Arc<Self>) -> Option<Arc<StructureLock>> {
        let root = self.root()?;
        root.as_root().map(|r| Arc::clone(&r.lock))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            NodeKind::Root(root) => format!("Root({})", root.name),
            NodeKind::Syntax(syntax) => format!("Syntax({})", syntax.tags()),
            NodeKind::Wrapper(_) => "Wrapper".to_string(),
        };
        match self.source_section() {
            Some(section) => write!(f, "{kind}@{section}"),
            None => f.write_str(&kind),
        }
    }
}
