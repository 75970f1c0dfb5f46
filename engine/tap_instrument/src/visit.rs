//! Tree walks.
//!
//! Every attach call and lifecycle hook that needs to look at trees builds a
//! [`Visitor`] from the operations relevant right now and walks each tree
//! once for all of them. Per node, parent before children:
//!
//! 1. wrappers are looked through, non-instrumentable nodes only recursed
//! 2. retired copies of the node are revisited first
//! 3. the node is materialized for the tags the operations care about
//! 4. every operation in scope is applied
//! 5. children are walked with the nearest instrumentable ancestor
//!
//! Walks queue their notifications. The outermost walk on a thread flushes
//! the queue once it is done, outside any tree lock.

use std::mem;
use std::thread::{self, ThreadId};

use rustc_hash::FxHashSet;
use tap_filter::{Location, RootSummary};
use tap_ir::{RootBits, Source, SourceSection, Tags};
use tap_stack::with_stack_headroom;

use crate::binding::EventBinding;
use crate::coordinator::Shared;
use crate::error::TreeError;
use crate::listener::LoadSourceSectionEvent;
use crate::tree::{Node, NodeRef, RootNode};

/// Which nodes an operation applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scope {
    All,
    /// Nodes that existed before the walk.
    OnlyOriginal,
    /// Nodes created by materialization during the walk, with their
    /// subtrees.
    OnlyMaterialized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OperationKind {
    InsertWrapper,
    NotifyLoaded,
    DisposeWrapper,
    FindSources,
    FindExecutedSources,
}

impl OperationKind {
    /// Source discovery does not depend on bindings.
    fn always_perform(self) -> bool {
        matches!(self, OperationKind::FindSources | OperationKind::FindExecutedSources)
    }

    /// Whether every matching binding is told, rather than the first.
    fn for_each_binding(self) -> bool {
        self == OperationKind::NotifyLoaded
    }

    fn materializes(self) -> bool {
        matches!(self, OperationKind::InsertWrapper | OperationKind::NotifyLoaded)
    }

    /// Operations that would report the same location twice.
    fn skips_retired(self) -> bool {
        matches!(self, OperationKind::NotifyLoaded | OperationKind::FindSources)
    }
}

pub(crate) struct VisitOperation {
    kind: OperationKind,
    scope: Scope,
    bindings: Vec<EventBinding>,
}

impl VisitOperation {
    pub(crate) fn new(kind: OperationKind, scope: Scope, bindings: Vec<EventBinding>) -> Self {
        VisitOperation {
            kind,
            scope,
            bindings,
        }
    }

    pub(crate) fn always(kind: OperationKind) -> Self {
        Self::new(kind, Scope::All, Vec::new())
    }

    fn should_visit(&self, root: &RootSummary<'_>, language: &str) -> bool {
        if self.kind.always_perform() {
            return !root.bits.is_no_source_section();
        }
        self.bindings
            .iter()
            .any(|binding| binding.is_instrumented_root(root, language))
    }

    fn in_scope(&self, materialized: bool) -> bool {
        match self.scope {
            Scope::All => true,
            Scope::OnlyOriginal => !materialized,
            Scope::OnlyMaterialized => materialized,
        }
    }
}

/// Notifications queued by the walks of one thread.
#[derive(Default)]
pub(crate) struct Pending {
    depth: usize,
    pub(crate) loaded: Vec<(EventBinding, LoadSourceSectionEvent)>,
    pub(crate) sources: Vec<Source>,
    pub(crate) executed_sources: Vec<Source>,
}

impl Pending {
    fn append(&mut self, other: &mut Pending) {
        self.loaded.append(&mut other.loaded);
        self.sources.append(&mut other.sources);
        self.executed_sources.append(&mut other.executed_sources);
    }

    fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.sources.is_empty() && self.executed_sources.is_empty()
    }
}

/// Sources reported so far, in discovery order.
#[derive(Default)]
pub(crate) struct SourceRegistry {
    seen: FxHashSet<Source>,
    order: Vec<Source>,
}

impl SourceRegistry {
    /// Record `sources`, returning the ones not seen before.
    pub(crate) fn insert_all(&mut self, sources: Vec<Source>) -> Vec<Source> {
        let mut fresh = Vec::new();
        for source in sources {
            if self.seen.insert(source.clone()) {
                self.order.push(source.clone());
                fresh.push(source);
            }
        }
        fresh
    }

    pub(crate) fn sources(&self) -> &[Source] {
        &self.order
    }
}

/// Keeps the thread's walk depth; the outermost walk flushes on drop.
struct WalkGuard<'a> {
    shared: &'a Shared,
    thread: ThreadId,
}

impl<'a> WalkGuard<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let thread = thread::current().id();
        shared.pending().lock().entry(thread).or_default().depth += 1;
        WalkGuard { shared, thread }
    }

    fn queue(&self, walked: &mut Pending) {
        if walked.is_empty() {
            return;
        }
        if let Some(pending) = self.shared.pending().lock().get_mut(&self.thread) {
            pending.append(walked);
        }
    }
}

impl Drop for WalkGuard<'_> {
    fn drop(&mut self) {
        let finished = {
            let mut pending = self.shared.pending().lock();
            let Some(entry) = pending.get_mut(&self.thread) else {
                return;
            };
            entry.depth -= 1;
            if entry.depth > 0 {
                return;
            }
            pending.remove(&self.thread)
        };
        if let Some(finished) = finished {
            self.shared.flush(finished);
        }
    }
}

/// One batch of operations, applied to any number of trees.
pub(crate) struct Visitor<'a> {
    shared: &'a Shared,
    operations: Vec<VisitOperation>,
}

impl<'a> Visitor<'a> {
    pub(crate) fn new(shared: &'a Shared, operations: Vec<VisitOperation>) -> Self {
        Visitor { shared, operations }
    }

    #[tracing::instrument(level = "trace", skip_all)]
    pub(crate) fn visit_roots(
        &self,
        roots: impl IntoIterator<Item = NodeRef>,
    ) -> Result<(), TreeError> {
        let guard = WalkGuard::enter(self.shared);
        for root in roots {
            let mut walked = Pending::default();
            self.visit_root(&root, &mut walked)?;
            guard.queue(&mut walked);
        }
        Ok(())
    }

    /// Walk only `subtree`, a part of `root` that was just replaced.
    #[tracing::instrument(level = "trace", skip_all)]
    pub(crate) fn visit_subtree(&self, root: &NodeRef, subtree: &NodeRef) -> Result<(), TreeError> {
        let Some(root_node) = root.as_root() else {
            return Ok(());
        };
        let guard = WalkGuard::enter(self.shared);
        let summary = root_node.summary();
        let Some(mut walk) = self.start(root_node, &summary) else {
            return Ok(());
        };
        let lock = root.structure_lock();
        let _guard = lock.as_ref().map(|lock| lock.lock());
        let ancestor = subtree.instrumentable_ancestor().map(|node| Ancestor::of(&node));
        walk.visit(subtree, ancestor.as_ref(), false)?;
        if root_node.bits().is_initialized() {
            root_node.refine_bits(walk.computing);
        }
        walk.finish(root_node);
        guard.queue(&mut walk.pending);
        Ok(())
    }

    fn visit_root(&self, root: &NodeRef, walked: &mut Pending) -> Result<(), TreeError> {
        let Some(root_node) = root.as_root() else {
            return Ok(());
        };
        let summary = root_node.summary();
        let Some(mut walk) = self.start(root_node, &summary) else {
            return Ok(());
        };
        let lock = root.structure_lock();
        let _guard = lock.as_ref().map(|lock| lock.lock());
        if let Some(section) = root_node.section() {
            walk.compute_bits(Some(section));
            walk.discover(section);
        }
        for child in root.children() {
            walk.visit(&child, None, false)?;
        }
        root_node.refine_bits(walk.computing);
        walk.finish(root_node);
        mem::swap(walked, &mut walk.pending);
        Ok(())
    }

    /// Set up the walk of one root, or `None` when nothing needs it.
    fn start<'w>(
        &'w self,
        root: &'w RootNode,
        summary: &'w RootSummary<'w>,
    ) -> Option<Walk<'w>> {
        let language = root.language().id();
        let active: Vec<&VisitOperation> = self
            .operations
            .iter()
            .filter(|operation| operation.should_visit(summary, language))
            .collect();
        if active.is_empty() && root.bits().is_initialized() {
            return None;
        }
        let provided = root.language().provided_tags();
        let mut materialize: Option<Tags> = None;
        for operation in active.iter().filter(|op| op.kind.materializes()) {
            for binding in &operation.bindings {
                let tags = binding.limited_tags().unwrap_or(provided);
                materialize = Some(materialize.unwrap_or_default() | tags);
            }
        }
        let single = match active.as_slice() {
            [operation] => Some(*operation),
            _ => None,
        }
        .filter(|operation| !operation.kind.always_perform() && operation.bindings.len() == 1)
        .and_then(|operation| Some((operation, operation.bindings.first()?)));
        Some(Walk {
            shared: self.shared,
            summary,
            language,
            root_section: root.section(),
            executed: summary.bits.is_executed(),
            active,
            single,
            materialize,
            computing: RootBits::OPTIMISTIC,
            visiting_retired: false,
            visited: 0,
            pending: Pending::default(),
        })
    }
}

/// The nearest instrumentable ancestor, as filters see it.
struct Ancestor {
    tags: Tags,
    section: Option<SourceSection>,
}

impl Ancestor {
    fn of(node: &Node) -> Self {
        Ancestor {
            tags: node.tags(),
            section: node.source_section(),
        }
    }

    fn location(&self) -> Location<'_> {
        Location {
            tags: self.tags,
            section: self.section.as_ref(),
        }
    }
}

/// State of one walk over one root.
struct Walk<'w> {
    shared: &'w Shared,
    summary: &'w RootSummary<'w>,
    language: &'w str,
    root_section: Option<&'w SourceSection>,
    executed: bool,
    active: Vec<&'w VisitOperation>,
    single: Option<(&'w VisitOperation, &'w EventBinding)>,
    /// Tags to materialize for; `None` when no active operation needs it.
    materialize: Option<Tags>,
    computing: RootBits,
    visiting_retired: bool,
    visited: usize,
    pending: Pending,
}

impl Walk<'_> {
    fn visit(
        &mut self,
        node: &NodeRef,
        ancestor: Option<&Ancestor>,
        materialized: bool,
    ) -> Result<(), TreeError> {
        self.visited += 1;
        if node.is_wrapper() {
            return match node.delegate() {
                Some(delegate) => self.visit(&delegate, ancestor, materialized),
                None => Ok(()),
            };
        }
        if !node.is_instrumentable() {
            return self.visit_children(node, ancestor, materialized);
        }
        let section = node.source_section();
        self.compute_bits(section.as_ref());
        self.visit_retired(node, ancestor)?;

        let (node, materialized) = match self.materialize(node, section.as_ref(), ancestor)? {
            Some(fresh) => (fresh, true),
            None => (NodeRef::clone(node), materialized),
        };
        self.perform(&node, section.as_ref(), ancestor, materialized)?;

        let own = Ancestor {
            tags: node.tags(),
            section,
        };
        self.visit_children(&node, Some(&own), materialized)
    }

    fn visit_children(
        &mut self,
        node: &Node,
        ancestor: Option<&Ancestor>,
        materialized: bool,
    ) -> Result<(), TreeError> {
        for child in node.children() {
            with_stack_headroom(|| self.visit(&child, ancestor, materialized))?;
        }
        Ok(())
    }

    /// Walk `node` and its subtree as a copy that left the tree.
    fn visit_as_retired(
        &mut self,
        node: &NodeRef,
        ancestor: Option<&Ancestor>,
    ) -> Result<(), TreeError> {
        let outer = mem::replace(&mut self.visiting_retired, true);
        let result = self.visit(node, ancestor, false);
        self.visiting_retired = outer;
        result
    }

    fn visit_retired(&mut self, node: &Node, ancestor: Option<&Ancestor>) -> Result<(), TreeError> {
        let Some(probe) = node.wrapper().and_then(|wrapper| wrapper.probe().cloned()) else {
            return Ok(());
        };
        for (retired, tags) in probe.retired_nodes() {
            tracing::trace!(node = ?retired, %tags, "revisiting retired node");
            self.visit_as_retired(&retired, ancestor)?;
        }
        Ok(())
    }

    /// Replace `node` by its materialized form, if the language offers one.
    fn materialize(
        &mut self,
        node: &NodeRef,
        section: Option<&SourceSection>,
        ancestor: Option<&Ancestor>,
    ) -> Result<Option<NodeRef>, TreeError> {
        if self.visiting_retired {
            return Ok(None);
        }
        let (Some(tags), Some(syntax)) = (self.materialize, node.as_syntax()) else {
            return Ok(None);
        };
        let Some(fresh) = syntax.materialize(node, tags) else {
            return Ok(None);
        };
        if NodeRef::ptr_eq(&fresh, node) {
            return Ok(None);
        }
        if fresh.parent().is_some() {
            return Err(TreeError::AlreadyAdopted {
                section: TreeError::describe(section),
            });
        }
        let fresh_section = fresh.source_section();
        if fresh_section.as_ref() != section {
            return Err(TreeError::SectionMismatch {
                expected: TreeError::describe(section),
                found: TreeError::describe(fresh_section.as_ref()),
            });
        }

        let current = node.wrapper().unwrap_or_else(|| NodeRef::clone(node));
        let parent = current.parent().ok_or(TreeError::NoParent)?;
        Node::replace_child(&parent, &current, &fresh)?;
        tracing::debug!(node = ?fresh, %tags, "materialized node");

        if self.executed {
            // The old node may still be running; keep it reachable from the
            // location that replaced it.
            let wrapper = self.shared.insert_wrapper(&fresh)?;
            if let Some(probe) = wrapper.probe() {
                probe.retire(node, tags);
            }
            self.visit_as_retired(node, ancestor)?;
        }
        Ok(Some(fresh))
    }

    fn perform(
        &mut self,
        node: &NodeRef,
        section: Option<&SourceSection>,
        ancestor: Option<&Ancestor>,
        materialized: bool,
    ) -> Result<(), TreeError> {
        let location = Location {
            tags: node.tags(),
            section,
        };
        let parent = ancestor.map(Ancestor::location);

        if let Some((operation, binding)) = self.single {
            if self.applies(operation, materialized)
                && (binding.is_instrumented_leaf(&location)
                    || binding.is_child_instrumented(parent.as_ref(), &location))
            {
                self.apply(operation.kind, Some(binding), node, section)?;
            }
            return Ok(());
        }

        for index in 0..self.active.len() {
            let operation = self.active[index];
            if !self.applies(operation, materialized) {
                continue;
            }
            if operation.kind.always_perform() {
                self.apply(operation.kind, None, node, section)?;
                continue;
            }
            for binding in &operation.bindings {
                let matched = binding.is_instrumented_full(self.summary, self.language, &location)
                    || (binding.is_instrumented_root(self.summary, self.language)
                        && binding.is_child_instrumented(parent.as_ref(), &location));
                if matched {
                    self.apply(operation.kind, Some(binding), node, section)?;
                    if !operation.kind.for_each_binding() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn applies(&self, operation: &VisitOperation, materialized: bool) -> bool {
        operation.in_scope(materialized)
            && !(self.visiting_retired && operation.kind.skips_retired())
    }

    fn apply(
        &mut self,
        kind: OperationKind,
        binding: Option<&EventBinding>,
        node: &NodeRef,
        section: Option<&SourceSection>,
    ) -> Result<(), TreeError> {
        match kind {
            OperationKind::InsertWrapper if !self.visiting_retired => {
                self.shared.insert_wrapper(node)?;
            }
            // Retired nodes are out of the tree: only refresh what wraps them.
            OperationKind::InsertWrapper | OperationKind::DisposeWrapper => {
                if let Some(probe) = node.wrapper().as_deref().and_then(Node::probe) {
                    probe.invalidate();
                }
            }
            OperationKind::NotifyLoaded => {
                if let Some(binding) = binding {
                    let event = LoadSourceSectionEvent::new(NodeRef::clone(node), section.cloned());
                    self.pending.loaded.push((binding.clone(), event));
                }
            }
            OperationKind::FindSources | OperationKind::FindExecutedSources => {
                if let Some(section) = section {
                    self.discover(section);
                }
            }
        }
        Ok(())
    }

    fn discover(&mut self, section: &SourceSection) {
        for operation in &self.active {
            match operation.kind {
                OperationKind::FindSources => self.pending.sources.push(section.source().clone()),
                OperationKind::FindExecutedSources => {
                    self.pending.executed_sources.push(section.source().clone());
                }
                _ => {}
            }
        }
    }

    fn compute_bits(&mut self, section: Option<&SourceSection>) {
        let Some(section) = section else {
            return;
        };
        self.computing.remove(RootBits::NO_SOURCE_SECTION);
        match self.root_section {
            Some(root) => {
                if section.char_index() < root.char_index()
                    || section.char_end_index() > root.char_end_index()
                {
                    self.computing.remove(RootBits::SOURCE_SECTION_HIERARCHICAL);
                }
                if section.source() != root.source() {
                    self.computing.remove(RootBits::SAME_SOURCE);
                }
            }
            None => {
                self.computing
                    .remove(RootBits::SOURCE_SECTION_HIERARCHICAL | RootBits::SAME_SOURCE);
            }
        }
    }

    fn finish(&self, root: &RootNode) {
        if self.shared.config().trace() {
            let operations: Vec<OperationKind> = self.active.iter().map(|op| op.kind).collect();
            tracing::debug!(
                root = root.name(),
                ?operations,
                visited = self.visited,
                bits = ?root.bits(),
                "walked tree"
            );
        }
    }
}
