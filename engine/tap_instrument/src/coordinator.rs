//! The instrumentation coordinator.
//!
//! [`Instrumentation`] is the engine-facing half: languages report trees and
//! lifecycle events into it. [`Instrumenter`] is the observer-facing half:
//! every attach call creates an [`EventBinding`], registers it, and walks
//! whatever trees it could already affect before returning. Both share one
//! [`Shared`] state, which bindings and probes reach through weak handles.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tap_filter::{Location, LocationFilter};
use tap_ir::{Source, Tags};
use tap_registry::{AsyncList, CowList, Strong, WeakAsyncList};
use tap_stack::with_stack_headroom;

use crate::binding::{BindingKind, EventBinding, ExecutionElement};
use crate::broadcast::{
    AllocationFilter, AllocationListener, AllocationReporter, ContextId, ContextsListener,
    OutputListener, OutputStream, ThreadsListener,
};
use crate::config::InstrumentationConfig;
use crate::error::{AttachError, TreeError};
use crate::listener::{
    ExecuteSourceListener, ExecutionEventListener, ExecutionEventNodeFactory, LoadSourceListener,
    LoadSourceSectionListener,
};
use crate::probe::{ChainElement, ChainNode, ChainSnapshot, EventContext, InputHandle, ProbeNode};
use crate::tree::{LanguageInfo, Node, NodeRef, RootNode, StructureLock};
use crate::visit::{OperationKind, Pending, Scope, SourceRegistry, VisitOperation, Visitor};

/// State shared by the coordinator, its instrumenters, bindings and probes.
pub(crate) struct Shared {
    this: Weak<Shared>,
    config: InstrumentationConfig,
    next_binding_id: AtomicU64,
    next_probe_id: AtomicU64,
    disposed: AtomicBool,

    execution_bindings: CowList<EventBinding>,
    section_bindings: CowList<EventBinding>,
    source_bindings: CowList<EventBinding>,
    executed_source_bindings: CowList<EventBinding>,
    output_bindings: CowList<EventBinding>,
    allocation_bindings: CowList<EventBinding>,
    context_bindings: CowList<EventBinding>,
    thread_bindings: CowList<EventBinding>,

    loaded_roots: WeakAsyncList<Node>,
    executed_roots: WeakAsyncList<Node>,
    loaded_sources: Mutex<SourceRegistry>,
    executed_sources: Mutex<SourceRegistry>,

    reporters: AsyncList<Strong<Arc<AllocationReporter>>>,
    reporter_lock: Mutex<()>,
    contexts: Mutex<Vec<ContextId>>,
    threads: Mutex<Vec<(ContextId, ThreadId)>>,

    pending: Mutex<FxHashMap<ThreadId, Pending>>,
    /// Serializes chain rebuilds of wrappers whose tree lost its root.
    detached_lock: Arc<StructureLock>,
}

impl Shared {
    fn new(this: &Weak<Shared>, config: InstrumentationConfig) -> Self {
        let capacity = config.initial_list_capacity();
        Shared {
            this: this.clone(),
            config,
            next_binding_id: AtomicU64::new(1),
            next_probe_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            execution_bindings: CowList::new(),
            section_bindings: CowList::new(),
            source_bindings: CowList::new(),
            executed_source_bindings: CowList::new(),
            output_bindings: CowList::new(),
            allocation_bindings: CowList::new(),
            context_bindings: CowList::new(),
            thread_bindings: CowList::new(),
            loaded_roots: WeakAsyncList::with_capacity(capacity),
            executed_roots: WeakAsyncList::with_capacity(capacity),
            loaded_sources: Mutex::default(),
            executed_sources: Mutex::default(),
            reporters: AsyncList::new(),
            reporter_lock: Mutex::new(()),
            contexts: Mutex::default(),
            threads: Mutex::default(),
            pending: Mutex::default(),
            detached_lock: Arc::new(StructureLock::new(())),
        }
    }

    pub(crate) fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    pub(crate) fn pending(&self) -> &Mutex<FxHashMap<ThreadId, Pending>> {
        &self.pending
    }

    pub(crate) fn detached_lock(&self) -> Arc<StructureLock> {
        Arc::clone(&self.detached_lock)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn new_binding(&self, kind: BindingKind, language: Option<Arc<LanguageInfo>>) -> EventBinding {
        let id = self.next_binding_id.fetch_add(1, Ordering::Relaxed);
        EventBinding::new(id, kind, language, self.this.clone())
    }

    fn walk(
        &self,
        operations: Vec<VisitOperation>,
        roots: &WeakAsyncList<Node>,
    ) -> Result<(), TreeError> {
        if operations.is_empty() {
            return Ok(());
        }
        Visitor::new(self, operations).visit_roots(roots.iter())
    }

    /// Notify-loaded for nodes a walk materializes, so section listeners
    /// see the new shapes.
    fn notify_materialized(&self) -> Option<VisitOperation> {
        let sections = self.section_bindings.snapshot();
        (!sections.is_empty()).then(|| {
            VisitOperation::new(
                OperationKind::NotifyLoaded,
                Scope::OnlyMaterialized,
                sections.to_vec(),
            )
        })
    }

    /// Wrap `node`, or invalidate its existing wrapper. Returns the wrapper.
    pub(crate) fn insert_wrapper(&self, node: &NodeRef) -> Result<NodeRef, TreeError> {
        if node.is_wrapper() {
            return Err(TreeError::NestedWrapper);
        }
        if let Some(wrapper) = node.wrapper() {
            if let Some(probe) = wrapper.probe() {
                probe.invalidate();
            }
            return Ok(wrapper);
        }
        let parent = node.parent().ok_or(TreeError::NoParent)?;
        let id = self.next_probe_id.fetch_add(1, Ordering::Relaxed);
        let section = node.source_section();
        let errors_thrown = self.config.observer_errors_are_thrown();
        let coordinator = self.this.clone();
        let wrapper = Node::new_wrapper(Arc::clone(node), |this| {
            ProbeNode::new(id, coordinator, this, section, errors_thrown)
        });
        Node::replace_child(&parent, node, &wrapper)?;
        node.set_parent(&wrapper);
        tracing::trace!(probe = id, ?node, "inserted wrapper");
        Ok(wrapper)
    }

    /// Event chain of `wrapper`'s location, one entry per matching active
    /// binding in attachment order.
    ///
    /// Factory nodes the `previous` chain holds for a binding are carried
    /// over; the factory is asked only for new ones.
    pub(crate) fn build_chain(
        &self,
        probe: &ProbeNode,
        wrapper: &NodeRef,
        previous: Option<&ChainSnapshot>,
    ) -> Result<Vec<ChainNode>, TreeError> {
        let mut nodes = Vec::new();
        let Some(node) = wrapper.delegate() else {
            return Ok(nodes);
        };
        let Some(root_ref) = wrapper.root() else {
            return Ok(nodes);
        };
        let Some(root) = root_ref.as_root() else {
            return Ok(nodes);
        };
        if node.is_wrapper() {
            return Err(TreeError::NestedWrapper);
        }
        let summary = root.summary();
        let language = root.language().id();
        let section = node.source_section();
        let location = Location {
            tags: node.tags(),
            section: section.as_ref(),
        };
        let ancestor = node.instrumentable_ancestor();
        let ancestor_section = ancestor.as_ref().and_then(|a| a.source_section());
        let parent = ancestor.as_ref().map(|a| Location {
            tags: a.tags(),
            section: ancestor_section.as_ref(),
        });

        for binding in self.execution_bindings.snapshot().iter() {
            if !binding.is_active() || !binding.is_instrumented_root(&summary, language) {
                continue;
            }
            if binding.is_instrumented_leaf(&location) {
                if let Some(element) = self.chain_element(probe, binding, &node, root, previous) {
                    nodes.push(ChainNode {
                        binding: binding.clone(),
                        element,
                    });
                }
            }
            if binding.is_child_instrumented(parent.as_ref(), &location) {
                if let Some(element) = input_forwarder(binding, &node, ancestor.as_ref()) {
                    nodes.push(ChainNode {
                        binding: binding.clone(),
                        element,
                    });
                }
            }
        }
        Ok(nodes)
    }

    fn chain_element(
        &self,
        probe: &ProbeNode,
        binding: &EventBinding,
        node: &NodeRef,
        root: &RootNode,
        previous: Option<&ChainSnapshot>,
    ) -> Option<ChainElement> {
        let BindingKind::Execution { element, .. } = binding.kind() else {
            return None;
        };
        let factory = match element {
            ExecutionElement::Listener(listener) => {
                return Some(ChainElement::Listener(Arc::clone(listener)));
            }
            ExecutionElement::Factory(factory) => factory,
        };
        let inputs = match binding.input_filter() {
            Some(filter) => {
                let mut found = Vec::new();
                collect_inputs(node, filter, &mut found);
                found
            }
            None => Vec::new(),
        };
        if let Some((held, handle)) = previous.and_then(|chain| chain.event_node(binding)) {
            if handle.input_count() == inputs.len() {
                return Some(ChainElement::EventNode {
                    node: Arc::clone(held),
                    inputs: handle.clone(),
                });
            }
        }
        let contexts = inputs.iter().map(input_context).collect();
        let handle = InputHandle::new(
            binding.id(),
            probe.id(),
            Some(Arc::clone(root.frame_descriptor())),
            contexts,
        );
        let created = factory.create(probe.context(), &handle);
        if created.is_none() {
            handle.release();
        }
        created.map(|node| ChainElement::EventNode {
            node,
            inputs: handle,
        })
    }

    /// Remove `binding` from its registry and undo what it caused.
    pub(crate) fn detach(&self, binding: &EventBinding) {
        match binding.kind() {
            BindingKind::Execution { .. } => {
                self.execution_bindings.retain(|held| held != binding);
                let operation = VisitOperation::new(
                    OperationKind::DisposeWrapper,
                    Scope::All,
                    vec![binding.clone()],
                );
                if let Err(error) = self.walk(vec![operation], &self.executed_roots) {
                    tracing::error!(binding = binding.id(), %error, "failed to detach binding");
                }
            }
            BindingKind::SourceSection { .. } => {
                self.section_bindings.retain(|held| held != binding);
            }
            BindingKind::SourceLoaded { .. } => {
                self.source_bindings.retain(|held| held != binding);
            }
            BindingKind::SourceExecuted { .. } => {
                self.executed_source_bindings.retain(|held| held != binding);
            }
            BindingKind::Output { .. } => {
                self.output_bindings.retain(|held| held != binding);
            }
            BindingKind::Allocation { .. } => {
                self.allocation_bindings.retain(|held| held != binding);
                let _creation = self.reporter_lock.lock();
                for reporter in self.reporters.iter() {
                    reporter.remove_binding(binding);
                }
            }
            BindingKind::Contexts { .. } => {
                self.context_bindings.retain(|held| held != binding);
            }
            BindingKind::Threads { .. } => {
                self.thread_bindings.retain(|held| held != binding);
            }
        }
    }

    /// Deliver what a finished walk queued.
    pub(crate) fn flush(&self, pending: Pending) {
        for (binding, event) in &pending.loaded {
            if !binding.is_active() {
                continue;
            }
            if let BindingKind::SourceSection { listener, .. } = binding.kind() {
                listener.on_load(event);
            }
        }
        announce_sources(&self.loaded_sources, &self.source_bindings, pending.sources);
        announce_sources(
            &self.executed_sources,
            &self.executed_source_bindings,
            pending.executed_sources,
        );
    }
}

/// Input children of `node` matching `filter`: the closest instrumentable
/// descendants, looking through wrappers.
fn collect_inputs(node: &Node, filter: &LocationFilter, found: &mut Vec<NodeRef>) {
    for child in node.children() {
        let child = match child.delegate() {
            Some(delegate) => delegate,
            None => child,
        };
        if child.is_instrumentable() {
            let section = child.source_section();
            let location = Location {
                tags: child.tags(),
                section: section.as_ref(),
            };
            if filter.is_node_included(&location) {
                found.push(child);
            }
        } else {
            with_stack_headroom(|| collect_inputs(&child, filter, found));
        }
    }
}

fn input_context(input: &NodeRef) -> EventContext {
    let target = input.wrapper().unwrap_or_else(|| Arc::clone(input));
    EventContext::new(Arc::downgrade(&target), input.source_section())
}

/// Forward `node`'s return value to the probe of `ancestor`, which counts it
/// among its inputs for `binding`.
fn input_forwarder(
    binding: &EventBinding,
    node: &NodeRef,
    ancestor: Option<&NodeRef>,
) -> Option<ChainElement> {
    let ancestor = ancestor?;
    let filter = binding.input_filter()?;
    let mut inputs = Vec::new();
    collect_inputs(ancestor, filter, &mut inputs);
    let index = inputs.iter().position(|input| Arc::ptr_eq(input, node))?;
    let wrapper = ancestor.wrapper()?;
    let probe = wrapper.probe()?;
    Some(ChainElement::InputForwarder {
        parent: Arc::downgrade(probe),
        index,
    })
}

/// Record `sources` and tell the bindings about the ones not seen before.
fn announce_sources(
    registry: &Mutex<SourceRegistry>,
    bindings: &CowList<EventBinding>,
    sources: Vec<Source>,
) {
    if sources.is_empty() {
        return;
    }
    let (fresh, listeners) = {
        let mut registry = registry.lock();
        (registry.insert_all(sources), bindings.snapshot())
    };
    for source in &fresh {
        tracing::trace!(%source, "discovered source");
        for binding in listeners.iter() {
            notify_source(binding, source);
        }
    }
}

fn notify_source(binding: &EventBinding, source: &Source) {
    if !binding.is_active() || !binding.filter().is_some_and(|f| f.includes_source(source)) {
        return;
    }
    match binding.kind() {
        BindingKind::SourceLoaded { listener, .. } => listener.on_load(source),
        BindingKind::SourceExecuted { listener, .. } => listener.on_execute(source),
        _ => {}
    }
}

/// Dispose the chains of every probe under `node`.
fn drain_probes(node: &Node) {
    if let Some(probe) = node.probe() {
        probe.dispose_chain();
    }
    for child in node.children() {
        with_stack_headroom(|| drain_probes(&child));
    }
}

/// The engine-facing coordinator. One per engine.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Instrumentation {
    shared: Arc<Shared>,
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self::new(InstrumentationConfig::default())
    }
}

impl Instrumentation {
    pub fn new(config: InstrumentationConfig) -> Self {
        Instrumentation {
            shared: Arc::new_cyclic(|this| Shared::new(this, config)),
        }
    }

    pub fn config(&self) -> &InstrumentationConfig {
        self.shared.config()
    }

    /// Instrumenter for tools. Errors of its observers are logged, not
    /// thrown, unless configured otherwise.
    pub fn client_instrumenter(&self) -> Instrumenter {
        Instrumenter {
            shared: Arc::clone(&self.shared),
            language: None,
        }
    }

    /// Privileged instrumenter of `language`. Its bindings only match trees
    /// of that language and their observer errors reach guest code.
    pub fn language_instrumenter(&self, language: Arc<LanguageInfo>) -> Instrumenter {
        Instrumenter {
            shared: Arc::clone(&self.shared),
            language: Some(language),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// A language finished building `root`.
    pub fn on_tree_loaded(&self, root: &NodeRef) -> Result<(), TreeError> {
        if root.as_root().is_none() || self.shared.is_disposed() {
            return Ok(());
        }
        self.shared.loaded_roots.add(Arc::downgrade(root));
        let mut operations = Vec::new();
        let sections = self.shared.section_bindings.snapshot();
        if !sections.is_empty() {
            operations.push(VisitOperation::new(
                OperationKind::NotifyLoaded,
                Scope::All,
                sections.to_vec(),
            ));
        }
        if !self.shared.source_bindings.is_empty() {
            operations.push(VisitOperation::always(OperationKind::FindSources));
        }
        if operations.is_empty() {
            tracing::trace!(?root, "registered loaded tree");
            return Ok(());
        }
        Visitor::new(&self.shared, operations).visit_roots([Arc::clone(root)])
    }

    /// `root` is about to execute. Only the first report per root does
    /// anything.
    pub fn on_tree_first_executed(&self, root: &NodeRef) -> Result<(), TreeError> {
        let Some(root_node) = root.as_root() else {
            return Ok(());
        };
        if self.shared.is_disposed() || !root_node.claim_first_execution() {
            return Ok(());
        }
        self.shared.executed_roots.add(Arc::downgrade(root));
        let mut operations = Vec::new();
        let executions = self.shared.execution_bindings.snapshot();
        if !executions.is_empty() {
            operations.push(VisitOperation::new(
                OperationKind::InsertWrapper,
                Scope::All,
                executions.to_vec(),
            ));
            operations.extend(self.shared.notify_materialized());
        }
        if !self.shared.executed_source_bindings.is_empty() {
            operations.push(VisitOperation::always(OperationKind::FindExecutedSources));
        }
        let walked = if operations.is_empty() {
            Ok(())
        } else {
            Visitor::new(&self.shared, operations).visit_roots([Arc::clone(root)])
        };
        root_node.set_executed();
        walked
    }

    /// A language swapped `subtree` into `root`.
    pub fn on_subtree_replaced(&self, root: &NodeRef, subtree: &NodeRef) -> Result<(), TreeError> {
        let Some(root_node) = root.as_root() else {
            return Ok(());
        };
        if self.shared.is_disposed() {
            return Ok(());
        }
        // Inputs of the enclosing location may have changed.
        if let Some(probe) = subtree
            .instrumentable_ancestor()
            .and_then(|ancestor| ancestor.wrapper())
            .and_then(|wrapper| wrapper.probe().cloned())
        {
            probe.invalidate();
        }
        let executed = root_node.bits().is_executed();
        let mut operations = Vec::new();
        let sections = self.shared.section_bindings.snapshot();
        if !sections.is_empty() {
            operations.push(VisitOperation::new(
                OperationKind::NotifyLoaded,
                Scope::All,
                sections.to_vec(),
            ));
        }
        if !self.shared.source_bindings.is_empty() {
            operations.push(VisitOperation::always(OperationKind::FindSources));
        }
        if executed {
            let executions = self.shared.execution_bindings.snapshot();
            if !executions.is_empty() {
                operations.push(VisitOperation::new(
                    OperationKind::InsertWrapper,
                    Scope::All,
                    executions.to_vec(),
                ));
            }
            if !self.shared.executed_source_bindings.is_empty() {
                operations.push(VisitOperation::always(OperationKind::FindExecutedSources));
            }
        }
        if operations.is_empty() {
            return Ok(());
        }
        Visitor::new(&self.shared, operations).visit_subtree(root, subtree)
    }

    /// Guest code wrote `bytes` to `stream`.
    pub fn write_output(&self, stream: OutputStream, bytes: &[u8]) {
        for binding in self.shared.output_bindings.snapshot().iter() {
            if !binding.is_active() {
                continue;
            }
            if let BindingKind::Output {
                stream: wanted,
                listener,
            } = binding.kind()
            {
                if *wanted == stream {
                    listener.on_write(bytes);
                }
            }
        }
    }

    /// The allocation reporter of `language`, created on first request.
    pub fn allocation_reporter(&self, language: &str) -> Arc<AllocationReporter> {
        let _creation = self.shared.reporter_lock.lock();
        if let Some(reporter) = self
            .shared
            .reporters
            .iter()
            .find(|reporter| reporter.language() == language)
        {
            return reporter;
        }
        let reporter = Arc::new(AllocationReporter::new(language));
        for binding in self.shared.allocation_bindings.snapshot().iter() {
            if allocation_filter(binding).is_some_and(|filter| filter.includes(language)) {
                reporter.add_binding(binding.clone());
            }
        }
        self.shared.reporters.add(Strong(Arc::clone(&reporter)));
        reporter
    }

    pub fn context_created(&self, context: ContextId) {
        let listeners = {
            let mut contexts = self.shared.contexts.lock();
            contexts.push(context);
            self.shared.context_bindings.snapshot()
        };
        for binding in listeners.iter().filter(|b| b.is_active()) {
            if let BindingKind::Contexts { listener, .. } = binding.kind() {
                listener.on_context_created(context);
            }
        }
    }

    pub fn context_closed(&self, context: ContextId) {
        let listeners = {
            let mut contexts = self.shared.contexts.lock();
            let before = contexts.len();
            contexts.retain(|&held| held != context);
            if contexts.len() == before {
                return;
            }
            self.shared.context_bindings.snapshot()
        };
        for binding in listeners.iter().filter(|b| b.is_active()) {
            if let BindingKind::Contexts { listener, .. } = binding.kind() {
                listener.on_context_closed(context);
            }
        }
    }

    pub fn thread_initialized(&self, context: ContextId, thread: ThreadId) {
        let listeners = {
            let mut threads = self.shared.threads.lock();
            threads.push((context, thread));
            self.shared.thread_bindings.snapshot()
        };
        for binding in listeners.iter().filter(|b| b.is_active()) {
            if let BindingKind::Threads { listener, .. } = binding.kind() {
                listener.on_thread_initialized(context, thread);
            }
        }
    }

    pub fn thread_disposed(&self, context: ContextId, thread: ThreadId) {
        let listeners = {
            let mut threads = self.shared.threads.lock();
            let before = threads.len();
            threads.retain(|&held| held != (context, thread));
            if threads.len() == before {
                return;
            }
            self.shared.thread_bindings.snapshot()
        };
        for binding in listeners.iter().filter(|b| b.is_active()) {
            if let BindingKind::Threads { listener, .. } = binding.kind() {
                listener.on_thread_disposed(context, thread);
            }
        }
    }

    /// Dispose every binding and the event chains of every executed tree.
    /// Later calls do nothing; later attach calls fail.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = &self.shared;
        for list in [
            &shared.execution_bindings,
            &shared.section_bindings,
            &shared.source_bindings,
            &shared.executed_source_bindings,
            &shared.output_bindings,
            &shared.allocation_bindings,
            &shared.context_bindings,
            &shared.thread_bindings,
        ] {
            for binding in list.take_all().iter() {
                binding.dispose();
            }
        }
        for root in shared.executed_roots.iter() {
            drain_probes(&root);
        }
        tracing::debug!("disposed instrumentation");
    }
}

fn allocation_filter(binding: &EventBinding) -> Option<&AllocationFilter> {
    match binding.kind() {
        BindingKind::Allocation { filter, .. } => Some(filter),
        _ => None,
    }
}

/// The observer-facing attach surface.
#[derive(Clone)]
pub struct Instrumenter {
    shared: Arc<Shared>,
    language: Option<Arc<LanguageInfo>>,
}

impl Instrumenter {
    /// The language this instrumenter is privileged for.
    pub fn language(&self) -> Option<&Arc<LanguageInfo>> {
        self.language.as_ref()
    }

    fn ensure_live(&self) -> Result<(), AttachError> {
        if self.shared.is_disposed() {
            return Err(AttachError::Disposed);
        }
        Ok(())
    }

    /// Language instrumenters may only filter on tags their language
    /// provides.
    fn check_tags(&self, filter: &LocationFilter) -> Result<(), AttachError> {
        let Some(language) = &self.language else {
            return Ok(());
        };
        let undeclared = filter.referenced_tags().difference(language.provided_tags());
        if undeclared.is_empty() {
            return Ok(());
        }
        Err(AttachError::UndeclaredTags {
            language: language.id().to_string(),
            undeclared,
        })
    }

    fn bind(&self, kind: BindingKind) -> EventBinding {
        self.shared.new_binding(kind, self.language.clone())
    }

    /// One listener for every location `filter` matches.
    pub fn attach_execution_listener(
        &self,
        filter: LocationFilter,
        listener: Arc<dyn ExecutionEventListener>,
    ) -> Result<EventBinding, AttachError> {
        self.attach_execution(filter, None, ExecutionElement::Listener(listener))
    }

    /// One node per location `filter` matches, created by `factory` when
    /// the location first runs.
    pub fn attach_execution_factory(
        &self,
        filter: LocationFilter,
        factory: Arc<dyn ExecutionEventNodeFactory>,
    ) -> Result<EventBinding, AttachError> {
        self.attach_execution(filter, None, ExecutionElement::Factory(factory))
    }

    /// Like [`attach_execution_factory`](Self::attach_execution_factory),
    /// and every created node also hears the return values of the children
    /// `input_filter` matches.
    pub fn attach_execution_factory_with_inputs(
        &self,
        filter: LocationFilter,
        input_filter: LocationFilter,
        factory: Arc<dyn ExecutionEventNodeFactory>,
    ) -> Result<EventBinding, AttachError> {
        self.attach_execution(filter, Some(input_filter), ExecutionElement::Factory(factory))
    }

    fn attach_execution(
        &self,
        filter: LocationFilter,
        input_filter: Option<LocationFilter>,
        element: ExecutionElement,
    ) -> Result<EventBinding, AttachError> {
        self.ensure_live()?;
        self.check_tags(&filter)?;
        if let Some(input_filter) = &input_filter {
            self.check_tags(input_filter)?;
        }
        let binding = self.bind(BindingKind::Execution {
            filter,
            input_filter,
            element,
        });
        self.shared.execution_bindings.push(binding.clone());
        let mut operations = vec![VisitOperation::new(
            OperationKind::InsertWrapper,
            Scope::All,
            vec![binding.clone()],
        )];
        operations.extend(self.shared.notify_materialized());
        self.finish_attach(&binding, operations, &self.shared.executed_roots)?;
        Ok(binding)
    }

    /// Walk `roots` for a freshly registered binding; a broken tree
    /// detaches it again.
    fn finish_attach(
        &self,
        binding: &EventBinding,
        operations: Vec<VisitOperation>,
        roots: &WeakAsyncList<Node>,
    ) -> Result<(), AttachError> {
        if let Err(error) = self.shared.walk(operations, roots) {
            binding.dispose();
            return Err(error.into());
        }
        tracing::debug!(binding = ?binding, "attached binding");
        Ok(())
    }

    /// Hear about every loaded location `filter` matches. With
    /// `notify_loaded`, locations loaded before this call are reported
    /// before it returns.
    pub fn attach_source_section_listener(
        &self,
        filter: LocationFilter,
        listener: Arc<dyn LoadSourceSectionListener>,
        notify_loaded: bool,
    ) -> Result<EventBinding, AttachError> {
        self.ensure_live()?;
        self.check_tags(&filter)?;
        let binding = self.bind(BindingKind::SourceSection { filter, listener });
        self.shared.section_bindings.push(binding.clone());
        let operations = if notify_loaded {
            vec![VisitOperation::new(
                OperationKind::NotifyLoaded,
                Scope::All,
                vec![binding.clone()],
            )]
        } else {
            Vec::new()
        };
        self.finish_attach(&binding, operations, &self.shared.loaded_roots)?;
        Ok(binding)
    }

    /// Report the loaded locations `filter` matches once, without staying
    /// attached.
    pub fn visit_loaded_source_sections(
        &self,
        filter: LocationFilter,
        listener: Arc<dyn LoadSourceSectionListener>,
    ) -> Result<(), AttachError> {
        self.ensure_live()?;
        self.check_tags(&filter)?;
        let binding = self.bind(BindingKind::SourceSection { filter, listener });
        let operation =
            VisitOperation::new(OperationKind::NotifyLoaded, Scope::All, vec![binding.clone()]);
        let walked = self.shared.walk(vec![operation], &self.shared.loaded_roots);
        binding.dispose();
        walked.map_err(AttachError::from)
    }

    /// Hear once about every distinct loaded source `filter` matches.
    /// `filter` may only test sources.
    pub fn attach_source_listener(
        &self,
        filter: LocationFilter,
        listener: Arc<dyn LoadSourceListener>,
        notify_loaded: bool,
    ) -> Result<EventBinding, AttachError> {
        self.ensure_live()?;
        if !filter.is_source_only() {
            return Err(AttachError::NotSourceOnly {
                binding: "source-loaded",
                filter: filter.to_string(),
            });
        }
        let binding = self.bind(BindingKind::SourceLoaded { filter, listener });
        self.attach_source_binding(
            &binding,
            OperationKind::FindSources,
            &self.shared.loaded_roots,
            &self.shared.loaded_sources,
            &self.shared.source_bindings,
            notify_loaded,
        )?;
        Ok(binding)
    }

    /// Hear once about every distinct source `filter` matches that started
    /// executing. `filter` may only test sources.
    pub fn attach_execute_source_listener(
        &self,
        filter: LocationFilter,
        listener: Arc<dyn ExecuteSourceListener>,
        notify_executed: bool,
    ) -> Result<EventBinding, AttachError> {
        self.ensure_live()?;
        if !filter.is_source_only() {
            return Err(AttachError::NotSourceOnly {
                binding: "source-executed",
                filter: filter.to_string(),
            });
        }
        let binding = self.bind(BindingKind::SourceExecuted { filter, listener });
        self.attach_source_binding(
            &binding,
            OperationKind::FindExecutedSources,
            &self.shared.executed_roots,
            &self.shared.executed_sources,
            &self.shared.executed_source_bindings,
            notify_executed,
        )?;
        Ok(binding)
    }

    /// Bring `registry` up to date with `roots`, then register `binding`
    /// and replay the sources known at that point. Registration and replay
    /// share the registry lock with discovery, so each source is reported
    /// to the binding exactly once.
    fn attach_source_binding(
        &self,
        binding: &EventBinding,
        discover: OperationKind,
        roots: &WeakAsyncList<Node>,
        registry: &Mutex<SourceRegistry>,
        bindings: &CowList<EventBinding>,
        replay: bool,
    ) -> Result<(), AttachError> {
        self.shared.walk(vec![VisitOperation::always(discover)], roots)?;
        let known = {
            let registry = registry.lock();
            bindings.push(binding.clone());
            if replay {
                registry.sources().to_vec()
            } else {
                Vec::new()
            }
        };
        for source in &known {
            notify_source(binding, source);
        }
        tracing::debug!(binding = ?binding, replayed = known.len(), "attached binding");
        Ok(())
    }

    pub fn attach_output_listener(
        &self,
        stream: OutputStream,
        listener: Arc<dyn OutputListener>,
    ) -> Result<EventBinding, AttachError> {
        self.ensure_live()?;
        let binding = self.bind(BindingKind::Output { stream, listener });
        self.shared.output_bindings.push(binding.clone());
        Ok(binding)
    }

    pub fn attach_allocation_listener(
        &self,
        filter: AllocationFilter,
        listener: Arc<dyn AllocationListener>,
    ) -> Result<EventBinding, AttachError> {
        self.ensure_live()?;
        let binding = self.bind(BindingKind::Allocation { filter, listener });
        let _creation = self.shared.reporter_lock.lock();
        self.shared.allocation_bindings.push(binding.clone());
        for reporter in self.shared.reporters.iter() {
            if allocation_filter(&binding).is_some_and(|f| f.includes(reporter.language())) {
                reporter.add_binding(binding.clone());
            }
        }
        Ok(binding)
    }

    /// Hear about contexts; with `include_active`, contexts already open are
    /// reported as created before this returns.
    pub fn attach_contexts_listener(
        &self,
        listener: Arc<dyn ContextsListener>,
        include_active: bool,
    ) -> Result<EventBinding, AttachError> {
        self.ensure_live()?;
        let binding = self.bind(BindingKind::Contexts {
            listener: Arc::clone(&listener),
            include_active,
        });
        let active = {
            let contexts = self.shared.contexts.lock();
            self.shared.context_bindings.push(binding.clone());
            if include_active {
                contexts.clone()
            } else {
                Vec::new()
            }
        };
        for context in active {
            listener.on_context_created(context);
        }
        Ok(binding)
    }

    /// Hear about threads; with `include_started`, threads already running
    /// are reported as initialized before this returns.
    pub fn attach_threads_listener(
        &self,
        listener: Arc<dyn ThreadsListener>,
        include_started: bool,
    ) -> Result<EventBinding, AttachError> {
        self.ensure_live()?;
        let binding = self.bind(BindingKind::Threads {
            listener: Arc::clone(&listener),
            include_started,
        });
        let started = {
            let threads = self.shared.threads.lock();
            self.shared.thread_bindings.push(binding.clone());
            if include_started {
                threads.clone()
            } else {
                Vec::new()
            }
        };
        for (context, thread) in started {
            listener.on_thread_initialized(context, thread);
        }
        Ok(binding)
    }

    /// The node `binding`'s factory created at `node`'s location, if the
    /// location has run since it was last invalidated.
    pub fn lookup_execution_event_node(
        &self,
        node: &NodeRef,
        binding: &EventBinding,
    ) -> Option<Arc<dyn ExecutionEventListener>> {
        let wrapper = if node.is_wrapper() {
            Arc::clone(node)
        } else {
            node.wrapper()?
        };
        wrapper.probe()?.lookup(binding)
    }

    pub fn query_tags(&self, node: &Node) -> Tags {
        node.tags()
    }
}
