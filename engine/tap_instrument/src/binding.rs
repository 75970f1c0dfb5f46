//! Event bindings.
//!
//! An [`EventBinding`] is the handle an attach call returns. It pairs a
//! filter with an observer; its [`BindingKind`] decides which registry it
//! lives in and which walks it drives. Disposal moves it through
//! `Active -> Disposing -> Disposed` exactly once; a binding that left
//! `Active` never matches again.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tap_filter::{Location, LocationFilter, RootSummary};
use tap_ir::Tags;

use crate::broadcast::{
    AllocationFilter, AllocationListener, ContextsListener, OutputListener, OutputStream,
    ThreadsListener,
};
use crate::coordinator::Shared;
use crate::listener::{
    ExecuteSourceListener, ExecutionEventListener, ExecutionEventNodeFactory, LoadSourceListener,
    LoadSourceSectionListener,
};
use crate::tree::LanguageInfo;

const ACTIVE: u8 = 0;
const DISPOSING: u8 = 1;
const DISPOSED: u8 = 2;

/// The observer of an execution binding.
#[derive(Clone)]
pub enum ExecutionElement {
    /// One listener shared by every matching location.
    Listener(Arc<dyn ExecutionEventListener>),
    /// A factory asked for one node per matching location.
    Factory(Arc<dyn ExecutionEventNodeFactory>),
}

/// What a binding observes.
#[derive(Clone)]
pub enum BindingKind {
    Execution {
        filter: LocationFilter,
        /// Children whose return values are delivered as inputs.
        input_filter: Option<LocationFilter>,
        element: ExecutionElement,
    },
    SourceSection {
        filter: LocationFilter,
        listener: Arc<dyn LoadSourceSectionListener>,
    },
    SourceLoaded {
        filter: LocationFilter,
        listener: Arc<dyn LoadSourceListener>,
    },
    SourceExecuted {
        filter: LocationFilter,
        listener: Arc<dyn ExecuteSourceListener>,
    },
    Output {
        stream: OutputStream,
        listener: Arc<dyn OutputListener>,
    },
    Allocation {
        filter: AllocationFilter,
        listener: Arc<dyn AllocationListener>,
    },
    Contexts {
        listener: Arc<dyn ContextsListener>,
        include_active: bool,
    },
    Threads {
        listener: Arc<dyn ThreadsListener>,
        include_started: bool,
    },
}

impl BindingKind {
    pub fn name(&self) -> &'static str {
        match self {
            BindingKind::Execution { .. } => "execution",
            BindingKind::SourceSection { .. } => "source-section",
            BindingKind::SourceLoaded { .. } => "source-loaded",
            BindingKind::SourceExecuted { .. } => "source-executed",
            BindingKind::Output { .. } => "output",
            BindingKind::Allocation { .. } => "allocation",
            BindingKind::Contexts { .. } => "contexts",
            BindingKind::Threads { .. } => "threads",
        }
    }
}

struct BindingInner {
    id: u64,
    kind: BindingKind,
    /// Set for bindings attached through a language instrumenter.
    language: Option<Arc<LanguageInfo>>,
    state: AtomicU8,
    coordinator: Weak<Shared>,
}

/// Handle to an attached observer.
///
/// Clones refer to the same binding; equality is identity.
#[derive(Clone)]
pub struct EventBinding(Arc<BindingInner>);

impl EventBinding {
    pub(crate) fn new(
        id: u64,
        kind: BindingKind,
        language: Option<Arc<LanguageInfo>>,
        coordinator: Weak<Shared>,
    ) -> Self {
        EventBinding(Arc::new(BindingInner {
            id,
            kind,
            language,
            state: AtomicU8::new(ACTIVE),
            coordinator,
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn kind(&self) -> &BindingKind {
        &self.0.kind
    }

    /// Whether the binding belongs to a language instrumenter. Errors of
    /// language bindings propagate into guest execution.
    pub fn is_language_binding(&self) -> bool {
        self.0.language.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.0.state.load(Ordering::Acquire) == ACTIVE
    }

    pub fn is_disposed(&self) -> bool {
        self.0.state.load(Ordering::Acquire) == DISPOSED
    }

    /// Detach the binding. Later calls do nothing.
    ///
    /// Wrappers that exist only for this binding are invalidated before this
    /// returns and disappear the next time their location executes. Calls
    /// already running on other threads complete; no new ones start.
    pub fn dispose(&self) {
        if self
            .0
            .state
            .compare_exchange(ACTIVE, DISPOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(shared) = self.0.coordinator.upgrade() {
            shared.detach(self);
        }
        self.0.state.store(DISPOSED, Ordering::Release);
        tracing::debug!(binding = self.id(), kind = self.kind().name(), "disposed binding");
    }

    /// The location filter of execution and load bindings.
    pub fn filter(&self) -> Option<&LocationFilter> {
        match self.kind() {
            BindingKind::Execution { filter, .. }
            | BindingKind::SourceSection { filter, .. }
            | BindingKind::SourceLoaded { filter, .. }
            | BindingKind::SourceExecuted { filter, .. } => Some(filter),
            _ => None,
        }
    }

    pub(crate) fn input_filter(&self) -> Option<&LocationFilter> {
        match self.kind() {
            BindingKind::Execution { input_filter, .. } => input_filter.as_ref(),
            _ => None,
        }
    }

    /// Tags worth materializing for, `None` for "everything the language
    /// provides".
    pub(crate) fn limited_tags(&self) -> Option<Tags> {
        let own = self.filter()?.limited_tags()?;
        match self.input_filter() {
            Some(input) => input.limited_tags().map(|tags| tags | own),
            None => Some(own),
        }
    }

    /// Root-level pre-check.
    pub(crate) fn is_instrumented_root(&self, root: &RootSummary<'_>, language: &str) -> bool {
        if let Some(own) = &self.0.language {
            if own.id() != language {
                return false;
            }
        }
        self.filter().is_some_and(|filter| filter.is_root_included(root))
    }

    /// Node-level match of the binding's own filter.
    pub(crate) fn is_instrumented_leaf(&self, location: &Location<'_>) -> bool {
        self.filter().is_some_and(|filter| filter.is_node_included(location))
    }

    /// Whether `location` is an input of `parent`, its nearest instrumentable
    /// ancestor, for this binding.
    pub(crate) fn is_child_instrumented(
        &self,
        parent: Option<&Location<'_>>,
        location: &Location<'_>,
    ) -> bool {
        let (Some(parent), Some(input)) = (parent, self.input_filter()) else {
            return false;
        };
        input.is_node_included(location) && self.is_instrumented_leaf(parent)
    }

    /// Root pre-check plus node-level match.
    pub(crate) fn is_instrumented_full(
        &self,
        root: &RootSummary<'_>,
        language: &str,
        location: &Location<'_>,
    ) -> bool {
        self.is_instrumented_root(root, language) && self.is_instrumented_leaf(location)
    }
}

impl PartialEq for EventBinding {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EventBinding {}

impl Hash for EventBinding {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for EventBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBinding#{}({}", self.id(), self.kind().name())?;
        if let Some(filter) = self.filter() {
            write!(f, ", {filter}")?;
        }
        f.write_str(")")
    }
}
