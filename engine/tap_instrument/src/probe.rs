//! Probes: the runtime side of a wrapper.
//!
//! A [`ProbeNode`] belongs to exactly one wrapper and caches the event chain
//! of its location. The cache is guarded by a generation counter: every
//! structural change bumps the generation, and the next event on the
//! location rebuilds the chain under the tree's structural lock. Readers
//! never block on the hot path; they load the published chain and compare
//! one integer.
//!
//! The language's interpreter drives a probe through [`ProbeNode::execute`],
//! or through the individual hooks when it needs finer control:
//!
//! ```text
//! loop {
//!     on_enter
//!     delegate
//!     on_return_value
//!   on error:
//!     on_return_exceptional_or_unwind -> Reenter | Return(v) | Err
//! }
//! ```

mod chain;
mod context;
mod input;

pub use context::EventContext;
pub use input::InputHandle;

pub(crate) use chain::{ChainElement, ChainNode, ChainSnapshot};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tap_ir::{SourceSection, Tags, Value};

use crate::binding::EventBinding;
use crate::coordinator::Shared;
use crate::error::{Throw, TreeError};
use crate::frame::Frame;
use crate::listener::ExecutionEventListener;
use crate::tree::{Node, NodeRef};
use crate::unwind::{Resolution, Unwind, UnwindAction};

use chain::Round;

/// A node replaced by materialization while it may still be executing.
struct RetiredNode {
    node: Weak<Node>,
    tags: Tags,
}

/// Event dispatch for one instrumented location.
pub struct ProbeNode {
    id: u64,
    coordinator: Weak<Shared>,
    context: EventContext,
    errors_thrown: bool,
    generation: AtomicU64,
    chain: ArcSwapOption<ChainSnapshot>,
    retired: Mutex<Vec<RetiredNode>>,
}

impl ProbeNode {
    pub(crate) fn new(
        id: u64,
        coordinator: Weak<Shared>,
        wrapper: Weak<Node>,
        section: Option<SourceSection>,
        errors_thrown: bool,
    ) -> Self {
        ProbeNode {
            id,
            coordinator,
            context: EventContext::new(wrapper, section),
            errors_thrown,
            generation: AtomicU64::new(0),
            chain: ArcSwapOption::empty(),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    /// Force the next event to rebuild the chain.
    pub(crate) fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Remember `node`, replaced by a materialization for `tags`, so later
    /// walks still reach it while it executes.
    pub(crate) fn retire(&self, node: &NodeRef, tags: Tags) {
        let mut retired = self.retired.lock();
        retired.retain(|entry| entry.node.strong_count() > 0);
        retired.push(RetiredNode {
            node: Arc::downgrade(node),
            tags,
        });
    }

    /// Retired nodes still alive somewhere, oldest first.
    pub(crate) fn retired_nodes(&self) -> Vec<(NodeRef, Tags)> {
        let mut retired = self.retired.lock();
        retired.retain(|entry| entry.node.strong_count() > 0);
        retired
            .iter()
            .filter_map(|entry| Some((entry.node.upgrade()?, entry.tags)))
            .collect()
    }

    fn has_retired(&self) -> bool {
        self.retired
            .lock()
            .iter()
            .any(|entry| entry.node.strong_count() > 0)
    }

    /// The node `binding`'s factory created here, if the published chain
    /// holds one. Never builds a chain.
    pub(crate) fn lookup(&self, binding: &EventBinding) -> Option<Arc<dyn ExecutionEventListener>> {
        let chain = self.chain.load();
        let (node, _) = (*chain).as_ref()?.event_node(binding)?;
        Some(Arc::clone(node))
    }

    fn current_chain(&self) -> Result<Arc<ChainSnapshot>, Throw> {
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(chain) = self.chain.load_full() {
            if chain.generation == generation {
                return Ok(chain);
            }
        }
        self.rebuild()
    }

    fn rebuild(&self) -> Result<Arc<ChainSnapshot>, Throw> {
        let (Some(shared), Some(wrapper)) = (self.coordinator.upgrade(), self.context.node())
        else {
            let generation = self.generation.load(Ordering::Acquire);
            return Ok(Arc::new(ChainSnapshot::new(generation, Vec::new())));
        };
        let lock = wrapper
            .structure_lock()
            .unwrap_or_else(|| shared.detached_lock());
        let (fresh, previous) = {
            let _guard = lock.lock();
            let generation = self.generation.load(Ordering::Acquire);
            let previous = self.chain.load_full();
            if let Some(chain) = previous.as_ref().filter(|c| c.generation == generation) {
                return Ok(Arc::clone(chain));
            }
            let nodes = shared.build_chain(self, &wrapper, previous.as_deref())?;
            if nodes.is_empty() && !self.has_retired() {
                self.remove_wrapper(&wrapper)?;
            }
            let fresh = Arc::new(ChainSnapshot::new(generation, nodes));
            self.chain.store(Some(Arc::clone(&fresh)));
            (fresh, previous)
        };
        tracing::trace!(
            probe = self.id,
            generation = fresh.generation,
            entries = fresh.nodes.len(),
            "rebuilt event chain"
        );
        if let Some(previous) = previous {
            previous.dispose(&self.context, Some(&fresh));
        }
        Ok(fresh)
    }

    fn remove_wrapper(&self, wrapper: &NodeRef) -> Result<(), TreeError> {
        let (Some(parent), Some(delegate)) = (wrapper.parent(), wrapper.delegate()) else {
            return Ok(());
        };
        match Node::replace_child(&parent, wrapper, &delegate) {
            Ok(()) => {
                tracing::debug!(probe = self.id, "removed unused wrapper");
                Ok(())
            }
            // Already swapped out by a materialization.
            Err(TreeError::ChildNotFound) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Dispose the published chain without replacing it.
    pub(crate) fn dispose_chain(&self) {
        if let Some(chain) = self.chain.swap(None) {
            chain.dispose(&self.context, None);
        }
    }

    pub fn on_enter(&self, frame: &mut Frame) -> Result<(), Throw> {
        let chain = self.current_chain()?;
        let mut round = Round::new(self.errors_thrown);
        chain.on_enter(&self.context, frame, &mut round)?;
        round.finish()
    }

    pub fn on_return_value(&self, frame: &mut Frame, result: &Value) -> Result<(), Throw> {
        let chain = self.current_chain()?;
        let mut round = Round::new(self.errors_thrown);
        chain.on_return_value(&self.context, frame, result, None, &mut round)?;
        round.finish()
    }

    pub(crate) fn on_input_value(
        &self,
        frame: &mut Frame,
        binding: &EventBinding,
        input: &EventContext,
        index: usize,
        value: &Value,
    ) -> Result<(), Throw> {
        let chain = self.current_chain()?;
        let mut round = Round::new(self.errors_thrown);
        chain.on_input_value(&self.context, frame, binding, input, index, value, &mut round)?;
        round.finish()
    }

    /// Report that the location did not return normally and decide how
    /// execution continues.
    ///
    /// `is_return_called` tells whether `on_return_value` already ran for
    /// this execution; hooks raising from there are not told twice.
    pub fn on_return_exceptional_or_unwind(
        &self,
        frame: &mut Frame,
        thrown: Throw,
        is_return_called: bool,
    ) -> Result<UnwindAction, Throw> {
        let chain = self.current_chain()?;
        match thrown {
            Throw::Tree(_) => Err(thrown),
            Throw::Unwind(unwind) => self.resolve(&chain, frame, unwind, is_return_called),
            mut thrown => {
                let mut round = Round::new(self.errors_thrown);
                if !is_return_called {
                    chain.on_return_exceptional(&self.context, frame, &thrown, None, &mut round)?;
                }
                if let Some(error) = round.take_error() {
                    thrown.add_suppressed(error).map_err(Throw::Observer)?;
                }
                match round.take_unwind() {
                    Some(unwind) => self.resolve(&chain, frame, unwind, true),
                    None => Err(thrown),
                }
            }
        }
    }

    /// Offer `unwind` to its targets here. Entries that are not addressed
    /// get their closing notification, unless `notified`.
    fn resolve(
        &self,
        chain: &ChainSnapshot,
        frame: &mut Frame,
        unwind: Unwind,
        notified: bool,
    ) -> Result<UnwindAction, Throw> {
        let mut round = Round::new(self.errors_thrown);
        let resolution = chain.on_unwind(&self.context, frame, &unwind, &mut round)?;
        tracing::trace!(probe = self.id, %unwind, ?resolution, "resolved unwind");
        match resolution {
            Resolution::Return(value) => {
                if !notified {
                    chain.on_return_value(&self.context, frame, &value, Some(&unwind), &mut round)?;
                }
                round.finish()?;
                Ok(UnwindAction::Return(value))
            }
            Resolution::Reenter => {
                if !notified {
                    let thrown = Throw::Unwind(unwind.clone());
                    chain.on_return_exceptional(
                        &self.context,
                        frame,
                        &thrown,
                        Some(&unwind),
                        &mut round,
                    )?;
                }
                round.finish()?;
                Ok(UnwindAction::Reenter)
            }
            Resolution::Ignored | Resolution::Continue => {
                let thrown = Throw::Unwind(unwind);
                if !notified {
                    let skip = thrown.as_unwind();
                    chain.on_return_exceptional(&self.context, frame, &thrown, skip, &mut round)?;
                }
                round.finish()?;
                Err(thrown)
            }
        }
    }

    /// Run one execution of the wrapped location.
    ///
    /// `delegate` executes the wrapped node; it is called again on every
    /// re-entry, so it should look the node up afresh.
    pub fn execute<F>(&self, frame: &mut Frame, mut delegate: F) -> Result<Value, Throw>
    where
        F: FnMut(&mut Frame) -> Result<Value, Throw>,
    {
        loop {
            let mut is_return_called = false;
            let thrown = match self.on_enter(frame) {
                Err(thrown) => thrown,
                Ok(()) => match delegate(frame) {
                    Err(thrown) => thrown,
                    Ok(result) => {
                        is_return_called = true;
                        match self.on_return_value(frame, &result) {
                            Ok(()) => return Ok(result),
                            Err(thrown) => thrown,
                        }
                    }
                },
            };
            match self.on_return_exceptional_or_unwind(frame, thrown, is_return_called)? {
                UnwindAction::Reenter => {
                    tracing::trace!(probe = self.id, "re-entering location");
                }
                UnwindAction::Return(value) => return Ok(value),
            }
        }
    }
}
