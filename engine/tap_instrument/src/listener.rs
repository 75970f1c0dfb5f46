//! Observer-side traits.
//!
//! Every hook has a default so observers implement only what they need.
//! Hooks returning `Result` may raise an unwind through
//! [`EventContext::create_unwind`] or fail with an
//! [`ObserverError`](crate::ObserverError).

use std::sync::Arc;

use tap_ir::{Source, SourceSection, Tags, Value};

use crate::error::Throw;
use crate::frame::Frame;
use crate::probe::{EventContext, InputHandle};
use crate::tree::NodeRef;
use crate::unwind::UnwindAction;

/// Receives execution events of the locations a binding matches.
///
/// Attached directly, one instance serves every location. Created by an
/// [`ExecutionEventNodeFactory`], one instance is owned by each location's
/// event chain and is told through [`on_dispose`](Self::on_dispose) when
/// that chain is replaced.
#[allow(unused_variables)]
pub trait ExecutionEventListener: Send + Sync {
    fn on_enter(&self, ctx: &EventContext, frame: &mut Frame) -> Result<(), Throw> {
        Ok(())
    }

    /// A child matching the binding's input filter returned `value`.
    fn on_input_value(
        &self,
        ctx: &EventContext,
        frame: &mut Frame,
        input: &EventContext,
        index: usize,
        value: &Value,
    ) -> Result<(), Throw> {
        Ok(())
    }

    fn on_return_value(
        &self,
        ctx: &EventContext,
        frame: &mut Frame,
        result: &Value,
    ) -> Result<(), Throw> {
        Ok(())
    }

    fn on_return_exceptional(
        &self,
        ctx: &EventContext,
        frame: &mut Frame,
        error: &Throw,
    ) -> Result<(), Throw> {
        Ok(())
    }

    /// An unwind addressed to this binding reached the location.
    ///
    /// `None` lets the unwind continue outward.
    fn on_unwind(
        &self,
        ctx: &EventContext,
        frame: &mut Frame,
        info: &Value,
    ) -> Result<Option<UnwindAction>, Throw> {
        Ok(None)
    }

    /// The owning chain was replaced. Only factory-created nodes get this.
    fn on_dispose(&self, ctx: &EventContext) -> Result<(), Throw> {
        Ok(())
    }
}

/// Creates one event node per (binding, location).
pub trait ExecutionEventNodeFactory: Send + Sync {
    /// `None` leaves the location without a node for this binding.
    fn create(
        &self,
        ctx: &EventContext,
        inputs: &InputHandle,
    ) -> Option<Arc<dyn ExecutionEventListener>>;
}

impl<F> ExecutionEventNodeFactory for F
where
    F: Fn(&EventContext, &InputHandle) -> Option<Arc<dyn ExecutionEventListener>> + Send + Sync,
{
    fn create(
        &self,
        ctx: &EventContext,
        inputs: &InputHandle,
    ) -> Option<Arc<dyn ExecutionEventListener>> {
        self(ctx, inputs)
    }
}

/// A matching location found in a loaded tree.
#[derive(Clone, Debug)]
pub struct LoadSourceSectionEvent {
    node: NodeRef,
    section: Option<SourceSection>,
}

impl LoadSourceSectionEvent {
    pub(crate) fn new(node: NodeRef, section: Option<SourceSection>) -> Self {
        LoadSourceSectionEvent { node, section }
    }

    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub fn section(&self) -> Option<&SourceSection> {
        self.section.as_ref()
    }

    pub fn tags(&self) -> Tags {
        self.node.tags()
    }
}

pub trait LoadSourceSectionListener: Send + Sync {
    fn on_load(&self, event: &LoadSourceSectionEvent);
}

impl<F: Fn(&LoadSourceSectionEvent) + Send + Sync> LoadSourceSectionListener for F {
    fn on_load(&self, event: &LoadSourceSectionEvent) {
        self(event);
    }
}

/// Told once about every distinct loaded source.
pub trait LoadSourceListener: Send + Sync {
    fn on_load(&self, source: &Source);
}

impl<F: Fn(&Source) + Send + Sync> LoadSourceListener for F {
    fn on_load(&self, source: &Source) {
        self(source);
    }
}

/// Told once about every distinct source that started executing.
pub trait ExecuteSourceListener: Send + Sync {
    fn on_execute(&self, source: &Source);
}

impl<F: Fn(&Source) + Send + Sync> ExecuteSourceListener for F {
    fn on_execute(&self, source: &Source) {
        self(source);
    }
}
