//! Event chains: the ordered per-location dispatch lists.
//!
//! A chain is immutable once published. Hooks run in attachment order on
//! enter and in reverse attachment order on every way out. Each dispatch
//! collects what the hooks raised into a [`Round`].

use std::sync::{Arc, Weak};

use tap_ir::Value;

use crate::binding::EventBinding;
use crate::error::{ObserverError, Throw};
use crate::frame::Frame;
use crate::listener::ExecutionEventListener;
use crate::probe::{EventContext, InputHandle, ProbeNode};
use crate::unwind::{Resolution, Unwind};

/// What a chain entry dispatches to.
pub(crate) enum ChainElement {
    /// A listener shared by all locations of its binding.
    Listener(Arc<dyn ExecutionEventListener>),
    /// A node a factory created for this location.
    EventNode {
        node: Arc<dyn ExecutionEventListener>,
        inputs: InputHandle,
    },
    /// Hands this location's return value to the probe of the enclosing
    /// location, which registered it as input `index`.
    InputForwarder {
        parent: Weak<ProbeNode>,
        index: usize,
    },
}

pub(crate) struct ChainNode {
    pub(crate) binding: EventBinding,
    pub(crate) element: ChainElement,
}

impl ChainNode {
    fn listener(&self) -> Option<&dyn ExecutionEventListener> {
        match &self.element {
            ChainElement::Listener(listener) => Some(listener.as_ref()),
            ChainElement::EventNode { node, .. } => Some(node.as_ref()),
            ChainElement::InputForwarder { .. } => None,
        }
    }
}

/// A published chain and the probe generation it was built for.
pub(crate) struct ChainSnapshot {
    pub(crate) generation: u64,
    pub(crate) nodes: Box<[ChainNode]>,
}

impl ChainSnapshot {
    pub(crate) fn new(generation: u64, nodes: Vec<ChainNode>) -> Self {
        ChainSnapshot {
            generation,
            nodes: nodes.into_boxed_slice(),
        }
    }

    /// The factory-created node `binding` owns here, with its inputs.
    pub(crate) fn event_node(
        &self,
        binding: &EventBinding,
    ) -> Option<(&Arc<dyn ExecutionEventListener>, &InputHandle)> {
        self.nodes.iter().find_map(|entry| match &entry.element {
            ChainElement::EventNode { node, inputs } if entry.binding == *binding => {
                Some((node, inputs))
            }
            _ => None,
        })
    }

    fn holds(&self, node: &Arc<dyn ExecutionEventListener>) -> bool {
        self.nodes.iter().any(|entry| match &entry.element {
            ChainElement::EventNode { node: held, .. } => Arc::ptr_eq(held, node),
            _ => false,
        })
    }

    pub(crate) fn on_enter(
        &self,
        ctx: &EventContext,
        frame: &mut Frame,
        round: &mut Round,
    ) -> Result<(), Throw> {
        for entry in self.nodes.iter() {
            if let Some(listener) = entry.listener() {
                round.absorb(&entry.binding, "on_enter", listener.on_enter(ctx, frame))?;
            }
        }
        Ok(())
    }

    /// Deliver an input value to the nodes of `binding` that declared
    /// inputs.
    #[expect(clippy::too_many_arguments, reason = "mirrors the listener hook")]
    pub(crate) fn on_input_value(
        &self,
        ctx: &EventContext,
        frame: &mut Frame,
        binding: &EventBinding,
        input: &EventContext,
        index: usize,
        value: &Value,
        round: &mut Round,
    ) -> Result<(), Throw> {
        for entry in self.nodes.iter().rev() {
            let ChainElement::EventNode { node, inputs } = &entry.element else {
                continue;
            };
            if entry.binding != *binding || inputs.input_count() == 0 {
                continue;
            }
            let result = node.on_input_value(ctx, frame, input, index, value);
            round.absorb(&entry.binding, "on_input_value", result)?;
        }
        Ok(())
    }

    /// `skip` names an unwind whose targets were already told through
    /// `on_unwind`.
    pub(crate) fn on_return_value(
        &self,
        ctx: &EventContext,
        frame: &mut Frame,
        result: &Value,
        skip: Option<&Unwind>,
        round: &mut Round,
    ) -> Result<(), Throw> {
        for entry in self.nodes.iter().rev() {
            if skip.is_some_and(|unwind| unwind.is_addressed_to(&entry.binding)) {
                continue;
            }
            let outcome = match &entry.element {
                ChainElement::Listener(listener) => listener.on_return_value(ctx, frame, result),
                ChainElement::EventNode { node, inputs } => {
                    let outcome = node.on_return_value(ctx, frame, result);
                    inputs.clear(frame);
                    outcome
                }
                ChainElement::InputForwarder { parent, index } => match parent.upgrade() {
                    Some(parent) => {
                        parent.on_input_value(frame, &entry.binding, ctx, *index, result)
                    }
                    None => Ok(()),
                },
            };
            round.absorb(&entry.binding, "on_return_value", outcome)?;
        }
        Ok(())
    }

    pub(crate) fn on_return_exceptional(
        &self,
        ctx: &EventContext,
        frame: &mut Frame,
        error: &Throw,
        skip: Option<&Unwind>,
        round: &mut Round,
    ) -> Result<(), Throw> {
        for entry in self.nodes.iter().rev() {
            if skip.is_some_and(|unwind| unwind.is_addressed_to(&entry.binding)) {
                continue;
            }
            let outcome = match &entry.element {
                ChainElement::Listener(listener) => {
                    listener.on_return_exceptional(ctx, frame, error)
                }
                ChainElement::EventNode { node, inputs } => {
                    let outcome = node.on_return_exceptional(ctx, frame, error);
                    inputs.clear(frame);
                    outcome
                }
                ChainElement::InputForwarder { .. } => Ok(()),
            };
            round.absorb(&entry.binding, "on_return_exceptional", outcome)?;
        }
        Ok(())
    }

    /// Offer `unwind` to every entry it addresses, innermost-attached first,
    /// and fold their answers.
    pub(crate) fn on_unwind(
        &self,
        ctx: &EventContext,
        frame: &mut Frame,
        unwind: &Unwind,
        round: &mut Round,
    ) -> Result<Resolution, Throw> {
        let mut resolution = Resolution::Ignored;
        for entry in self.nodes.iter().rev() {
            let Some(listener) = entry.listener() else {
                continue;
            };
            let Some(info) = unwind.info_for(&entry.binding) else {
                continue;
            };
            let answer = match listener.on_unwind(ctx, frame, info) {
                Ok(action) => Resolution::from_action(action),
                Err(thrown) => {
                    round.absorb(&entry.binding, "on_unwind", Err(thrown))?;
                    Resolution::Continue
                }
            };
            resolution = resolution.merge(answer);
        }
        Ok(resolution)
    }

    /// Tell the factory nodes that `replacement` does not carry over that
    /// their chain is gone. Every node is told; failures are logged.
    pub(crate) fn dispose(&self, ctx: &EventContext, replacement: Option<&ChainSnapshot>) {
        let mut failure = None;
        for entry in self.nodes.iter() {
            let ChainElement::EventNode { node, inputs } = &entry.element else {
                continue;
            };
            if replacement.is_some_and(|chain| chain.holds(node)) {
                continue;
            }
            if let Err(thrown) = node.on_dispose(ctx) {
                let error = match thrown {
                    Throw::Observer(error) => error,
                    other => ObserverError::new(other.to_string()),
                };
                ObserverError::aggregate(
                    &mut failure,
                    error.attribute("on_dispose", entry.binding.id()),
                );
            }
            inputs.release();
        }
        if let Some(error) = failure {
            tracing::warn!(
                event = "on_dispose",
                binding = error.binding(),
                suppressed = error.suppressed().len(),
                %error,
                "event node disposal failed"
            );
        }
    }
}

/// Everything one dispatch round raised.
///
/// Unwinds are chained in the order raised. Observer errors of privileged
/// bindings (or of every binding, when configured) are aggregated; the rest
/// are logged and dropped. Guest exceptions and tree errors end the round
/// at once.
pub(crate) struct Round {
    errors_thrown: bool,
    unwind: Option<Unwind>,
    error: Option<ObserverError>,
}

impl Round {
    pub(crate) fn new(errors_thrown: bool) -> Self {
        Round {
            errors_thrown,
            unwind: None,
            error: None,
        }
    }

    fn absorb(
        &mut self,
        binding: &EventBinding,
        event: &'static str,
        outcome: Result<(), Throw>,
    ) -> Result<(), Throw> {
        match outcome {
            Ok(()) => Ok(()),
            Err(Throw::Unwind(mut unwind)) => {
                unwind.bind_target(binding);
                Unwind::merge(&mut self.unwind, unwind);
                Ok(())
            }
            Err(Throw::Observer(error)) => {
                let error = error.attribute(event, binding.id());
                if self.errors_thrown || binding.is_language_binding() {
                    ObserverError::aggregate(&mut self.error, error);
                } else {
                    tracing::warn!(event, binding = binding.id(), %error, "observer failed");
                }
                Ok(())
            }
            Err(thrown @ (Throw::Guest(_) | Throw::Tree(_))) => Err(thrown),
        }
    }

    pub(crate) fn take_unwind(&mut self) -> Option<Unwind> {
        self.unwind.take()
    }

    pub(crate) fn take_error(&mut self) -> Option<ObserverError> {
        self.error.take()
    }

    /// The round's outcome: aggregated errors first, then unwinds.
    pub(crate) fn finish(self) -> Result<(), Throw> {
        if let Some(error) = self.error {
            if let Some(unwind) = &self.unwind {
                tracing::debug!(%unwind, %error, "observer error replaces unwind");
            }
            return Err(Throw::Observer(error));
        }
        match self.unwind {
            Some(unwind) => Err(Throw::Unwind(unwind)),
            None => Ok(()),
        }
    }
}
