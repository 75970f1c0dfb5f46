//! The unwind protocol.
//!
//! An observer requests a control transfer by returning
//! `Err(ctx.create_unwind(info, target))` from a hook. The [`Unwind`] then
//! travels out of the location like an exception; every chain it passes
//! offers it to the target binding's `on_unwind`, which may re-enter the
//! location, force it to return a value, or let the unwind continue.
//!
//! Several unwinds raised in one dispatch round are chained, never dropped.

use std::fmt;

use tap_ir::Value;

use crate::binding::EventBinding;

/// A one-shot control-transfer request.
///
/// Owned by the thread that raised it; moving it through `Result`s keeps it
/// single-threaded. Clone it to raise the same request again later.
#[derive(Clone, Debug)]
pub struct Unwind {
    info: Value,
    target: Option<EventBinding>,
    next: Option<Box<Unwind>>,
}

impl Unwind {
    pub(crate) fn new(info: Value, target: Option<EventBinding>) -> Self {
        Unwind {
            info,
            target,
            next: None,
        }
    }

    /// The payload handed to the target's `on_unwind`.
    pub fn info(&self) -> &Value {
        &self.info
    }

    /// The binding this unwind is addressed to. Unset until the unwind
    /// leaves the hook that created it without an explicit target.
    pub fn target(&self) -> Option<&EventBinding> {
        self.target.as_ref()
    }

    /// Every binding addressed by this unwind and the ones chained to it.
    pub fn targets(&self) -> impl Iterator<Item = &EventBinding> {
        self.links().filter_map(Unwind::target)
    }

    pub(crate) fn bind_target(&mut self, binding: &EventBinding) {
        if self.target.is_none() {
            self.target = Some(binding.clone());
        }
    }

    /// Chain `other` at the end of this unwind.
    pub(crate) fn add_next(&mut self, other: Unwind) {
        let mut cursor = &mut self.next;
        while let Some(link) = cursor {
            cursor = &mut link.next;
        }
        *cursor = Some(Box::new(other));
    }

    /// Payload of the first link addressed to `binding`.
    pub(crate) fn info_for(&self, binding: &EventBinding) -> Option<&Value> {
        self.links()
            .find(|link| link.target.as_ref() == Some(binding))
            .map(Unwind::info)
    }

    pub(crate) fn is_addressed_to(&self, binding: &EventBinding) -> bool {
        self.info_for(binding).is_some()
    }

    fn links(&self) -> impl Iterator<Item = &Unwind> {
        std::iter::successors(Some(self), |link| link.next.as_deref())
    }

    pub(crate) fn merge(slot: &mut Option<Unwind>, unwind: Unwind) {
        match slot {
            Some(first) => first.add_next(unwind),
            None => *slot = Some(unwind),
        }
    }
}

impl fmt::Display for Unwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unwind")?;
        for (i, target) in self.targets().enumerate() {
            let sep = if i == 0 { " to " } else { ", " };
            write!(f, "{sep}binding #{}", target.id())?;
        }
        Ok(())
    }
}

/// What a target binding's `on_unwind` asks for.
#[derive(Clone, Debug, PartialEq)]
pub enum UnwindAction {
    /// Execute the location again from its enter event.
    Reenter,
    /// Return this value from the location without further execution.
    Return(Value),
}

/// Answer of one chain, folded over its entries.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Resolution {
    /// No entry was addressed.
    Ignored,
    /// An addressed entry let the unwind continue.
    Continue,
    Reenter,
    Return(Value),
}

impl Resolution {
    /// Fold `later` into `self`.
    ///
    /// Continuing wins over everything, ignoring defers to the other answer,
    /// re-entering beats returning, and the earlier return value is kept.
    pub(crate) fn merge(self, later: Resolution) -> Resolution {
        match (self, later) {
            (Resolution::Continue, _) | (_, Resolution::Continue) => Resolution::Continue,
            (Resolution::Ignored, other) | (other, Resolution::Ignored) => other,
            (Resolution::Reenter, _) | (_, Resolution::Reenter) => Resolution::Reenter,
            (earlier @ Resolution::Return(_), Resolution::Return(_)) => earlier,
        }
    }

    pub(crate) fn from_action(action: Option<UnwindAction>) -> Resolution {
        match action {
            None => Resolution::Continue,
            Some(UnwindAction::Reenter) => Resolution::Reenter,
            Some(UnwindAction::Return(value)) => Resolution::Return(value),
        }
    }
}
