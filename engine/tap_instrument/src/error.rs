//! Error and control-transfer types.
//!
//! Three families:
//!
//! - configuration errors ([`AttachError`]), reported by the attach call
//!   that caused them
//! - tree consistency errors ([`TreeError`]), which mean a language broke
//!   the node model and are never swallowed
//! - execution-time throws ([`Throw`]), carried through observer hooks and
//!   the interpreter's `Result`s

use tap_ir::{SourceSection, Tags, Value};
use thiserror::Error;

use crate::unwind::Unwind;

/// An attach call that cannot be honored.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("filter references tags {undeclared} that language `{language}` does not provide")]
    UndeclaredTags { language: String, undeclared: Tags },

    #[error("{binding} bindings need a source-only filter, got {filter}")]
    NotSourceOnly { binding: &'static str, filter: String },

    #[error("instrumentation has been disposed")]
    Disposed,

    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// A violated node-model invariant.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("materialized node for {section} is already adopted")]
    AlreadyAdopted { section: String },

    #[error("materialized node covers {found}, the original covers {expected}")]
    SectionMismatch { expected: String, found: String },

    #[error("cannot wrap a node without a parent")]
    NoParent,

    #[error("cannot wrap a wrapper")]
    NestedWrapper,

    #[error("node not found among its parent's children")]
    ChildNotFound,
}

impl TreeError {
    pub(crate) fn describe(section: Option<&SourceSection>) -> String {
        section.map_or_else(|| "<no section>".to_string(), ToString::to_string)
    }
}

/// An exception raised by guest code, or created by an observer through
/// [`EventContext::create_error`](crate::EventContext::create_error).
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{message}")]
pub struct GuestException {
    message: String,
    value: Value,
    suppressed: Vec<ObserverError>,
}

impl GuestException {
    pub fn new(message: impl Into<String>) -> Self {
        GuestException {
            message: message.into(),
            value: Value::Null,
            suppressed: Vec::new(),
        }
    }

    /// Attach the guest value being thrown.
    #[must_use]
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Language-binding errors raised while this exception was reported.
    pub fn suppressed(&self) -> &[ObserverError] {
        &self.suppressed
    }
}

/// An error raised by an observer hook.
///
/// Errors from one dispatch round are aggregated: the first one is kept and
/// every later one is attached to it as suppressed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ObserverError {
    message: String,
    event: Option<&'static str>,
    binding: Option<u64>,
    suppressed: Vec<ObserverError>,
}

impl ObserverError {
    pub fn new(message: impl Into<String>) -> Self {
        ObserverError {
            message: message.into(),
            event: None,
            binding: None,
            suppressed: Vec::new(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The hook that raised the error, once it passed through a chain.
    pub fn event(&self) -> Option<&'static str> {
        self.event
    }

    /// Id of the binding whose observer raised the error.
    pub fn binding(&self) -> Option<u64> {
        self.binding
    }

    pub fn suppressed(&self) -> &[ObserverError] {
        &self.suppressed
    }

    pub(crate) fn attribute(mut self, event: &'static str, binding: u64) -> Self {
        self.event.get_or_insert(event);
        self.binding.get_or_insert(binding);
        self
    }

    /// Fold `error` into `slot`: first wins, the rest become suppressed.
    pub(crate) fn aggregate(slot: &mut Option<ObserverError>, error: ObserverError) {
        match slot {
            Some(first) => first.suppressed.push(error),
            None => *slot = Some(error),
        }
    }
}

/// Everything that can leave an observer hook or an instrumented execution
/// other than a normal return.
#[derive(Clone, Debug, Error)]
pub enum Throw {
    /// A guest-level exception. Passes through dispatch untouched.
    #[error(transparent)]
    Guest(#[from] GuestException),

    /// A control transfer requested by an observer.
    #[error("{0}")]
    Unwind(Unwind),

    /// A failing observer.
    #[error(transparent)]
    Observer(#[from] ObserverError),

    /// A broken tree found while rebuilding an event chain.
    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl Throw {
    pub fn as_guest(&self) -> Option<&GuestException> {
        match self {
            Throw::Guest(exception) => Some(exception),
            _ => None,
        }
    }

    pub fn as_unwind(&self) -> Option<&Unwind> {
        match self {
            Throw::Unwind(unwind) => Some(unwind),
            _ => None,
        }
    }

    /// Attach `error` as suppressed. Throws that cannot carry suppressed
    /// errors hand it back.
    pub(crate) fn add_suppressed(&mut self, error: ObserverError) -> Result<(), ObserverError> {
        match self {
            Throw::Guest(exception) => {
                exception.suppressed.push(error);
                Ok(())
            }
            Throw::Observer(observer) => {
                observer.suppressed.push(error);
                Ok(())
            }
            Throw::Unwind(_) | Throw::Tree(_) => Err(error),
        }
    }
}
