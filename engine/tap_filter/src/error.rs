//! Filter construction errors.

use thiserror::Error;

/// A filter that cannot be built.
///
/// Raised by the builder call that received the bad argument and surfaced by
/// [`LocationFilterBuilder::build`](crate::LocationFilterBuilder::build).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("invalid range {start}:{end}, end must not precede start")]
    InvalidRange { start: usize, end: usize },

    #[error("{what} ranges start at 1, got {start}")]
    NotOneBased { what: &'static str, start: usize },

    #[error("`{expression}` needs at least one argument")]
    EmptyArguments { expression: &'static str },
}
