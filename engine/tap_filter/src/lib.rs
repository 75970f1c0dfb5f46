//! Location filters.
//!
//! A [`LocationFilter`] is an immutable conjunction of expressions; each
//! expression is a disjunction over its arguments ("tag is CALL or
//! STATEMENT"). Filters are evaluated at two granularities:
//!
//! - per node, through [`LocationFilter::is_node_included`], against a
//!   [`Location`] (tags and source section)
//! - per tree, through [`LocationFilter::is_root_included`], against a
//!   [`RootSummary`], which lets a walk skip a whole tree when no node in it
//!   could possibly match
//!
//! Expressions carry a fixed order so built filters evaluate cheap,
//! source-identity checks first.

mod error;
mod expr;
mod filter;
mod range;

pub use error::FilterError;
pub use filter::{LocationFilter, LocationFilterBuilder, NamePredicate, SourcePredicate};
pub use range::IndexRange;

use tap_ir::{RootBits, SourceSection, Tags};

/// A node as seen by a filter.
#[derive(Clone, Copy, Debug)]
pub struct Location<'a> {
    pub tags: Tags,
    pub section: Option<&'a SourceSection>,
}

/// A tree root as seen by a filter's pre-check.
#[derive(Clone, Copy, Debug)]
pub struct RootSummary<'a> {
    pub bits: RootBits,
    pub section: Option<&'a SourceSection>,
    pub name: &'a str,
    pub internal: bool,
    /// Tags the root's language declares.
    pub provided_tags: Tags,
}
