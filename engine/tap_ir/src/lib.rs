//! Shared vocabulary for the Tap instrumentation engine.
//!
//! Everything in this crate is a plain value type that the filter language,
//! the registries and the instrumentation core all agree on:
//!
//! - [`Tags`]: semantic classification of tree nodes
//! - [`Source`] / [`SourceSection`]: identity-compared sources and the ranges
//!   nodes are attributed to
//! - [`RootBits`]: the cached per-tree summary used to skip whole trees
//! - [`Value`]: guest values handed to observers

mod root_bits;
mod source;
mod tags;
mod value;

pub use root_bits::RootBits;
pub use source::{Source, SourceBuilder, SourceSection};
pub use tags::Tags;
pub use value::Value;
