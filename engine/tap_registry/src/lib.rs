//! Concurrent registries.
//!
//! Two shapes, both iterable without blocking writers:
//!
//! - [`CowList`]: copy-on-write list for small, hot sets (active bindings).
//!   Every reader works on an immutable snapshot; writers copy.
//! - [`AsyncList`]: append-only slot array for large, rarely pruned sets
//!   (loaded trees). Entries are [`Slot`]s that may die; dead entries are
//!   skipped by iteration and dropped on compaction. Readers may observe
//!   entries appended after they started iterating.
//!
//! Neither registry offers an exact length. Consumers test identity-based
//! membership or iterate a fresh snapshot before acting.

mod async_list;
mod cow_list;

pub use async_list::{AsyncList, Iter, Slot, Strong, WeakAsyncList};
pub use cow_list::CowList;
