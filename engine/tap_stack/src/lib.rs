//! Stack growth guard for recursive tree walks.
//!
//! Instrumentation walks recurse once per tree level, and guest trees produced
//! by real front ends can be arbitrarily deep (long statement chains, deeply
//! nested expressions). Every recursive step of the walk and of the test
//! interpreter goes through [`with_stack_headroom`].
//!
//! - **Native targets**: `stacker` allocates a fresh segment when less than
//!   [`HEADROOM`] bytes remain.
//! - **WASM targets**: plain call.

/// Bytes that must remain on the current segment before a recursive step runs.
pub const HEADROOM: usize = 128 * 1024;

/// Size of each additional segment.
pub const SEGMENT: usize = 2 * 1024 * 1024;

/// Run `step` with at least [`HEADROOM`] bytes of stack available.
#[inline]
#[cfg(not(target_arch = "wasm32"))]
pub fn with_stack_headroom<R>(step: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(HEADROOM, SEGMENT, step)
}

/// Run `step` directly.
#[inline]
#[cfg(target_arch = "wasm32")]
pub fn with_stack_headroom<R>(step: impl FnOnce() -> R) -> R {
    step()
}
