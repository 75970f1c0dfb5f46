//! Instrumentation core for tree-walking interpreters.
//!
//! An [`Instrumentation`] coordinator is created once per engine. Languages
//! report tree lifecycle events into it (`on_tree_loaded`,
//! `on_tree_first_executed`, `on_subtree_replaced`); observers attach
//! bindings through an [`Instrumenter`]. Whenever either side changes, the
//! coordinator batches the relevant visit operations into a single tree walk
//! that inserts or invalidates [`ProbeNode`] wrappers, materializes alternate
//! node shapes, and queues load notifications.
//!
//! At run time the interpreter hands control to [`ProbeNode::execute`] when
//! it reaches a wrapper. The probe lazily rebuilds its event chain (one entry
//! per matching binding, in attachment order) and dispatches enter, input,
//! return and unwind events.
//!
//! # Layout
//!
//! - [`tree`]: the node model languages build their trees from
//! - [`frame`]: per-execution storage
//! - [`binding`]: event bindings and their kinds
//! - [`probe`]: probes, event chains and the unwind protocol
//! - `visit`: the batched tree walk
//! - [`coordinator`]: the [`Instrumentation`] coordinator and instrumenters
//! - [`broadcast`]: allocation, output and context/thread fan-out

pub mod binding;
pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod frame;
pub mod listener;
pub mod probe;
pub mod tree;
mod unwind;
mod visit;

#[cfg(test)]
mod test_tree;

pub use binding::{BindingKind, EventBinding, ExecutionElement};
pub use broadcast::{
    ActiveListener, AllocationEvent, AllocationFilter, AllocationListener, AllocationReporter,
    BufferOutputListener, ContextId, ContextsListener, OutputListener, OutputStream,
    ThreadsListener,
};
pub use config::{InstrumentationConfig, InstrumentationConfigBuilder};
pub use coordinator::{Instrumentation, Instrumenter};
pub use error::{AttachError, GuestException, ObserverError, Throw, TreeError};
pub use frame::{Frame, FrameDescriptor, SlotKey};
pub use listener::{
    ExecuteSourceListener, ExecutionEventListener, ExecutionEventNodeFactory,
    LoadSourceListener, LoadSourceSectionEvent, LoadSourceSectionListener,
};
pub use probe::{EventContext, InputHandle, ProbeNode};
pub use tree::{LanguageInfo, Node, NodeKind, NodeRef, RootNode, SyntaxNode};
pub use unwind::{Unwind, UnwindAction};

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for debug output.
///
/// Safe to call multiple times. Does nothing unless `RUST_LOG` is set, e.g.
/// `RUST_LOG=tap_instrument=debug`. Setting `TAP_LOG_TREE` switches the flat
/// formatter for an indented span tree.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        if std::env::var("RUST_LOG").is_err() {
            return;
        }
        let filter = EnvFilter::from_default_env();
        let installed = if std::env::var_os("TAP_LOG_TREE").is_some() {
            tracing_subscriber::registry()
                .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true))
                .with(filter)
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(filter)
                .try_init()
        };
        // another subscriber was installed first; keep it
        let _ = installed;
    });
}
