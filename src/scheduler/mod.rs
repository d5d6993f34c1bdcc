//! Execution surfaces behind the four task affinities.
//!
//! - [`pair`]: the concurrent/exclusive scheduler pair, a reader-writer
//!   gated pool where exclusive jobs are the writers.
//! - [`ui`]: the host-provided single-threaded UI surface, abstracted as a
//!   "post a runnable onto a known thread" capability.
//!
//! The long-running lane has no module of its own: it is the runtime's
//! blocking pool, used without the pair's gate. Blocking-pool workers are
//! never the UI thread, which is what the lane guarantees.

pub(crate) mod pair;
pub mod ui;

pub use ui::{ChannelDispatcher, Runnable, UiDispatcher};
