//! # Task model and chained execution
//!
//! The task graph engine: a single concrete [`Task`] record with a tagged
//! body, continuation edges with run predicates, typed result marshalling
//! between chain stages, and the lifecycle event surface.
//!
//! ## Core Components
//!
//! - **[`Task`]**: the central entity (state machine, handlers, chain edges)
//! - **[`TaskQueue`]**: serializing driver for a homogeneous sequence of
//!   child tasks with per-item result projection
//! - **[`types`]**: [`Affinity`], [`TaskState`], [`Predicate`], [`Progress`]
//!
//! ## Task Lifecycle
//!
//! ```text
//! Created -> Started -> Running -> [Succeeded | Faulted | Canceled]
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use taskchain::{Affinity, Predicate, Task, TaskManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = TaskManager::new();
//!
//!     let fetch = Task::func("fetch", Affinity::Concurrent, |_ctx| {
//!         Ok("payload".to_string())
//!     });
//!     let store = Task::func_from_input("store", Affinity::Exclusive,
//!         |_ctx, payload: String| Ok(payload.len()),
//!     );
//!     let cleanup = Task::action("cleanup", Affinity::Concurrent, |_ctx| Ok(()));
//!
//!     fetch.then(store.clone()).then_on(cleanup, Predicate::Always);
//!     manager.schedule(&fetch)?;
//!
//!     store.wait().await;
//!     println!("stored {:?} bytes", store.result_as::<usize>());
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod core;
pub mod queue;
pub mod types;


pub use core::{Task, TaskContext, TaskEnd};
pub use queue::TaskQueue;
pub use types::{Affinity, HandlerId, Predicate, Progress, TaskId, TaskState};
