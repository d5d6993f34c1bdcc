//! # taskchain
//!
//! A task orchestration kernel for interactive editor environments: compose
//! asynchronous units of work (in-process actions, long-running compute and
//! external subprocesses) into chains with typed data flow, affinity-routed
//! execution, progress reporting, cooperative cancellation and structured
//! failure propagation.
//!
//! ## Architecture Overview
//!
//! The system consists of several key components organized into modules:
//!
//! - **[`task`]**: the task record, state machine, chain operator and
//!   [`TaskQueue`]
//! - **[`manager`]**: the [`TaskManager`] façade owning the schedulers, the
//!   cancellation root and the progress aggregator
//! - **[`scheduler`]**: the four execution surfaces behind task affinities
//! - **[`process`]**: OS processes wrapped as first-class tasks
//! - **[`progress`]**: cross-task progress aggregation with throttling
//!
//! ## The four affinities
//!
//! | Affinity | Surface |
//! |---|---|
//! | `Concurrent` | unbounded parallel pool (reader side of the pair) |
//! | `Exclusive` | serialized lane (writer side of the pair) |
//! | `LongRunning` | parallel pool that never runs on the UI thread |
//! | `Ui` | the host's single-threaded surface |
//!
//! At most one exclusive task runs at any moment and no concurrent task
//! overlaps it; exclusive tasks run in submission order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskchain::{Affinity, Task, TaskManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = TaskManager::new();
//!
//!     let build = Task::func("build", Affinity::LongRunning, |ctx| {
//!         ctx.report(0, 2, "compiling");
//!         // ... expensive work, polling ctx.token ...
//!         ctx.report(2, 2, "done");
//!         Ok("artifacts/".to_string())
//!     });
//!     let publish = Task::func_from_input("publish", Affinity::Concurrent,
//!         |_ctx, dir: String| Ok(format!("published {dir}")),
//!     );
//!     build.then(publish.clone());
//!
//!     manager.schedule(&build)?;
//!     publish.wait().await;
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Failure propagation
//!
//! A fault is captured in the faulting task; `OnFailure`/`Always`
//! continuations still run and can read the most-upstream exception via
//! [`Task::previous_fault`] until a fault handler reports it handled.
//! `OnSuccess` continuations of a failed parent are canceled as dependency
//! failures, recursively.

/// Error taxonomy shared by tasks and the manager.
pub mod error;

/// The task manager façade: scheduling, UI thread identity, shutdown.
pub mod manager;

/// Cross-task progress aggregation with per-task throttling.
pub mod progress;

/// External processes as first-class tasks.
pub mod process;

/// Execution surfaces behind the four task affinities.
pub mod scheduler;

/// Task model: record, state machine, chains, queue.
pub mod task;

pub use error::{Fault, TaskError};
pub use manager::TaskManager;
pub use process::{
    LineListOutputProcessor, OutputProcessor, ProcessEnvironment, ProcessSpec, ProcessTask,
    StringOutputProcessor,
};
pub use progress::ProgressEvent;
pub use scheduler::{ChannelDispatcher, UiDispatcher};
pub use task::{
    Affinity, HandlerId, Predicate, Progress, Task, TaskContext, TaskEnd, TaskId, TaskQueue,
    TaskState,
};
