//! Error taxonomy for the task engine.
//!
//! Every failure a task can surface is one of the variants below. Faults are
//! shared between chain stages as `Arc<TaskError>` so the most-upstream
//! exception can be forwarded along continuation edges without cloning the
//! underlying cause.

use std::sync::Arc;

/// Shared fault handle stored in task fault slots and forwarded along chains.
pub type Fault = Arc<TaskError>;

/// Errors produced by tasks and the task manager.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Cooperative cancellation was observed.
    #[error("task was canceled")]
    Canceled,

    /// The parent's terminal state did not match this task's predicate;
    /// the task never ran.
    #[error("dependency failed: {0}")]
    DependencyFailed(String),

    /// User code inside a task body raised an error.
    #[error("task body failed: {0}")]
    Body(String),

    /// The OS refused to start the program.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited with a non-zero code. Carries the collected
    /// stderr buffer.
    #[error("process exited with code {exit_code}: {errors}")]
    ProcessExit { exit_code: i32, errors: String },

    /// Illegal API sequence (double-configure, configure-after-start,
    /// initialize twice, ...).
    #[error("invalid task state: {0}")]
    State(String),

    /// Operation attempted on a stopped manager.
    #[error("task manager is shut down")]
    Shutdown,
}

impl TaskError {
    /// Wrap an arbitrary body error, preserving its message chain.
    pub fn from_body(err: anyhow::Error) -> Self {
        TaskError::Body(format!("{err:#}"))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_errors_keep_the_cause_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = anyhow::Error::from(io).context("reading manifest");
        let task_err = TaskError::from_body(err);
        let text = task_err.to_string();
        assert!(text.contains("reading manifest"));
        assert!(text.contains("missing"));
    }

    #[test]
    fn cancellation_classification() {
        assert!(TaskError::Canceled.is_cancellation());
        // Dependency failures never travel through a fault slot; they are
        // applied as a direct Canceled transition on the child.
        assert!(!TaskError::DependencyFailed("parent".into()).is_cancellation());
        assert!(!TaskError::Body("boom".into()).is_cancellation());
    }
}
