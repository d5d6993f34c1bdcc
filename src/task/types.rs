//! Core task types, enums, and data structures.
//!
//! Defines the fundamental vocabulary used throughout the engine:
//! [`Affinity`] (which execution surface a task runs on), [`TaskState`]
//! (lifecycle), [`Predicate`] (continuation edge labels) and the
//! [`Progress`] record published by running tasks.

use serde::{Deserialize, Serialize};

/// Integer task identity, assigned by the manager when a task is scheduled.
pub type TaskId = u64;

/// The execution surface a task is routed to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affinity {
    /// Unbounded parallel pool. No ordering guarantees.
    Concurrent,
    /// Single-at-a-time serialized lane; excludes Concurrent while running.
    Exclusive,
    /// Parallel pool that never dispatches onto the UI thread. Recommended
    /// for process-backed tasks, whose bodies occupy a worker for the
    /// process lifetime.
    LongRunning,
    /// The host's single-threaded UI surface.
    Ui,
}

/// Task lifecycle states.
///
/// Transitions are monotone along `Created -> Started -> Running` followed by
/// exactly one of the three terminal states. Once terminal, the state never
/// changes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Started,
    Running,
    Succeeded,
    Faulted,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Faulted | TaskState::Canceled
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Created, TaskState::Started) => true,
            (TaskState::Started, TaskState::Running) => true,
            (TaskState::Running, s) if s.is_terminal() => true,
            // A task can be canceled before it ever reaches a scheduler
            // thread (dependency failure, shutdown, pre-start token).
            (TaskState::Created, TaskState::Canceled) => true,
            (TaskState::Started, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

/// Edge label deciding whether a continuation runs given the parent's
/// terminal state.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// Run regardless of the parent's outcome.
    Always,
    /// Run only when the parent succeeded.
    OnSuccess,
    /// Run when the parent faulted (unhandled) or was canceled, including
    /// cancellation caused by a dependency failure.
    OnFailure,
}

impl Predicate {
    /// Purely local match against the immediate parent's terminal state.
    /// A handled fault suppresses OnFailure edges.
    pub fn matches(&self, state: TaskState, fault_handled: bool) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::OnSuccess => state == TaskState::Succeeded,
            Predicate::OnFailure => match state {
                TaskState::Faulted => !fault_handled,
                TaskState::Canceled => true,
                _ => false,
            },
        }
    }
}

/// Per-task progress record, published on change.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    pub message: String,
}

impl Progress {
    pub fn new(current: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: message.into(),
        }
    }
}

/// Identifier returned from handler subscription, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        for terminal in [TaskState::Succeeded, TaskState::Faulted, TaskState::Canceled] {
            assert!(terminal.is_terminal());
            for next in [
                TaskState::Created,
                TaskState::Started,
                TaskState::Running,
                TaskState::Succeeded,
                TaskState::Faulted,
                TaskState::Canceled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn lifecycle_order() {
        assert!(TaskState::Created.can_transition_to(TaskState::Started));
        assert!(TaskState::Started.can_transition_to(TaskState::Running));
        assert!(TaskState::Running.can_transition_to(TaskState::Succeeded));
        assert!(!TaskState::Created.can_transition_to(TaskState::Running));
        assert!(!TaskState::Succeeded.can_transition_to(TaskState::Running));
    }

    #[test]
    fn predicate_matching_is_local() {
        assert!(Predicate::OnSuccess.matches(TaskState::Succeeded, false));
        assert!(!Predicate::OnSuccess.matches(TaskState::Faulted, false));
        assert!(Predicate::OnFailure.matches(TaskState::Faulted, false));
        assert!(Predicate::OnFailure.matches(TaskState::Canceled, false));
        assert!(!Predicate::OnFailure.matches(TaskState::Succeeded, false));
        // A handled fault no longer counts as a failure for edge matching.
        assert!(!Predicate::OnFailure.matches(TaskState::Faulted, true));
        assert!(Predicate::OnFailure.matches(TaskState::Canceled, true));
        for state in [TaskState::Succeeded, TaskState::Faulted, TaskState::Canceled] {
            assert!(Predicate::Always.matches(state, false));
        }
    }
}
