//! Chain composition: parent -> child edges with run predicates.
//!
//! [`Task::then`] attaches a continuation and returns the child so calls
//! compose left-to-right (`head.then(a).then(b)` yields `b`). When a parent
//! reaches a terminal state the engine walks its edges in attachment order:
//! matching children inherit the parent's value and the most-upstream fault,
//! then get scheduled; non-matching children are canceled as dependency
//! failures and their own continuations are visited under the same rule.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Fault;
use crate::manager::ManagerCore;
use crate::task::core::{Task, lock};
use crate::task::types::{Predicate, TaskState};

/// A parent -> child edge. The parent holds the strong reference; the child
/// points back through a weak handle only.
pub(crate) struct Continuation {
    pub child: Arc<Task>,
    pub predicate: Predicate,
}

impl Task {
    /// Attach `child` to run when this task succeeds. Returns the child.
    pub fn then(self: &Arc<Self>, child: Arc<Task>) -> Arc<Task> {
        self.then_on(child, Predicate::OnSuccess)
    }

    /// Attach `child` with an explicit predicate. Returns the child.
    pub fn then_on(self: &Arc<Self>, child: Arc<Task>, predicate: Predicate) -> Arc<Task> {
        {
            let mut parent_slot = lock(&child.parent);
            if parent_slot.upgrade().is_some() {
                warn!(
                    child = %child.name(),
                    parent = %self.name(),
                    "continuation already has a parent; re-attaching"
                );
            }
            *parent_slot = Arc::downgrade(self);
        }
        lock(&self.continuations).push(Continuation {
            child: child.clone(),
            predicate,
        });
        debug!(parent = %self.name(), child = %child.name(), ?predicate, "continuation attached");

        // Attaching to an already finished task dispatches the new edge
        // immediately, so late composition does not strand the child.
        if self.state().is_terminal() {
            if let Some(core) = lock(&self.manager).upgrade() {
                dispatch_continuations(&core, self);
            }
        }
        child
    }

    /// Attach `child` to run regardless of this task's outcome.
    pub fn finally(self: &Arc<Self>, child: Arc<Task>) -> Arc<Task> {
        self.then_on(child, Predicate::Always)
    }

    /// Walk weak parent links to the chain head (the unique ancestor with no
    /// parent).
    pub fn head(self: &Arc<Self>) -> Arc<Task> {
        let mut current = self.clone();
        while let Some(parent) = {
            let weak = lock(&current.parent);
            weak.upgrade()
        } {
            current = parent;
        }
        current
    }
}

/// Walk a terminal task's edges in order, scheduling matches and cascading
/// dependency cancellation through mismatches.
pub(crate) fn dispatch_continuations(core: &Arc<ManagerCore>, parent: &Arc<Task>) {
    let state = parent.state();
    if !state.is_terminal() {
        return;
    }
    // Edges are drained so re-entrant dispatch (late `then` on a finished
    // task) never delivers the same edge twice.
    let edges: Vec<Continuation> = lock(&parent.continuations).drain(..).collect();
    if edges.is_empty() {
        return;
    }

    let success = state == TaskState::Succeeded;
    let fault_handled = parent.fault_handled();
    // The most-upstream exception wins: forward what was carried into the
    // parent if present, otherwise the parent's own fault.
    let upstream: Option<Fault> = parent.previous_fault().or_else(|| parent.fault());
    let parent_result = parent.result();

    for Continuation { child, predicate } in edges {
        if predicate.matches(state, fault_handled) {
            if success {
                if let Some(result) = parent_result.clone() {
                    child.set_input(result);
                }
            }
            // Fault context travels only along Always/OnFailure edges.
            if !matches!(predicate, Predicate::OnSuccess) {
                if let Some(fault) = upstream.clone() {
                    child.set_previous_fault(fault);
                }
            }
            if let Err(err) = core.schedule_task(&child, success) {
                warn!(child = %child.name(), %err, "continuation could not be scheduled");
                child.cancel_dependency_failed(core, upstream.clone(), parent.name());
            }
        } else {
            child.cancel_dependency_failed(core, upstream.clone(), parent.name());
        }
    }
}
