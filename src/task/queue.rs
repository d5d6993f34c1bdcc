//! Serializing driver for a homogeneous sequence of child tasks.
//!
//! A [`TaskQueue`] builds a task whose body drains its children one at a
//! time, scheduling each on its own lane and awaiting its terminal state,
//! projecting every successful result into an aggregate list. Child faults
//! are skipped by default; with [`TaskQueue::fail_fast`] the first fault
//! aborts the remaining items and the queue faults with that child's
//! exception.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::manager::ManagerCore;
use crate::task::core::{BodyResult, Task, TaskBody, TaskContext};
use crate::task::types::{Affinity, TaskState};

type Projection = Box<dyn FnMut(Value) -> Value + Send>;

/// Builder for a queue task. `build()` yields an ordinary [`Task`] on the
/// Concurrent lane whose result is the aggregate `Value::Array`.
///
/// The driver holds no slot on the scheduler pair while it waits; children
/// keep their own affinities, Exclusive included.
pub struct TaskQueue {
    name: String,
    children: Vec<Arc<Task>>,
    fail_fast: bool,
    projection: Option<Projection>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            fail_fast: false,
            projection: None,
        }
    }

    /// Append a child task to the queue.
    pub fn push(mut self, child: Arc<Task>) -> Self {
        self.children.push(child);
        self
    }

    /// Abort on the first child fault instead of continuing.
    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    /// Install a per-item projection applied to each successful child
    /// result before it enters the aggregate.
    pub fn project(mut self, projection: impl FnMut(Value) -> Value + Send + 'static) -> Self {
        self.projection = Some(Box::new(projection));
        self
    }

    pub fn build(self) -> Arc<Task> {
        let body = QueueBody {
            children: self.children,
            fail_fast: self.fail_fast,
            projection: self.projection,
        };
        Task::new_raw(self.name, Affinity::Concurrent, TaskBody::Queue(body), None)
    }
}

pub(crate) struct QueueBody {
    children: Vec<Arc<Task>>,
    fail_fast: bool,
    projection: Option<Projection>,
}

impl QueueBody {
    pub(crate) async fn run(mut self, core: &Arc<ManagerCore>, ctx: &TaskContext) -> BodyResult {
        let mut aggregate = Vec::with_capacity(self.children.len());
        let total = self.children.len() as u64;

        for (index, child) in self.children.into_iter().enumerate() {
            if ctx.token.is_cancelled() {
                return Err(Arc::new(TaskError::Canceled));
            }
            ctx.report(index as u64, total, child.name().to_string());

            if let Err(err) = core.schedule_task(&child, true) {
                return Err(Arc::new(err));
            }
            child.wait().await;

            match child.state() {
                TaskState::Succeeded => {
                    let item = child.result().unwrap_or(Value::Null);
                    let item = match self.projection.as_mut() {
                        Some(project) => project(item),
                        None => item,
                    };
                    aggregate.push(item);
                }
                TaskState::Faulted => {
                    let fault = child
                        .fault()
                        .unwrap_or_else(|| Arc::new(TaskError::Body("queue item faulted".into())));
                    if self.fail_fast {
                        warn!(queue = %ctx.name(), item = %child.name(), "fail-fast abort");
                        return Err(fault);
                    }
                    debug!(queue = %ctx.name(), item = %child.name(), %fault, "queue item faulted, continuing");
                }
                TaskState::Canceled => {
                    debug!(queue = %ctx.name(), item = %child.name(), "queue item canceled, continuing");
                }
                other => {
                    warn!(queue = %ctx.name(), item = %child.name(), state = ?other, "queue item ended in non-terminal state");
                }
            }
        }

        ctx.report(total, total, "drained");
        Ok(Some(Value::Array(aggregate)))
    }
}
