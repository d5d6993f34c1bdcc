//! The task record and its execution machinery.
//!
//! A [`Task`] is a single concrete record: common lifecycle fields plus a
//! tagged body variant. There is no inheritance hierarchy: an action, a
//! value-producing function, a wrapped OS process and a task queue are all
//! the same record with a different [`TaskBody`]; process-ness is a
//! capability (an attached [`ProcessState`]), not a subclass.
//!
//! ## Lifecycle
//!
//! ```text
//! Created --schedule--> Started --dispatch--> Running --exit--> Succeeded
//!                                                            |-> Faulted
//!                                                            |-> Canceled
//! ```
//!
//! `OnStart` fires exactly once on the transition to `Running`, on the
//! scheduler thread that runs the body. `OnEnd` fires exactly once on the
//! terminal transition and carries the result, the success flag and the
//! fault (if any). Handler lists are cleared after the terminal events have
//! fired so that handler closures capturing the task itself cannot keep it
//! alive.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Fault, TaskError};
use crate::manager::ManagerCore;
use crate::process::ProcessState;
use crate::task::chain::{self, Continuation};
use crate::task::queue::QueueBody;
use crate::task::types::{Affinity, HandlerId, Progress, TaskId, TaskState};

/// Lock helper that recovers from poisoning instead of panicking; a poisoned
/// task lock means a body panicked, which the engine already maps to a fault.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a task body produced: an optional marshalled value or a fault.
pub(crate) type BodyResult = Result<Option<Value>, Fault>;

/// The tagged body of a task, taken exactly once when the task runs.
pub(crate) enum TaskBody {
    /// Runs for its side effects; produces no value.
    Action(Box<dyn FnOnce(&TaskContext) -> anyhow::Result<()> + Send>),
    /// Produces a value that is marshalled into the chain.
    Func(Box<dyn FnOnce(&TaskContext) -> anyhow::Result<Value> + Send>),
    /// Delegates to the process runtime attached to the task.
    Process,
    /// Drains a sequence of child tasks.
    Queue(QueueBody),
}

/// Execution context handed to task bodies.
///
/// Bodies are synchronous procedures from the engine's perspective; the
/// context is how they observe cancellation, read the value produced by
/// their parent, and publish progress.
pub struct TaskContext {
    pub(crate) task: Arc<Task>,
    /// Cancellation token scoped to this task. Bodies must poll it or pass
    /// it into blocking calls.
    pub token: CancellationToken,
    /// The parent's terminal success flag, or `true` for a chain head.
    pub success_from_parent: bool,
}

impl TaskContext {
    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// The raw value produced by the parent, if the parent succeeded.
    pub fn input(&self) -> Option<Value> {
        self.task.input()
    }

    /// The parent's value deserialized into `T`.
    pub fn input_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.input().and_then(|v| serde_json::from_value(v).ok())
    }

    /// Publish a progress update for this task.
    pub fn report(&self, current: u64, total: u64, message: impl Into<String>) {
        self.task.publish_progress(current, total, message.into());
    }
}

/// Payload delivered to `OnEnd` observers.
#[derive(Clone)]
pub struct TaskEnd {
    pub task: Arc<Task>,
    pub success: bool,
    pub result: Option<Value>,
    pub fault: Option<Fault>,
}

type StartObserver = Arc<dyn Fn(&Arc<Task>) + Send + Sync>;
type EndObserver = Arc<dyn Fn(&TaskEnd) + Send + Sync>;
type ProgressObserver = Arc<dyn Fn(&Progress) + Send + Sync>;
type FaultHandler = Arc<dyn Fn(&TaskError) -> bool + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    on_start: Vec<(u64, StartObserver)>,
    on_end: Vec<(u64, EndObserver)>,
    on_progress: Vec<(u64, ProgressObserver)>,
    catch: Vec<(u64, FaultHandler)>,
}

impl Handlers {
    fn subscribe<H>(list_next_id: &mut u64, list: &mut Vec<(u64, H)>, handler: H) -> HandlerId {
        let id = *list_next_id;
        *list_next_id += 1;
        list.push((id, handler));
        HandlerId(id)
    }
}

/// The central task entity. Constructed detached, composed into chains with
/// [`Task::then`], and executed by scheduling through a
/// [`TaskManager`](crate::manager::TaskManager).
pub struct Task {
    name: String,
    affinity: Affinity,
    id: AtomicU64,
    state: Mutex<TaskState>,
    body: Mutex<Option<TaskBody>>,
    input: Mutex<Option<Value>>,
    result: Mutex<Option<Value>>,
    fault: Mutex<Option<Fault>>,
    previous_fault: Mutex<Option<Fault>>,
    fault_handled: AtomicBool,
    dependency_failed: AtomicBool,
    progress: Mutex<Progress>,
    token: Mutex<Option<CancellationToken>>,
    pub(crate) continuations: Mutex<Vec<Continuation>>,
    pub(crate) parent: Mutex<Weak<Task>>,
    pub(crate) manager: Mutex<Weak<ManagerCore>>,
    handlers: Mutex<Handlers>,
    done: Notify,
    /// Process capability; `Some` only for process-backed tasks.
    pub(crate) process: Option<Arc<ProcessState>>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("id", &self.id.load(Ordering::Relaxed))
            .field("affinity", &self.affinity)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    pub(crate) fn new_raw(
        name: impl Into<String>,
        affinity: Affinity,
        body: TaskBody,
        process: Option<Arc<ProcessState>>,
    ) -> Arc<Task> {
        Arc::new(Task {
            name: name.into(),
            affinity,
            id: AtomicU64::new(0),
            state: Mutex::new(TaskState::Created),
            body: Mutex::new(Some(body)),
            input: Mutex::new(None),
            result: Mutex::new(None),
            fault: Mutex::new(None),
            previous_fault: Mutex::new(None),
            fault_handled: AtomicBool::new(false),
            dependency_failed: AtomicBool::new(false),
            progress: Mutex::new(Progress::default()),
            token: Mutex::new(None),
            continuations: Mutex::new(Vec::new()),
            parent: Mutex::new(Weak::new()),
            manager: Mutex::new(Weak::new()),
            handlers: Mutex::new(Handlers::default()),
            done: Notify::new(),
            process,
        })
    }

    /// Create an action task: runs for its side effects, produces no value.
    pub fn action(
        name: impl Into<String>,
        affinity: Affinity,
        body: impl FnOnce(&TaskContext) -> anyhow::Result<()> + Send + 'static,
    ) -> Arc<Task> {
        Task::new_raw(name, affinity, TaskBody::Action(Box::new(body)), None)
    }

    /// Create a value-producing task. The value is serialized so it can be
    /// handed to the next stage of a chain.
    pub fn func<T: Serialize>(
        name: impl Into<String>,
        affinity: Affinity,
        body: impl FnOnce(&TaskContext) -> anyhow::Result<T> + Send + 'static,
    ) -> Arc<Task> {
        let wrapped = move |ctx: &TaskContext| -> anyhow::Result<Value> {
            let value = body(ctx)?;
            Ok(serde_json::to_value(value)?)
        };
        Task::new_raw(name, affinity, TaskBody::Func(Box::new(wrapped)), None)
    }

    /// Create a task that consumes the parent's value and produces a new one.
    ///
    /// Faults with a body error when no input is available (the parent did
    /// not succeed or produced an incompatible value).
    pub fn func_from_input<T, U>(
        name: impl Into<String>,
        affinity: Affinity,
        body: impl FnOnce(&TaskContext, T) -> anyhow::Result<U> + Send + 'static,
    ) -> Arc<Task>
    where
        T: DeserializeOwned,
        U: Serialize,
    {
        let wrapped = move |ctx: &TaskContext| -> anyhow::Result<Value> {
            let input: T = ctx
                .input_as()
                .ok_or_else(|| anyhow::anyhow!("no input value available from parent"))?;
            let value = body(ctx, input)?;
            Ok(serde_json::to_value(value)?)
        };
        Task::new_raw(name, affinity, TaskBody::Func(Box::new(wrapped)), None)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Integer id, `0` until the task is scheduled.
    pub fn id(&self) -> TaskId {
        self.id.load(Ordering::Relaxed)
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    pub fn state(&self) -> TaskState {
        *lock(&self.state)
    }

    pub fn succeeded(&self) -> bool {
        self.state() == TaskState::Succeeded
    }

    /// The unhandled fault, populated only in the `Faulted` state.
    pub fn fault(&self) -> Option<Fault> {
        lock(&self.fault).clone()
    }

    /// The most-upstream exception carried into this task along
    /// Always/OnFailure edges, until some fault handler reports it handled.
    pub fn previous_fault(&self) -> Option<Fault> {
        lock(&self.previous_fault).clone()
    }

    /// Whether this task was canceled because its parent did not match the
    /// continuation predicate.
    pub fn dependency_failed(&self) -> bool {
        self.dependency_failed.load(Ordering::Relaxed)
    }

    pub(crate) fn fault_handled(&self) -> bool {
        self.fault_handled.load(Ordering::Relaxed)
    }

    /// The marshalled result, available once the task succeeded.
    pub fn result(&self) -> Option<Value> {
        lock(&self.result).clone()
    }

    /// The result deserialized into `T`.
    pub fn result_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.result().and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn progress(&self) -> Progress {
        lock(&self.progress).clone()
    }

    pub fn input(&self) -> Option<Value> {
        lock(&self.input).clone()
    }

    /// The cancellation token scoped to this task. Created on demand for a
    /// detached task; replaced by a child of the manager root at schedule.
    pub fn token(&self) -> CancellationToken {
        let mut slot = lock(&self.token);
        slot.get_or_insert_with(CancellationToken::new).clone()
    }

    /// Install a custom token before the task starts. Lets a caller scope a
    /// task more narrowly than the manager root.
    pub fn set_token(&self, token: CancellationToken) -> Result<(), TaskError> {
        if self.state() != TaskState::Created {
            return Err(TaskError::State(format!(
                "cannot replace token on task '{}' after start",
                self.name
            )));
        }
        *lock(&self.token) = Some(token);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to the transition into `Running`. Fires on the scheduler
    /// thread that runs the body.
    pub fn on_start(&self, handler: impl Fn(&Arc<Task>) + Send + Sync + 'static) -> HandlerId {
        let mut handlers = lock(&self.handlers);
        let Handlers { next_id, on_start, .. } = &mut *handlers;
        Handlers::subscribe(next_id, on_start, Arc::new(handler))
    }

    /// Subscribe to the terminal transition.
    pub fn on_end(&self, handler: impl Fn(&TaskEnd) + Send + Sync + 'static) -> HandlerId {
        let mut handlers = lock(&self.handlers);
        let Handlers { next_id, on_end, .. } = &mut *handlers;
        Handlers::subscribe(next_id, on_end, Arc::new(handler))
    }

    /// Subscribe to progress updates published by the body.
    pub fn on_progress(&self, handler: impl Fn(&Progress) + Send + Sync + 'static) -> HandlerId {
        let mut handlers = lock(&self.handlers);
        let Handlers { next_id, on_progress, .. } = &mut *handlers;
        Handlers::subscribe(next_id, on_progress, Arc::new(handler))
    }

    /// Add a fault handler. Handlers run in registration order until one
    /// returns `true`; a handled fault leaves the task `Faulted` but stops
    /// the exception from propagating further down the chain.
    ///
    /// Returns the task itself so calls compose left-to-right.
    pub fn catch(
        self: &Arc<Self>,
        handler: impl Fn(&TaskError) -> bool + Send + Sync + 'static,
    ) -> Arc<Task> {
        let mut handlers = lock(&self.handlers);
        let Handlers { next_id, catch, .. } = &mut *handlers;
        Handlers::subscribe(next_id, catch, Arc::new(handler));
        drop(handlers);
        self.clone()
    }

    /// Remove a previously subscribed handler. Returns `false` when the id
    /// is unknown (or the handler lists were already cleared at terminal).
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.on_start.len()
            + handlers.on_end.len()
            + handlers.on_progress.len()
            + handlers.catch.len();
        handlers.on_start.retain(|(hid, _)| *hid != id.0);
        handlers.on_end.retain(|(hid, _)| *hid != id.0);
        handlers.on_progress.retain(|(hid, _)| *hid != id.0);
        handlers.catch.retain(|(hid, _)| *hid != id.0);
        let after = handlers.on_start.len()
            + handlers.on_end.len()
            + handlers.on_progress.len()
            + handlers.catch.len();
        before != after
    }

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------

    /// Publish a progress update. `current` is clamped monotone
    /// non-decreasing until the record is reset when the task starts
    /// running.
    pub(crate) fn publish_progress(self: &Arc<Self>, current: u64, total: u64, message: String) {
        let snapshot = {
            let mut progress = lock(&self.progress);
            progress.current = progress.current.max(current);
            progress.total = total.max(progress.current);
            progress.message = message;
            progress.clone()
        };
        for (_, observer) in self.progress_observers() {
            fire_guarded(&self.name, "OnProgress", || observer(&snapshot));
        }
        if let Some(core) = lock(&self.manager).upgrade() {
            core.reporter().report(self, &snapshot, false);
        }
    }

    fn progress_observers(&self) -> Vec<(u64, ProgressObserver)> {
        lock(&self.handlers).on_progress.to_vec()
    }

    // ------------------------------------------------------------------
    // Scheduling hooks (manager-internal)
    // ------------------------------------------------------------------

    pub(crate) fn attach_manager(&self, core: &Arc<ManagerCore>) {
        *lock(&self.manager) = Arc::downgrade(core);
    }

    pub(crate) fn assign_id(&self, id: TaskId) {
        self.id.store(id, Ordering::Relaxed);
    }

    /// Derive this task's token from the manager root unless the caller
    /// installed a custom one.
    pub(crate) fn ensure_token(&self, root: &CancellationToken) {
        let mut slot = lock(&self.token);
        if slot.is_none() {
            *slot = Some(root.child_token());
        }
    }

    /// `Created -> Started`. Returns `false` when the task had already been
    /// started (idempotent: same handle, no second run).
    pub(crate) fn mark_started(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == TaskState::Created {
            *state = TaskState::Started;
            true
        } else {
            false
        }
    }

    /// `Started -> Running`, firing `OnStart`. Returns `false` when the task
    /// was already moved to a terminal state (e.g. canceled before dispatch).
    pub(crate) fn begin_running(self: &Arc<Self>) -> bool {
        {
            let mut state = lock(&self.state);
            if !state.can_transition_to(TaskState::Running) {
                return false;
            }
            *state = TaskState::Running;
        }
        *lock(&self.progress) = Progress::default();
        debug!(task = %self.name, id = self.id(), "task running");
        let observers = lock(&self.handlers).on_start.to_vec();
        for (_, observer) in observers {
            fire_guarded(&self.name, "OnStart", || observer(self));
        }
        true
    }

    pub(crate) fn take_body(&self) -> Option<TaskBody> {
        lock(&self.body).take()
    }

    pub(crate) fn set_input(&self, value: Value) {
        *lock(&self.input) = Some(value);
    }

    pub(crate) fn set_previous_fault(&self, fault: Fault) {
        let mut slot = lock(&self.previous_fault);
        if slot.is_none() {
            *slot = Some(fault);
        }
    }

    /// Offer the carried upstream exception to this task's fault handlers
    /// before the body runs. Once a handler reports it handled, forwarding
    /// stops.
    pub(crate) fn offer_previous_fault(&self) {
        let carried = lock(&self.previous_fault).clone();
        let Some(fault) = carried else { return };
        let handlers = lock(&self.handlers).catch.to_vec();
        for (_, handler) in handlers {
            if handler(&fault) {
                debug!(task = %self.name, "upstream fault handled, forwarding stops");
                *lock(&self.previous_fault) = None;
                return;
            }
        }
    }

    /// Move the task to its terminal state, fire `OnEnd`, clear handler
    /// lists and dispatch continuations.
    pub(crate) fn finish(self: &Arc<Self>, core: &Arc<ManagerCore>, outcome: BodyResult) {
        let (terminal, stored_fault, end_fault) = match outcome {
            Ok(value) => {
                if let Some(value) = value {
                    *lock(&self.result) = Some(value);
                }
                (TaskState::Succeeded, None, None)
            }
            Err(fault) if fault.is_cancellation() => (TaskState::Canceled, None, Some(fault)),
            Err(fault) => {
                let handlers = lock(&self.handlers).catch.to_vec();
                let handled = handlers.iter().any(|(_, handler)| handler(&fault));
                if handled {
                    self.fault_handled.store(true, Ordering::Relaxed);
                    (TaskState::Faulted, None, Some(fault))
                } else {
                    (TaskState::Faulted, Some(fault.clone()), Some(fault))
                }
            }
        };

        {
            let mut state = lock(&self.state);
            if state.is_terminal() {
                warn!(task = %self.name, "duplicate terminal transition ignored");
                return;
            }
            *state = terminal;
        }
        *lock(&self.fault) = stored_fault;

        let success = terminal == TaskState::Succeeded;
        debug!(task = %self.name, id = self.id(), state = ?terminal, "task finished");

        let end = TaskEnd {
            task: self.clone(),
            success,
            result: self.result(),
            fault: end_fault,
        };
        let observers = lock(&self.handlers).on_end.to_vec();
        for (_, observer) in observers {
            fire_guarded(&self.name, "OnEnd", || observer(&end));
        }

        // Break handler->task reference cycles now that both lifecycle
        // events have fired.
        *lock(&self.handlers) = Handlers::default();

        core.reporter().report(self, &self.progress(), true);

        if terminal == TaskState::Faulted
            && !self.fault_handled()
            && lock(&self.continuations).is_empty()
        {
            if let Some(fault) = self.fault() {
                error!(task = %self.name, id = self.id(), %fault, "unobserved task fault");
            }
        }

        self.done.notify_waiters();
        chain::dispatch_continuations(core, self);
    }

    /// Cancel a task whose parent did not match its predicate, then visit
    /// its own continuations under the same rule.
    pub(crate) fn cancel_dependency_failed(
        self: &Arc<Self>,
        core: &Arc<ManagerCore>,
        upstream: Option<Fault>,
        parent_name: &str,
    ) {
        self.dependency_failed.store(true, Ordering::Relaxed);
        if let Some(fault) = upstream {
            self.set_previous_fault(fault);
        }
        {
            let mut state = lock(&self.state);
            if state.is_terminal() {
                return;
            }
            *state = TaskState::Canceled;
        }
        debug!(task = %self.name, parent = %parent_name, "canceled: dependency failed");

        let fault: Fault = Arc::new(TaskError::DependencyFailed(parent_name.to_string()));
        let end = TaskEnd {
            task: self.clone(),
            success: false,
            result: None,
            fault: Some(fault),
        };
        let observers = lock(&self.handlers).on_end.to_vec();
        for (_, observer) in observers {
            fire_guarded(&self.name, "OnEnd", || observer(&end));
        }
        *lock(&self.handlers) = Handlers::default();
        self.done.notify_waiters();
        chain::dispatch_continuations(core, self);
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait(self: &Arc<Self>) {
        loop {
            let notified = self.done.notified();
            if self.state().is_terminal() {
                return;
            }
            notified.await;
        }
    }

    /// Whether the body must be driven on an async surface (process and
    /// queue bodies) rather than a blocking worker.
    pub(crate) fn has_async_body(&self) -> bool {
        self.process.is_some() || self.is_queue()
    }

    /// Queue drivers do no work of their own; the scheduler runs them
    /// outside the concurrent gate so a waiting exclusive task cannot wedge
    /// the queue against its own children.
    pub(crate) fn is_queue(&self) -> bool {
        matches!(lock(&self.body).as_ref(), Some(TaskBody::Queue(_)))
    }
}

/// Run a subscriber, logging instead of unwinding: handler failures must
/// never alter task state.
fn fire_guarded(task: &str, event: &str, f: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        warn!(task = %task, event = %event, "event handler panicked");
    }
}

/// Map an error raised by a task body onto the fault taxonomy. Bodies can
/// signal cooperative cancellation by returning a [`TaskError::Canceled`].
pub(crate) fn fault_from_anyhow(err: anyhow::Error) -> Fault {
    match err.downcast::<TaskError>() {
        Ok(task_err) => Arc::new(task_err),
        Err(other) => Arc::new(TaskError::from_body(other)),
    }
}

/// Drive a synchronous task body to completion on the current thread.
pub(crate) fn execute_sync(core: &Arc<ManagerCore>, task: &Arc<Task>, success_from_parent: bool) {
    task.offer_previous_fault();
    let token = task.token();
    if token.is_cancelled() {
        task.finish(core, Err(Arc::new(TaskError::Canceled)));
        return;
    }
    if !task.begin_running() {
        return;
    }
    let ctx = TaskContext {
        task: task.clone(),
        token,
        success_from_parent,
    };
    let outcome: BodyResult = match task.take_body() {
        Some(TaskBody::Action(body)) => body(&ctx).map(|_| None).map_err(fault_from_anyhow),
        Some(TaskBody::Func(body)) => body(&ctx).map(Some).map_err(fault_from_anyhow),
        Some(TaskBody::Process) | Some(TaskBody::Queue(_)) => Err(Arc::new(TaskError::State(
            format!("task '{}' requires an async execution surface", task.name()),
        ))),
        None => Ok(None),
    };
    task.finish(core, outcome);
}

/// Drive an async task body (process or queue) to completion.
pub(crate) async fn execute_async(
    core: &Arc<ManagerCore>,
    task: &Arc<Task>,
    success_from_parent: bool,
) {
    task.offer_previous_fault();
    let token = task.token();
    if token.is_cancelled() {
        task.finish(core, Err(Arc::new(TaskError::Canceled)));
        return;
    }
    if !task.begin_running() {
        return;
    }
    let ctx = TaskContext {
        task: task.clone(),
        token,
        success_from_parent,
    };
    let outcome: BodyResult = match task.take_body() {
        Some(TaskBody::Process) => crate::process::run_process(task, &ctx).await,
        Some(TaskBody::Queue(queue)) => queue.run(core, &ctx).await,
        Some(TaskBody::Action(body)) => body(&ctx).map(|_| None).map_err(fault_from_anyhow),
        Some(TaskBody::Func(body)) => body(&ctx).map(Some).map_err(fault_from_anyhow),
        None => Ok(None),
    };
    task.finish(core, outcome);
}
