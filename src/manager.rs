//! # Task manager façade
//!
//! The [`TaskManager`] owns everything tasks share: the scheduler pair, the
//! root cancellation token, the progress reporter and the recorded UI
//! thread identity. It is the only entry point for starting tasks.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       TaskManager                            │
//! │  ┌───────────────┐ ┌──────────────┐ ┌─────────────────────┐  │
//! │  │ SchedulerPair │ │ UiDispatcher │ │  ProgressReporter   │  │
//! │  │  exclusive ▲  │ │  (injected)  │ │  (throttling actor) │  │
//! │  │  concurrent│  │ │              │ │                     │  │
//! │  └───────────────┘ └──────────────┘ └─────────────────────┘  │
//! │        root CancellationToken · task id counter · drain      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Routing: `Concurrent` and `Exclusive` go through the pair's
//! reader-writer gate, `LongRunning` goes straight to the blocking pool
//! (never the UI thread), `Ui` is posted through the injected dispatcher.
//! Synchronous bodies run on blocking-pool workers; process and queue
//! bodies are driven on the lane's async context under the same gate.
//!
//! ## Shutdown
//!
//! [`TaskManager::stop`] refuses new submissions, completes the exclusive
//! lane, cancels the root token, then waits for in-flight tasks to drain,
//! bounded by a 500 ms deadline. Tasks that ignore their token may outlive
//! the manager.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::scheduler::pair::SchedulerPair;
use crate::scheduler::ui::UiDispatcher;
use crate::task::core::{self, Task, TaskContext, lock};
use crate::task::types::{Affinity, HandlerId};

/// How long `stop()` waits for in-flight work before returning anyway.
const STOP_DEADLINE: Duration = Duration::from_millis(500);

/// Central orchestrator. Cheap to clone handles out of (internally an
/// `Arc`); all methods are thread-safe.
pub struct TaskManager {
    core: Arc<ManagerCore>,
}

pub(crate) struct ManagerCore {
    runtime: Handle,
    pair: SchedulerPair,
    root: CancellationToken,
    reporter: ProgressReporter,
    ui: Mutex<Option<Arc<dyn UiDispatcher>>>,
    ui_thread: Mutex<Option<ThreadId>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl TaskManager {
    /// Create a manager on the current tokio runtime.
    ///
    /// Must be called from within a runtime; use
    /// [`TaskManager::with_handle`] otherwise.
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    pub fn with_handle(handle: Handle) -> Self {
        let core = ManagerCore {
            pair: SchedulerPair::new(&handle),
            reporter: ProgressReporter::new(&handle),
            runtime: handle,
            root: CancellationToken::new(),
            ui: Mutex::new(None),
            ui_thread: Mutex::new(None),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        };
        Self { core: Arc::new(core) }
    }

    /// Record the UI surface. Must be called exactly once before any task
    /// with `Affinity::Ui` is scheduled; a second call is a state error.
    pub fn initialize(&self, dispatcher: Arc<dyn UiDispatcher>) -> Result<(), TaskError> {
        let mut ui = lock(&self.core.ui);
        if ui.is_some() {
            return Err(TaskError::State(
                "task manager is already initialized".into(),
            ));
        }
        *lock(&self.core.ui_thread) = Some(dispatcher.thread_id());
        *ui = Some(dispatcher);
        info!("task manager initialized with UI surface");
        Ok(())
    }

    /// Whether the calling thread is the recorded UI thread.
    pub fn in_ui_thread(&self) -> bool {
        let recorded = *lock(&self.core.ui_thread);
        recorded == Some(std::thread::current().id())
    }

    /// The recorded UI thread identity, if initialized.
    pub fn ui_thread(&self) -> Option<ThreadId> {
        *lock(&self.core.ui_thread)
    }

    /// The root cancellation token. Every scheduled task derives a child of
    /// this token unless one was installed explicitly.
    pub fn token(&self) -> CancellationToken {
        self.core.root.clone()
    }

    /// Start a task (or the chain it belongs to: scheduling any node finds
    /// the chain head and starts that). Idempotent on already started
    /// tasks: the same handle comes back and nothing re-runs.
    pub fn schedule(&self, task: &Arc<Task>) -> Result<Arc<Task>, TaskError> {
        let head = task.head();
        self.core.schedule_task(&head, true)?;
        Ok(task.clone())
    }

    /// Shorthand: wrap an action in a Concurrent task named `message` and
    /// start it.
    pub fn run(
        &self,
        message: &str,
        body: impl FnOnce(&TaskContext) -> anyhow::Result<()> + Send + 'static,
    ) -> Result<Arc<Task>, TaskError> {
        self.schedule(&Task::action(message, Affinity::Concurrent, body))
    }

    /// Shorthand: run an action on the UI surface.
    pub fn run_in_ui(
        &self,
        message: &str,
        body: impl FnOnce(&TaskContext) -> anyhow::Result<()> + Send + 'static,
    ) -> Result<Arc<Task>, TaskError> {
        self.schedule(&Task::action(message, Affinity::Ui, body))
    }

    /// Subscribe to aggregated, throttled progress events.
    pub fn on_progress(
        &self,
        subscriber: impl Fn(&ProgressEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.core.reporter.subscribe(subscriber)
    }

    pub fn unsubscribe_progress(&self, id: HandlerId) -> bool {
        self.core.reporter.unsubscribe(id)
    }

    /// Stop the manager: refuse new submissions, cancel the root token and
    /// wait for workers to drain, bounded by 500 ms. Safe to call more than
    /// once.
    pub async fn stop(&self) {
        if self.core.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("task manager stopping");
        self.core.pair.complete();
        self.core.root.cancel();

        let drained = tokio::time::timeout(STOP_DEADLINE, async {
            self.core.pair.wait_completion().await;
            self.core.wait_drained().await;
        })
        .await;
        match drained {
            Ok(()) => debug!("task manager drained"),
            Err(_) => warn!(
                in_flight = self.core.in_flight.load(Ordering::SeqCst),
                "stop deadline reached with tasks still draining"
            ),
        }
    }
}

impl ManagerCore {
    pub(crate) fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    /// Start one task on its affinity lane. Returns the same handle when
    /// the task was already started.
    pub(crate) fn schedule_task(
        self: &Arc<Self>,
        task: &Arc<Task>,
        success_from_parent: bool,
    ) -> Result<Arc<Task>, TaskError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TaskError::Shutdown);
        }
        if !task.mark_started() {
            return Ok(task.clone());
        }
        task.attach_manager(self);
        task.assign_id(self.next_id.fetch_add(1, Ordering::Relaxed));
        task.ensure_token(&self.root);
        debug!(task = %task.name(), id = task.id(), affinity = ?task.affinity(), "task scheduled");

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let core = self.clone();
        let job = task.clone();
        match task.affinity() {
            Affinity::Concurrent => {
                if task.is_queue() {
                    // The driver waits on its children; holding a reader
                    // slot here would deadlock against a queued writer.
                    self.runtime.spawn(async move {
                        run_job(core, job, success_from_parent).await;
                    });
                } else {
                    self.pair.run_concurrent(
                        &self.runtime,
                        Box::pin(async move { run_job(core, job, success_from_parent).await }),
                    );
                }
            }
            Affinity::Exclusive => {
                let submitted = self.pair.submit_exclusive(Box::pin(async move {
                    run_job(core, job, success_from_parent).await;
                }));
                if let Err(err) = submitted {
                    self.release_slot();
                    // The lane was completed under us (stop() raced this
                    // schedule); fault the task so its chain observes the
                    // failure instead of hanging on a never-dispatched node.
                    task.finish(self, Err(Arc::new(TaskError::Shutdown)));
                    return Err(err);
                }
            }
            Affinity::LongRunning => {
                self.runtime.spawn(async move {
                    run_job(core, job, success_from_parent).await;
                });
            }
            Affinity::Ui => {
                let dispatcher = lock(&self.ui).clone();
                match dispatcher {
                    Some(dispatcher) => {
                        dispatcher.post(Box::new(move || {
                            run_job_on_ui(core, job, success_from_parent);
                        }));
                    }
                    None => {
                        self.release_slot();
                        // Fault the task so its chain observes the failure
                        // instead of hanging on a never-dispatched node.
                        let fault = Arc::new(TaskError::State(
                            "UI surface not initialized".into(),
                        ));
                        task.finish(self, Err(fault));
                        return Err(TaskError::State(
                            "UI surface not initialized; call initialize() first".into(),
                        ));
                    }
                }
            }
        }
        Ok(task.clone())
    }

    fn release_slot(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Drive one task on an async lane context. Synchronous bodies hop to the
/// blocking pool; process/queue bodies are driven inline so the lane's gate
/// guard spans the whole run.
async fn run_job(core: Arc<ManagerCore>, task: Arc<Task>, success_from_parent: bool) {
    if task.has_async_body() {
        core::execute_async(&core, &task, success_from_parent).await;
    } else {
        let blocking_core = core.clone();
        let blocking_task = task.clone();
        let joined = core
            .runtime
            .spawn_blocking(move || {
                core::execute_sync(&blocking_core, &blocking_task, success_from_parent)
            })
            .await;
        if joined.is_err() {
            // The body panicked out of the worker before reaching a
            // terminal state.
            warn!(task = %task.name(), "task body panicked");
            task.finish(&core, Err(Arc::new(TaskError::Body("task body panicked".into()))));
        }
    }
    core.release_slot();
}

/// Drive one task on the UI thread itself.
fn run_job_on_ui(core: Arc<ManagerCore>, task: Arc<Task>, success_from_parent: bool) {
    if task.has_async_body() {
        let handle = core.runtime.clone();
        handle.block_on(core::execute_async(&core, &task, success_from_parent));
    } else {
        core::execute_sync(&core, &task, success_from_parent);
    }
    core.release_slot();
}
