//! The process task runtime.
//!
//! Wraps an OS process as an ordinary task: the task body spawns the child,
//! streams its output through the configured [`OutputProcessor`], and maps
//! the exit to the task's terminal state. Control operations (stdin
//! writes, [`Task::stop_process`], [`Task::detach`]) are methods on the
//! task itself, valid once the process has been spawned.
//!
//! Success rule: the task succeeds iff the body did not fault, was not
//! canceled, and the process exited 0, unless it was detached first, in
//! which case the task succeeds immediately and the process lives on.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::process::environment::ProcessEnvironment;
use crate::process::output::OutputProcessor;
use crate::process::ProcessSpec;
use crate::task::core::{BodyResult, Task, TaskBody, TaskContext, lock};
use crate::task::types::{Affinity, TaskState};

/// How long a stopped process gets to exit after stdin closes before it is
/// killed.
const STOP_GRACE: Duration = Duration::from_millis(300);

/// Constructors for process-backed tasks.
pub struct ProcessTask;

impl ProcessTask {
    /// Create a process task on the LongRunning lane (process bodies occupy
    /// their execution slot for the process lifetime).
    pub fn new(name: impl Into<String>, environment: ProcessEnvironment) -> Arc<Task> {
        Self::with_affinity(name, Affinity::LongRunning, environment)
    }

    pub fn with_affinity(
        name: impl Into<String>,
        affinity: Affinity,
        environment: ProcessEnvironment,
    ) -> Arc<Task> {
        Task::new_raw(
            name,
            affinity,
            TaskBody::Process,
            Some(Arc::new(ProcessState::new(environment))),
        )
    }
}

type PidObserver = Arc<dyn Fn(u32) + Send + Sync>;
type UnitObserver = Arc<dyn Fn() + Send + Sync>;
type LineObserver = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct ProcessObservers {
    on_start: Vec<PidObserver>,
    on_end: Vec<UnitObserver>,
    on_output: Vec<LineObserver>,
    on_error: Vec<LineObserver>,
}

/// Per-task process capability: configuration, live handles and observers.
pub(crate) struct ProcessState {
    environment: ProcessEnvironment,
    spec: Mutex<Option<ProcessSpec>>,
    processor: Mutex<Option<Box<dyn OutputProcessor>>>,
    processor_error: Mutex<Option<String>>,
    stdin_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pid: AtomicU32,
    exit_code: Mutex<Option<i32>>,
    errors: Mutex<Vec<String>>,
    detached: AtomicBool,
    stop_requested: AtomicBool,
    control: watch::Sender<()>,
    observers: Mutex<ProcessObservers>,
}

impl ProcessState {
    fn new(environment: ProcessEnvironment) -> Self {
        let (control, _) = watch::channel(());
        Self {
            environment,
            spec: Mutex::new(None),
            processor: Mutex::new(None),
            processor_error: Mutex::new(None),
            stdin_tx: Mutex::new(None),
            pid: AtomicU32::new(0),
            exit_code: Mutex::new(None),
            errors: Mutex::new(Vec::new()),
            detached: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            control,
            observers: Mutex::new(ProcessObservers::default()),
        }
    }

    fn fire_start(&self, pid: u32) {
        let observers = lock(&self.observers).on_start.to_vec();
        for observer in observers {
            observer(pid);
        }
    }

    fn fire_end(&self) {
        let observers = lock(&self.observers).on_end.to_vec();
        for observer in observers {
            observer();
        }
    }

    fn consume_stdout_line(&self, line: &str) {
        {
            let mut processor = lock(&self.processor);
            if let Some(processor) = processor.as_mut() {
                if let Err(err) = processor.line_received(line) {
                    let mut slot = lock(&self.processor_error);
                    if slot.is_none() {
                        *slot = Some(format!("{err:#}"));
                    }
                }
            }
        }
        let observers = lock(&self.observers).on_output.to_vec();
        for observer in observers {
            observer(line);
        }
    }

    fn consume_stderr_line(&self, line: &str) {
        lock(&self.errors).push(line.to_string());
        let observers = lock(&self.observers).on_error.to_vec();
        for observer in observers {
            observer(line);
        }
    }

    /// Result as of end-of-stream: the processor's value, or its documented
    /// empty-stream default.
    fn take_result(&self) -> Option<Value> {
        let mut processor = lock(&self.processor);
        processor.as_mut().map(|p| match p.result() {
            Some(value) => value,
            None => p.default_result(),
        })
    }
}

/// Process control surface on [`Task`]; every method is a state error on a
/// task constructed without a process capability.
impl Task {
    fn process_state(&self) -> Result<&Arc<ProcessState>, TaskError> {
        self.process.as_ref().ok_or_else(|| {
            TaskError::State(format!("task '{}' is not a process task", self.name()))
        })
    }

    /// Set the start specification and output processor. Must be called
    /// before the task starts.
    pub fn configure_process(
        &self,
        spec: ProcessSpec,
        processor: Option<Box<dyn OutputProcessor>>,
    ) -> Result<(), TaskError> {
        let state = self.process_state()?;
        if self.state() != TaskState::Created {
            return Err(TaskError::State(format!(
                "process task '{}' cannot be configured after start",
                self.name()
            )));
        }
        *lock(&state.spec) = Some(spec);
        *lock(&state.processor) = processor;
        Ok(())
    }

    /// OS process id, available after OnStartProcess.
    pub fn pid(&self) -> Option<u32> {
        let state = self.process.as_ref()?;
        match state.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Exit code, recorded when the process terminates under the engine.
    pub fn exit_code(&self) -> Option<i32> {
        let state = self.process.as_ref()?;
        *lock(&state.exit_code)
    }

    /// Collected stderr lines.
    pub fn process_errors(&self) -> Vec<String> {
        self.process
            .as_ref()
            .map(|state| lock(&state.errors).clone())
            .unwrap_or_default()
    }

    /// Write one line to the child's stdin. Valid from OnStartProcess
    /// through the terminal transition.
    pub fn write_stdin(&self, line: &str) -> Result<(), TaskError> {
        let state = self.process_state()?;
        let guard = lock(&state.stdin_tx);
        let tx = guard.as_ref().ok_or_else(|| {
            TaskError::State(format!(
                "stdin of process task '{}' is not writable",
                self.name()
            ))
        })?;
        tx.send(line.to_string()).map_err(|_| {
            TaskError::State(format!(
                "stdin of process task '{}' is already closed",
                self.name()
            ))
        })
    }

    /// Request termination: stdin closes, and after a short grace period
    /// the process is killed. The task ends Canceled (or Faulted if the
    /// body already faulted).
    pub fn stop_process(&self) -> Result<(), TaskError> {
        let state = self.process_state()?;
        state.stop_requested.store(true, Ordering::SeqCst);
        state.control.send_replace(());
        Ok(())
    }

    /// Succeed immediately while leaving the OS process running. The
    /// engine never kills a detached process, shutdown included.
    pub fn detach(&self) -> Result<(), TaskError> {
        let state = self.process_state()?;
        if self.state().is_terminal() {
            return Err(TaskError::State(format!(
                "process task '{}' already finished",
                self.name()
            )));
        }
        state.detached.store(true, Ordering::SeqCst);
        state.control.send_replace(());
        Ok(())
    }

    /// Observe the moment the OS reports a PID.
    pub fn on_start_process(&self, observer: impl Fn(u32) + Send + Sync + 'static) -> Result<(), TaskError> {
        let state = self.process_state()?;
        lock(&state.observers).on_start.push(Arc::new(observer));
        Ok(())
    }

    /// Observe process end: exit, kill or detach. Fires on every terminal
    /// path, faulted ones included.
    pub fn on_end_process(&self, observer: impl Fn() + Send + Sync + 'static) -> Result<(), TaskError> {
        let state = self.process_state()?;
        lock(&state.observers).on_end.push(Arc::new(observer));
        Ok(())
    }

    /// Observe stdout lines, in input order.
    pub fn on_output(&self, observer: impl Fn(&str) + Send + Sync + 'static) -> Result<(), TaskError> {
        let state = self.process_state()?;
        lock(&state.observers).on_output.push(Arc::new(observer));
        Ok(())
    }

    /// Observe stderr lines.
    pub fn on_error_data(&self, observer: impl Fn(&str) + Send + Sync + 'static) -> Result<(), TaskError> {
        let state = self.process_state()?;
        lock(&state.observers).on_error.push(Arc::new(observer));
        Ok(())
    }
}

/// The process task body: spawn, stream, and wait.
pub(crate) async fn run_process(task: &Arc<Task>, ctx: &TaskContext) -> BodyResult {
    let Some(state) = task.process.clone() else {
        return Err(Arc::new(TaskError::State(format!(
            "task '{}' has no process capability",
            task.name()
        ))));
    };
    let Some(spec) = lock(&state.spec).clone() else {
        return Err(Arc::new(TaskError::State(format!(
            "process task '{}' was not configured",
            task.name()
        ))));
    };

    let program = state.environment.resolve_executable(&spec.program);
    let mut command = Command::new(&program);
    command.args(&spec.args);
    command.current_dir(
        spec.working_dir
            .clone()
            .unwrap_or_else(|| state.environment.working_directory.clone()),
    );
    for (key, value) in &state.environment.environment {
        command.env(key, value);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    if spec.capture_output {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    }
    command.stdin(if spec.redirect_stdin {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    // Detached processes must survive the engine; termination is always
    // explicit.
    command.kill_on_drop(false);
    #[cfg(windows)]
    if spec.hide_window {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            return Err(Arc::new(TaskError::Spawn {
                program: spec.program.clone(),
                source,
            }));
        }
    };

    let pid = child.id().unwrap_or(0);
    state.pid.store(pid, Ordering::Relaxed);
    debug!(task = %task.name(), pid, program = %program.display(), "process spawned");
    state.fire_start(pid);

    if let Some(stdin) = child.stdin.take() {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&state.stdin_tx) = Some(tx);
        tokio::spawn(stdin_writer(stdin, rx));
    }
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_stdout(stdout, state.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_stderr(stderr, state.clone())));
    }

    let mut control = state.control.subscribe();
    let status = loop {
        if state.detached.load(Ordering::SeqCst) {
            return detach_process(task, &state, child, readers);
        }
        if state.stop_requested.load(Ordering::SeqCst) {
            terminate(&state, &mut child).await;
            join_readers(&mut readers).await;
            state.fire_end();
            return Err(Arc::new(TaskError::Canceled));
        }
        tokio::select! {
            status = child.wait() => break status,
            _ = ctx.token.cancelled() => {
                // Reads interrupted by cancellation are recovered, not
                // surfaced: the terminal state is Canceled.
                terminate(&state, &mut child).await;
                join_readers(&mut readers).await;
                state.fire_end();
                return Err(Arc::new(TaskError::Canceled));
            }
            _ = control.changed() => continue,
        }
    };

    // End-of-stream before the result is read: both readers run to EOF.
    join_readers(&mut readers).await;
    lock(&state.stdin_tx).take();

    let status = match status {
        Ok(status) => status,
        Err(err) => {
            state.fire_end();
            return Err(Arc::new(TaskError::Body(format!(
                "waiting for process failed: {err}"
            ))));
        }
    };
    let code = status.code().unwrap_or(-1);
    *lock(&state.exit_code) = Some(code);
    debug!(task = %task.name(), pid, code, "process exited");
    state.fire_end();

    if let Some(message) = lock(&state.processor_error).clone() {
        // A processor failure wraps the underlying process failure rather
        // than hiding it.
        let detail = if code != 0 {
            format!("{message}; process exited with code {code}")
        } else {
            message
        };
        return Err(Arc::new(TaskError::Body(format!(
            "output processor failed: {detail}"
        ))));
    }
    if code == 0 || state.detached.load(Ordering::SeqCst) {
        Ok(state.take_result())
    } else {
        Err(Arc::new(TaskError::ProcessExit {
            exit_code: code,
            errors: lock(&state.errors).join("\n"),
        }))
    }
}

/// Detach path: the task succeeds now; a background waiter keeps the pipes
/// alive and reaps the child whenever it exits.
fn detach_process(
    task: &Arc<Task>,
    state: &Arc<ProcessState>,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
) -> BodyResult {
    debug!(task = %task.name(), pid = state.pid.load(Ordering::Relaxed), "process detached");
    let reaper_state = state.clone();
    tokio::spawn(async move {
        if let Ok(status) = child.wait().await {
            *lock(&reaper_state.exit_code) = status.code();
        }
        for reader in readers {
            let _ = reader.await;
        }
    });
    state.fire_end();
    Ok(state.take_result())
}

/// Cooperative termination: close stdin first, kill after the grace period.
async fn terminate(state: &ProcessState, child: &mut Child) {
    lock(&state.stdin_tx).take();
    if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
        warn!(pid = state.pid.load(Ordering::Relaxed), "process ignored stop, killing");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

async fn join_readers(readers: &mut Vec<JoinHandle<()>>) {
    let _ = futures::future::join_all(readers.drain(..)).await;
}

async fn stdin_writer(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.recv().await {
        if stdin.write_all(text.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }
    // Dropping stdin here delivers EOF to the child.
}

async fn read_stdout(stdout: ChildStdout, state: Arc<ProcessState>) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        state.consume_stdout_line(&line);
    }
}

async fn read_stderr(stderr: ChildStderr, state: Arc<ProcessState>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        state.consume_stderr_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::output::StringOutputProcessor;

    #[test]
    fn non_process_tasks_reject_process_operations() {
        let task = Task::action("plain", Affinity::Concurrent, |_| Ok(()));
        assert!(matches!(task.detach(), Err(TaskError::State(_))));
        assert!(matches!(task.write_stdin("x"), Err(TaskError::State(_))));
        assert!(matches!(
            task.configure_process(ProcessSpec::new("echo"), None),
            Err(TaskError::State(_))
        ));
        assert!(task.pid().is_none());
        assert!(task.exit_code().is_none());
    }

    #[test]
    fn stdin_is_not_writable_before_spawn() {
        let task = ProcessTask::new("cat", ProcessEnvironment::default());
        task.configure_process(ProcessSpec::new("cat"), None).unwrap();
        assert!(matches!(task.write_stdin("hello"), Err(TaskError::State(_))));
    }

    #[tokio::test]
    async fn configuration_is_rejected_after_start() {
        let task = ProcessTask::new("late-config", ProcessEnvironment::default());
        task.configure_process(
            ProcessSpec::new("echo").arg("hi"),
            Some(Box::new(StringOutputProcessor::new())),
        )
        .unwrap();

        let manager = crate::manager::TaskManager::new();
        manager.schedule(&task).unwrap();
        let result = task.configure_process(ProcessSpec::new("echo"), None);
        assert!(matches!(result, Err(TaskError::State(_))));
        task.wait().await;
        manager.stop().await;
    }
}
