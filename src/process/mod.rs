//! External processes as first-class tasks.
//!
//! A process task wraps an OS process: spawn, line-streamed stdout/stderr,
//! a writable stdin, cooperative stop with a kill fallback, and detach
//! semantics that let the process outlive the engine.
//!
//! - [`ProcessSpec`]: what to run (program, argv, cwd, env overlay,
//!   redirection and window flags).
//! - [`environment::ProcessEnvironment`]: where to run it (working
//!   directory, environment overlay, executable resolution).
//! - [`output::OutputProcessor`]: how stdout becomes the task's result.
//! - [`task::ProcessTask`]: the task constructor and per-task process
//!   control surface.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod environment;
pub mod output;
pub mod task;

pub use environment::ProcessEnvironment;
pub use output::{LineListOutputProcessor, OutputProcessor, StringOutputProcessor};
pub use task::ProcessTask;

pub(crate) use task::{ProcessState, run_process};

/// Start specification for a wrapped process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Program name or path; resolved through the environment when bare.
    pub program: String,
    /// Command line arguments. An empty list spawns with argv[0] only.
    pub args: Vec<String>,
    /// Working directory override; falls back to the environment's.
    pub working_dir: Option<PathBuf>,
    /// Per-spec environment variables, applied over the environment's
    /// overlay.
    pub env: HashMap<String, String>,
    /// Capture stdout/stderr through the line readers (on by default).
    pub capture_output: bool,
    /// Open a writable stdin pipe (on by default).
    pub redirect_stdin: bool,
    /// Suppress the console window on Windows hosts.
    pub hide_window: bool,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            capture_output: true,
            redirect_stdin: true,
            hide_window: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn without_stdin(mut self) -> Self {
        self.redirect_stdin = false;
        self
    }
}
