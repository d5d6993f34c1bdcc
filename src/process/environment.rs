//! Host environment for spawned processes.
//!
//! The engine treats the host's notion of "where programs live" as opaque
//! strings: a working directory, an environment-variable overlay applied to
//! every spawned child, and an optional application-contents directory for
//! locating bundled interpreters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

#[derive(Clone, Debug)]
pub struct ProcessEnvironment {
    /// Default working directory for spawned processes.
    pub working_directory: PathBuf,
    /// Environment variables applied to every spawned child.
    pub environment: HashMap<String, String>,
    /// Directory holding bundled tools shipped with the host application.
    pub application_contents: Option<PathBuf>,
}

impl Default for ProcessEnvironment {
    fn default() -> Self {
        Self {
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            environment: HashMap::new(),
            application_contents: None,
        }
    }
}

impl ProcessEnvironment {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_application_contents(mut self, dir: impl Into<PathBuf>) -> Self {
        self.application_contents = Some(dir.into());
        self
    }

    pub fn is_windows(&self) -> bool {
        cfg!(target_os = "windows")
    }

    /// Extension appended to bare executable names on this platform.
    pub fn executable_extension(&self) -> &'static str {
        if self.is_windows() { ".exe" } else { "" }
    }

    /// Locate an executable on the PATH.
    pub fn find_executable(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    /// Locate a tool bundled under the application contents directory.
    pub fn bundled_executable(&self, name: &str) -> Option<PathBuf> {
        let contents = self.application_contents.as_ref()?;
        let candidate = contents.join(format!("{}{}", name, self.executable_extension()));
        candidate.is_file().then_some(candidate)
    }

    /// Resolve a program reference for spawning: explicit paths pass
    /// through, bare names are looked up bundled-first, then on the PATH,
    /// and fall back to the raw name (the OS gets the final say).
    pub fn resolve_executable(&self, program: &str) -> PathBuf {
        let raw = Path::new(program);
        if raw.components().count() > 1 || raw.is_absolute() {
            return raw.to_path_buf();
        }
        if let Some(bundled) = self.bundled_executable(program) {
            debug!(program, path = %bundled.display(), "resolved bundled executable");
            return bundled;
        }
        if let Some(found) = self.find_executable(program) {
            return found;
        }
        raw.to_path_buf()
    }
}
