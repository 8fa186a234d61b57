//! Shell command execution
//!
//! Everything the manager does to the host (git, npm, pip, nginx, systemctl)
//! goes through [`CommandRunner`], so tests can substitute a scripted runner.

pub mod shell;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ManagerError;
use crate::utils::output_tail;

/// Lines of output kept on errors
pub const TAIL_LINES: usize = 20;

/// A command line to run through `sh -c`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Shell command line
    pub command: String,

    /// Working directory
    pub cwd: Option<PathBuf>,

    /// Extra environment variables
    pub env: Vec<(String, String)>,

    /// Kill the command after this long
    pub timeout: Option<Duration>,

    /// Run with elevated privileges
    pub elevated: bool,

    /// Treat a non-zero exit as an error
    pub check: bool,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
            elevated: false,
            check: true,
        }
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    /// Return the output even when the command exits non-zero
    pub fn unchecked(mut self) -> Self {
        self.check = false;
        self
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    pub fn tail(&self) -> String {
        output_tail(&self.combined(), TAIL_LINES)
    }
}

/// Runs shell commands on the host
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command and report how it exited.
    ///
    /// Fails only when the command cannot be spawned or times out.
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, ManagerError>;

    /// Run the command, turning a non-zero exit into an error when `spec.check` is set
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ManagerError> {
        let output = self.execute(spec).await?;
        if spec.check && !output.success() {
            return Err(ManagerError::CommandFailed {
                command: spec.command.clone(),
                exit_code: output.exit_code,
                output_tail: output.tail(),
            });
        }
        Ok(output)
    }
}
