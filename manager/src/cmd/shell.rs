//! Command runner backed by `tokio::process`

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cmd::{CommandOutput, CommandRunner, CommandSpec};
use crate::errors::ManagerError;

const REAP_GRACE: Duration = Duration::from_secs(5);

/// Runs commands through `sh -c`
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    /// Prefix elevated commands with `sudo -n`
    pub use_sudo: bool,

    /// Log command output at info level instead of debug
    pub verbose: bool,
}

impl ShellRunner {
    pub fn new(use_sudo: bool, verbose: bool) -> Self {
        Self { use_sudo, verbose }
    }

    fn build(&self, spec: &CommandSpec) -> Command {
        let mut command = if spec.elevated && self.use_sudo {
            let mut c = Command::new("sudo");
            c.args(["-n", "sh", "-c", &spec.command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &spec.command]);
            c
        };

        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so a timeout can take down every worker the shell forked
        #[cfg(unix)]
        command.process_group(0);

        command
    }
}

/// SIGKILL the process group led by `pid`
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!("Could not kill process group {}: {}", pgid, std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, ManagerError> {
        debug!("Running command: {}", spec.command);

        let child = self.build(spec).spawn().map_err(|e| {
            ManagerError::Internal(format!("Failed to spawn `{}`: {}", spec.command, e))
        })?;

        let pid = child.id();
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut wait).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("Command timed out after {:?}: {}", limit, spec.command);
                    if let Some(pid) = pid {
                        kill_process_group(pid);
                    }
                    // Reap the shell; a worker that left the group could hold the pipes open
                    if tokio::time::timeout(REAP_GRACE, &mut wait).await.is_err() {
                        warn!("`{}` still holds its output pipes after kill", spec.command);
                    }
                    return Err(ManagerError::TimedOut(format!(
                        "`{}` did not finish within {:?}",
                        spec.command, limit
                    )));
                }
            },
            None => wait.await?,
        };

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if self.verbose {
            info!("`{}` exited with {}", spec.command, result.exit_code);
            for line in result.combined().lines() {
                info!("  {}", line);
            }
        } else {
            debug!("`{}` exited with {}", spec.command, result.exit_code);
        }

        Ok(result)
    }
}
