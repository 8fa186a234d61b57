//! systemd units for application processes

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cmd::{CommandOutput, CommandRunner, CommandSpec};
use crate::errors::ManagerError;
use crate::models::app::RunState;
use crate::storage::layout::SystemPaths;
use crate::utils::shell_quote;

/// Manages one `<domain>.service` unit per application
#[derive(Clone)]
pub struct SystemdService {
    paths: SystemPaths,
    runner: Arc<dyn CommandRunner>,
    user: String,
}

impl SystemdService {
    pub fn new(paths: SystemPaths, runner: Arc<dyn CommandRunner>, user: impl Into<String>) -> Self {
        Self {
            paths,
            runner,
            user: user.into(),
        }
    }

    pub fn unit_name(domain: &str) -> String {
        format!("{}.service", domain)
    }

    /// Unit file contents
    pub fn render_unit(&self, domain: &str, start_command: &str, working_dir: &Path) -> String {
        let working_dir = working_dir.display().to_string();
        format!(
            r#"[Unit]
Description=Web application {domain}
After=network.target
Wants=network-online.target

[Service]
Type=simple
User={user}
Group={user}
WorkingDirectory={dir}
EnvironmentFile={env}
ExecStart=/bin/sh -c "{command}"
Restart=always
RestartSec=10
KillMode=mixed
TimeoutStopSec=30
StandardOutput=journal
StandardError=journal
SyslogIdentifier={domain}
NoNewPrivileges=true
PrivateTmp=true

[Install]
WantedBy=multi-user.target
"#,
            domain = domain,
            user = self.user,
            dir = working_dir,
            env = self.paths.env_file(domain).path().display(),
            command = escape_exec(&format!("cd {} && exec {}", shell_quote(&working_dir), start_command)),
        )
    }

    /// Write the unit and its environment file, then reload the daemon
    pub async fn create(
        &self,
        domain: &str,
        start_command: &str,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), ManagerError> {
        let env_file = self.paths.env_file(domain);
        env_file.write_atomic(render_env(env).as_bytes()).await?;
        env_file.set_permissions_600().await?;

        self.paths
            .unit_file(domain)
            .write_atomic(self.render_unit(domain, start_command, working_dir).as_bytes())
            .await?;

        self.daemon_reload().await?;
        info!("Unit {} written", Self::unit_name(domain));
        Ok(())
    }

    pub async fn enable(&self, domain: &str) -> Result<(), ManagerError> {
        self.systemctl("enable", domain).await.map(|_| ())
    }

    pub async fn start(&self, domain: &str) -> Result<(), ManagerError> {
        self.systemctl("start", domain).await.map(|_| ())
    }

    pub async fn stop(&self, domain: &str) -> Result<(), ManagerError> {
        self.systemctl("stop", domain).await.map(|_| ())
    }

    /// Restart the unit, or start it when it is not running
    pub async fn restart(&self, domain: &str) -> Result<(), ManagerError> {
        if self.status(domain).await? == RunState::Active {
            self.systemctl("restart", domain).await.map(|_| ())
        } else {
            self.start(domain).await
        }
    }

    /// Current run state; `Unknown` for a unit that was never created
    pub async fn status(&self, domain: &str) -> Result<RunState, ManagerError> {
        if !self.exists(domain).await {
            return Ok(RunState::Unknown);
        }
        let spec = CommandSpec::new(format!("systemctl is-active {}", Self::unit_name(domain))).unchecked();
        // is-active exits non-zero for anything but active; stdout carries the state
        let output = self.runner.run(&spec).await?;
        Ok(RunState::from_is_active(&output.stdout))
    }

    /// Stop, disable and delete the unit and its environment file
    pub async fn remove(&self, domain: &str) -> Result<(), ManagerError> {
        if self.exists(domain).await {
            for action in ["stop", "disable"] {
                let spec = CommandSpec::new(format!("systemctl {} {}", action, Self::unit_name(domain)))
                    .elevated()
                    .unchecked();
                let output = self.runner.run(&spec).await?;
                if !output.success() {
                    warn!("systemctl {} {} failed: {}", action, domain, output.tail());
                }
            }
        }
        self.paths.unit_file(domain).delete().await?;
        self.paths.env_file(domain).delete().await?;
        self.daemon_reload().await?;
        info!("Unit {} removed", Self::unit_name(domain));
        Ok(())
    }

    pub async fn daemon_reload(&self) -> Result<(), ManagerError> {
        self.runner
            .run(&CommandSpec::new("systemctl daemon-reload").elevated())
            .await?;
        Ok(())
    }

    pub async fn exists(&self, domain: &str) -> bool {
        self.paths.unit_file(domain).exists().await
    }

    /// Recent journal lines of the unit
    pub async fn logs(&self, domain: &str, lines: usize) -> Result<String, ManagerError> {
        let spec = CommandSpec::new(format!(
            "journalctl -u {} -n {} --no-pager",
            Self::unit_name(domain),
            lines
        ))
        .elevated();
        Ok(self.runner.run(&spec).await?.stdout)
    }

    /// Command line that follows the journal of the unit
    pub fn follow_command(domain: &str, lines: usize) -> String {
        format!("journalctl -u {} -n {} -f", Self::unit_name(domain), lines)
    }

    async fn systemctl(&self, action: &str, domain: &str) -> Result<CommandOutput, ManagerError> {
        debug!("systemctl {} {}", action, domain);
        let spec = CommandSpec::new(format!("systemctl {} {}", action, Self::unit_name(domain))).elevated();
        self.runner.run(&spec).await.map_err(|e| match e {
            ManagerError::CommandFailed { output_tail, .. } => ManagerError::SupervisorError(format!(
                "systemctl {} {} failed: {}",
                action,
                Self::unit_name(domain),
                output_tail
            )),
            other => other,
        })
    }
}

/// `KEY="value"` lines in the systemd environment file syntax
pub fn render_env(env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(&format!("{}=\"{}\"\n", key, escape_value(value)));
    }
    out
}

fn escape_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Escape a command for a double-quoted `ExecStart` argument
fn escape_exec(command: &str) -> String {
    let mut out = String::with_capacity(command.len());
    for c in command.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '%' => out.push_str("%%"),
            '$' => out.push_str("$$"),
            other => out.push(other),
        }
    }
    out
}
