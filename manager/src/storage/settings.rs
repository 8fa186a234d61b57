//! Settings file management

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ManagerError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Prefix privileged commands with `sudo -n`
    #[serde(default)]
    pub use_sudo: bool,

    /// Default timeout for build and install commands, in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Timeout for a single git operation, in seconds
    #[serde(default = "default_git_timeout")]
    pub git_timeout_secs: u64,

    /// How long VerifyHealth waits for the unit to become active, in seconds
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    /// Interval between health polls, in milliseconds
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_ms: u64,

    /// Refuse ports that something already listens on
    #[serde(default = "default_true")]
    pub verify_port_binding: bool,

    /// Account the application units run as
    #[serde(default = "default_service_user")]
    pub service_user: String,

    /// Backup retention
    #[serde(default)]
    pub backups: RetentionPolicy,
}

fn default_true() -> bool {
    true
}

fn default_service_user() -> String {
    "www-data".to_string()
}

fn default_command_timeout() -> u64 {
    900
}

fn default_git_timeout() -> u64 {
    300
}

fn default_health_timeout() -> u64 {
    30
}

fn default_health_poll_interval() -> u64 {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            use_sudo: false,
            command_timeout_secs: default_command_timeout(),
            git_timeout_secs: default_git_timeout(),
            health_timeout_secs: default_health_timeout(),
            health_poll_interval_ms: default_health_poll_interval(),
            verify_port_binding: true,
            service_user: default_service_user(),
            backups: RetentionPolicy::default(),
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file is absent
    pub async fn load(file: &File) -> Result<Self, ManagerError> {
        if !file.exists().await {
            debug!("No settings file at {}, using defaults", file.path().display());
            return Ok(Self::default());
        }
        file.read_json().await
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }
}

/// How many snapshots to keep per application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Snapshots older than this many days are pruned
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// At most this many snapshots are kept per application
    #[serde(default = "default_max_backups")]
    pub max_backups_per_app: usize,
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_backups() -> usize {
    5
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            max_backups_per_app: default_max_backups(),
        }
    }
}
