//! Application configuration options

use std::path::PathBuf;

use crate::logs::{LogLevel, LogOptions};
use crate::storage::layout::SystemPaths;
use crate::storage::settings::Settings;

/// Everything needed to build an orchestrator
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Host layout
    pub paths: SystemPaths,

    /// Settings loaded from the state directory
    pub settings: Settings,

    /// Mirror logs to stderr and stream command output
    pub verbose: bool,

    /// Emit stderr logs as JSON
    pub json_logs: bool,

    /// Render workflow progress on the terminal
    pub console_progress: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            paths: SystemPaths::default(),
            settings: Settings::default(),
            verbose: false,
            json_logs: false,
            console_progress: true,
        }
    }
}

impl AppOptions {
    /// Options for a layout rooted at `root` instead of `/`
    pub fn under(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: SystemPaths::under(root.into()),
            ..Default::default()
        }
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            log_level: if self.verbose {
                LogLevel::Debug
            } else {
                self.settings.log_level.clone()
            },
            stderr: self.verbose || self.json_logs,
            log_dir: Some(self.paths.log_dir.clone()),
            json_format: self.json_logs,
        }
    }
}
