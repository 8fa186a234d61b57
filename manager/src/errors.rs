//! Error types for the deployment manager

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::deployment::DeployStep;

/// Sub-step of a build that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStage {
    Dependency,
    Build,
    Env,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStage::Dependency => "dependency",
            BuildStage::Build => "build",
            BuildStage::Env => "env",
        };
        f.write_str(s)
    }
}

/// Coarse classification of a [`ManagerError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    SourceUnavailable,
    Build,
    ConfigInvalid,
    Supervisor,
    TimedOut,
    AttemptInProgress,
    RollbackFailed,
    Cancelled,
    Command,
    NotFound,
    Config,
    Progress,
    Io,
    Json,
    Internal,
}

/// Main error type for the deployment manager
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Source unavailable, tried: {}", .attempts.join(", "))]
    SourceUnavailable { attempts: Vec<String> },

    #[error("Build error ({stage}): {message}")]
    BuildError {
        stage: BuildStage,
        message: String,
        output_tail: String,
    },

    #[error("Invalid proxy configuration for {domain}: {output}")]
    ConfigInvalid { domain: String, output: String },

    #[error("Supervisor error: {0}")]
    SupervisorError(String),

    #[error("Timed out: {0}")]
    TimedOut(String),

    #[error("Deployment attempt already in progress for {0}")]
    AttemptInProgress(String),

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Command `{command}` exited with status {exit_code}: {output_tail}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output_tail: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Progress error: {0}")]
    ProgressError(String),

    #[error("{0}")]
    Deployment(Box<DeployFailure>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    /// Classify the error. A failed workflow reports the kind of its primary error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::IoError(_) => ErrorKind::Io,
            ManagerError::JsonError(_) => ErrorKind::Json,
            ManagerError::ValidationError(_) => ErrorKind::Validation,
            ManagerError::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            ManagerError::BuildError { .. } => ErrorKind::Build,
            ManagerError::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            ManagerError::SupervisorError(_) => ErrorKind::Supervisor,
            ManagerError::TimedOut(_) => ErrorKind::TimedOut,
            ManagerError::AttemptInProgress(_) => ErrorKind::AttemptInProgress,
            ManagerError::RollbackFailed(_) => ErrorKind::RollbackFailed,
            ManagerError::Cancelled => ErrorKind::Cancelled,
            ManagerError::CommandFailed { .. } => ErrorKind::Command,
            ManagerError::NotFound(_) => ErrorKind::NotFound,
            ManagerError::ConfigError(_) => ErrorKind::Config,
            ManagerError::ProgressError(_) => ErrorKind::Progress,
            ManagerError::Deployment(failure) => failure.error.kind(),
            ManagerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Captured command output attached to the error, if any
    pub fn output_tail(&self) -> Option<&str> {
        match self {
            ManagerError::BuildError { output_tail, .. } => Some(output_tail),
            ManagerError::CommandFailed { output_tail, .. } => Some(output_tail),
            ManagerError::ConfigInvalid { output, .. } => Some(output),
            ManagerError::Deployment(failure) => failure.error.output_tail(),
            _ => None,
        }
    }

    /// Details of a failed workflow, if this error is one
    pub fn as_deploy_failure(&self) -> Option<&DeployFailure> {
        match self {
            ManagerError::Deployment(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for ManagerError {
    fn from(err: anyhow::Error) -> Self {
        ManagerError::Internal(err.to_string())
    }
}

/// A workflow that stopped at a step, with the outcome of its rollback
#[derive(Debug)]
pub struct DeployFailure {
    /// Domain the attempt was for
    pub domain: String,

    /// Step that failed
    pub step: DeployStep,

    /// Primary error
    pub error: ManagerError,

    /// Secondary error raised while rolling back
    pub rollback_error: Option<ManagerError>,
}

impl fmt::Display for DeployFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed at step {}: {}", self.domain, self.step, self.error)?;
        if let Some(rollback) = &self.rollback_error {
            write!(f, " (rollback also failed: {})", rollback)?;
        }
        Ok(())
    }
}
