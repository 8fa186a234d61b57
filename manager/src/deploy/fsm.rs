//! Finite state machine for a single deployment step

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not reached yet
    Pending,

    /// In flight
    Running,

    /// Finished successfully
    Succeeded,

    /// Finished with an error
    Failed,

    /// Not needed by this workflow
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// Step event
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// Step begins
    Start,

    /// Step finished, with optional diagnostic text
    Succeed(Option<String>),

    /// Step failed
    Fail(String),

    /// Step is not needed
    Skip(String),
}

/// Step FSM
#[derive(Debug, Clone)]
pub struct StepFsm {
    status: StepStatus,
    detail: Option<String>,
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

impl StepFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            status: StepStatus::Pending,
            detail: None,
            started: None,
            elapsed: None,
        }
    }

    /// Get current status
    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Diagnostic text captured by the last transition
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Time spent running, once the step has finished
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: StepEvent) -> Result<(), String> {
        let new_status = match (&self.status, event) {
            (StepStatus::Pending, StepEvent::Start) => {
                self.started = Some(Instant::now());
                StepStatus::Running
            }
            (StepStatus::Pending, StepEvent::Skip(reason)) => {
                self.detail = Some(reason);
                StepStatus::Skipped
            }

            (StepStatus::Running, StepEvent::Succeed(detail)) => {
                self.detail = detail;
                self.elapsed = self.started.map(|s| s.elapsed());
                StepStatus::Succeeded
            }
            (StepStatus::Running, StepEvent::Fail(err)) => {
                self.detail = Some(err);
                self.elapsed = self.started.map(|s| s.elapsed());
                StepStatus::Failed
            }

            (status, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", status, event));
            }
        };

        self.status = new_status;
        Ok(())
    }
}

impl Default for StepFsm {
    fn default() -> Self {
        Self::new()
    }
}
