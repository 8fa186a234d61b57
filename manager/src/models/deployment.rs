//! Deployment attempt models

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::{StepEvent, StepFsm, StepStatus};
use crate::errors::ManagerError;
use crate::models::app::ApplicationRecord;

/// The ordered steps every workflow is cut into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStep {
    ValidateInputs,
    Backup,
    FetchSource,
    Prepare,
    WriteProxyConfig,
    WriteSupervisorUnit,
    ActivateMaintenanceMode,
    SwitchTraffic,
    VerifyHealth,
    Finalize,
}

impl DeployStep {
    pub const ALL: [DeployStep; 10] = [
        DeployStep::ValidateInputs,
        DeployStep::Backup,
        DeployStep::FetchSource,
        DeployStep::Prepare,
        DeployStep::WriteProxyConfig,
        DeployStep::WriteSupervisorUnit,
        DeployStep::ActivateMaintenanceMode,
        DeployStep::SwitchTraffic,
        DeployStep::VerifyHealth,
        DeployStep::Finalize,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DeployStep::ValidateInputs => "validate-inputs",
            DeployStep::Backup => "backup",
            DeployStep::FetchSource => "fetch-source",
            DeployStep::Prepare => "prepare",
            DeployStep::WriteProxyConfig => "write-proxy-config",
            DeployStep::WriteSupervisorUnit => "write-supervisor-unit",
            DeployStep::ActivateMaintenanceMode => "activate-maintenance-mode",
            DeployStep::SwitchTraffic => "switch-traffic",
            DeployStep::VerifyHealth => "verify-health",
            DeployStep::Finalize => "finalize",
        }
    }

    /// Human-readable progress label
    pub fn label(&self) -> &'static str {
        match self {
            DeployStep::ValidateInputs => "Validating inputs",
            DeployStep::Backup => "Creating backup",
            DeployStep::FetchSource => "Fetching source",
            DeployStep::Prepare => "Installing dependencies and building",
            DeployStep::WriteProxyConfig => "Writing nginx configuration",
            DeployStep::WriteSupervisorUnit => "Writing systemd unit",
            DeployStep::ActivateMaintenanceMode => "Enabling maintenance page",
            DeployStep::SwitchTraffic => "Switching traffic",
            DeployStep::VerifyHealth => "Verifying health",
            DeployStep::Finalize => "Finalizing",
        }
    }
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which workflow an attempt runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowKind {
    Add,
    Update,
    Restart,
    Remove,
    Repair,
}

impl WorkflowKind {
    /// Steps the workflow executes; every other step is recorded as skipped
    pub fn steps(&self) -> &'static [DeployStep] {
        use DeployStep::*;
        match self {
            WorkflowKind::Add => &[
                ValidateInputs,
                FetchSource,
                Prepare,
                WriteProxyConfig,
                WriteSupervisorUnit,
                SwitchTraffic,
                VerifyHealth,
                Finalize,
            ],
            WorkflowKind::Update => &DeployStep::ALL,
            WorkflowKind::Restart => &[
                ValidateInputs,
                ActivateMaintenanceMode,
                SwitchTraffic,
                VerifyHealth,
                Finalize,
            ],
            WorkflowKind::Remove => &[ValidateInputs, Backup, SwitchTraffic, Finalize],
            WorkflowKind::Repair => &[
                ValidateInputs,
                Backup,
                Prepare,
                WriteProxyConfig,
                WriteSupervisorUnit,
                ActivateMaintenanceMode,
                SwitchTraffic,
                VerifyHealth,
                Finalize,
            ],
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowKind::Add => "add",
            WorkflowKind::Update => "update",
            WorkflowKind::Restart => "restart",
            WorkflowKind::Remove => "remove",
            WorkflowKind::Repair => "repair",
        };
        f.write_str(s)
    }
}

/// How the source was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceProtocol {
    Ssh,
    Https,
    Local,
}

impl fmt::Display for SourceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceProtocol::Ssh => "ssh",
            SourceProtocol::Https => "https",
            SourceProtocol::Local => "local",
        };
        f.write_str(s)
    }
}

/// Outcome of fetching or refreshing a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub protocol: SourceProtocol,

    /// SSH was rewritten to HTTPS
    pub protocol_substituted: bool,

    /// Branch checked out; `None` for local sources
    pub branch: Option<String>,

    /// A fallback branch replaced the requested one
    pub branch_substituted: bool,

    /// Every `protocol:branch` tried, in order
    pub attempts: Vec<String>,

    /// Short SHA of the checked out revision
    pub commit: Option<String>,
}

impl ResolvedSource {
    pub fn local(path: &str) -> Self {
        Self {
            protocol: SourceProtocol::Local,
            protocol_substituted: false,
            branch: None,
            branch_substituted: false,
            attempts: vec![format!("local:{}", path)],
            commit: None,
        }
    }
}

/// Final state of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// One step of an attempt
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: DeployStep,
    fsm: StepFsm,
}

impl StepRecord {
    pub fn status(&self) -> StepStatus {
        self.fsm.status()
    }

    pub fn detail(&self) -> Option<&str> {
        self.fsm.detail()
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.fsm.elapsed()
    }
}

/// Ephemeral state of one add/update/restart/remove call
#[derive(Debug, Clone)]
pub struct DeploymentAttempt {
    pub id: String,
    pub kind: WorkflowKind,
    pub domain: String,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub source: Option<ResolvedSource>,
    pub warnings: Vec<String>,
    pub outcome: AttemptOutcome,
}

impl DeploymentAttempt {
    /// New attempt with the steps the workflow does not need already skipped
    pub fn new(kind: WorkflowKind, domain: &str) -> Self {
        let steps = DeployStep::ALL
            .iter()
            .map(|step| {
                let mut fsm = StepFsm::new();
                if !kind.steps().contains(step) {
                    // Pending -> Skipped is always valid
                    let _ = fsm.process(StepEvent::Skip(format!("not part of {}", kind)));
                }
                StepRecord { step: *step, fsm }
            })
            .collect();

        Self {
            id: crate::utils::generate_uuid(),
            kind,
            domain: domain.to_string(),
            started_at: Utc::now(),
            steps,
            source: None,
            warnings: Vec::new(),
            outcome: AttemptOutcome::Running,
        }
    }

    pub fn step(&self, step: DeployStep) -> &StepRecord {
        &self.steps[Self::index(step)]
    }

    pub fn status(&self, step: DeployStep) -> StepStatus {
        self.step(step).status()
    }

    /// Drive a step through its FSM
    pub fn transition(&mut self, step: DeployStep, event: StepEvent) -> Result<(), ManagerError> {
        self.steps[Self::index(step)]
            .fsm
            .process(event)
            .map_err(|e| ManagerError::Internal(format!("step {}: {}", step, e)))
    }

    /// Number of steps this workflow actually executes
    pub fn planned(&self) -> usize {
        self.kind.steps().len()
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    fn index(step: DeployStep) -> usize {
        DeployStep::ALL.iter().position(|s| *s == step).unwrap_or(0)
    }
}

/// What a successful workflow returns
#[derive(Debug, Clone)]
pub struct DeploySummary {
    /// Record after the workflow; `None` after remove
    pub record: Option<ApplicationRecord>,

    pub attempt: DeploymentAttempt,
}

impl DeploySummary {
    pub fn warnings(&self) -> &[String] {
        &self.attempt.warnings
    }
}
