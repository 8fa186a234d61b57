//! Deployment workflows
//!
//! Every workflow runs the same ten-step pipeline (see [`DeployStep`]),
//! executing the steps its [`WorkflowKind`] needs. Whatever a failed or
//! cancelled attempt changed is undone from its [`RollbackPlan`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cmd::{CommandRunner, CommandSpec};
use crate::deploy::cancel::CancelToken;
use crate::deploy::deployer::{AppDeployer, BuildResult};
use crate::deploy::fsm::{StepEvent, StepStatus};
use crate::deploy::git::{SourceFetcher, SourceLocator};
use crate::deploy::locks::DomainLocks;
use crate::deploy::validate::{validate_branch, validate_domain, validate_email, validate_env, validate_port};
use crate::errors::{DeployFailure, ManagerError};
use crate::filesys::dir::Dir;
use crate::models::app::{AppSpec, AppStatus, AppType, ApplicationRecord, RunState};
use crate::models::deployment::{
    AttemptOutcome, DeployStep, DeploySummary, DeploymentAttempt, ResolvedSource, WorkflowKind,
};
use crate::progress::{Progress, TaskGuard};
use crate::services::maintenance::{install_pages, MaintenancePage};
use crate::services::nginx::NginxService;
use crate::services::systemd::SystemdService;
use crate::storage::backup::{BackupHandle, BackupStore, DirBackupStore};
use crate::storage::layout::SystemPaths;
use crate::storage::ports::PortRegistry;
use crate::storage::records::{JsonRecordStore, RecordExport, RecordStore};
use crate::storage::settings::Settings;
use crate::utils::shell_quote;

const PORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Options of the remove workflow
#[derive(Debug, Clone, Copy)]
pub struct RemoveOptions {
    /// Leave the managed source directory on disk
    pub keep_source: bool,

    /// Snapshot the application before removing it
    pub backup: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            keep_source: false,
            backup: true,
        }
    }
}

/// Live view of one application
#[derive(Debug, Clone, Serialize)]
pub struct AppReport {
    pub record: ApplicationRecord,
    pub run_state: RunState,
    pub site_installed: bool,
    pub site_enabled: bool,
    pub in_maintenance: bool,
}

/// Outcome of re-rendering sites without maintenance routing
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Outcome of merging exported records into the store
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: Vec<String>,

    /// Already present and not replaced
    pub skipped: Vec<String>,

    pub failed: Vec<(String, String)>,
}

/// Where an attempt builds
enum Workspace {
    /// Scratch directory promoted to the live directory after a successful build
    Staged(Dir),

    /// The live directory itself (static sites served from their source path)
    InPlace(Dir),
}

impl Workspace {
    fn dir(&self) -> &Dir {
        match self {
            Workspace::Staged(dir) | Workspace::InPlace(dir) => dir,
        }
    }
}

/// What a failed attempt has to undo
#[derive(Default)]
struct RollbackPlan {
    snapshot: Option<BackupHandle>,
    previous_record: Option<ApplicationRecord>,
    staging: Option<Dir>,

    /// Something live (app dir, site, unit, process) was modified
    live_touched: bool,

    /// The process was active before the attempt
    restart_previous: bool,

    /// The unit was enabled before the attempt removed it
    reenable: bool,

    /// The attempt started or restarted the process
    stop_started: bool,

    // add: artifacts that did not exist before
    created_app_dir: Option<Dir>,
    installed_site: bool,
    created_unit: bool,

    /// Regular site to put back when maintenance mode was entered without a snapshot
    restore_site: Option<ApplicationRecord>,

    touched_proxy: bool,
    record_written: bool,
}

/// Attempt bookkeeping shared by the workflow steps
struct AttemptCtx<'a> {
    attempt: DeploymentAttempt,
    task: TaskGuard,
    cancel: &'a CancelToken,
    current: Option<DeployStep>,
}

impl AttemptCtx<'_> {
    fn begin(&mut self, step: DeployStep) -> Result<(), ManagerError> {
        self.current = Some(step);
        if self.cancel.is_cancelled() {
            return Err(ManagerError::Cancelled);
        }
        self.attempt.transition(step, StepEvent::Start)?;
        self.task.update(0, Some(step.label()));
        debug!("{} {}: {}", self.attempt.kind, self.attempt.domain, step);
        Ok(())
    }

    fn done(&mut self, step: DeployStep, detail: Option<String>) -> Result<(), ManagerError> {
        self.attempt.transition(step, StepEvent::Succeed(detail))?;
        self.current = None;
        self.task.update(1, None);
        Ok(())
    }

    fn skip(&mut self, step: DeployStep, reason: &str) -> Result<(), ManagerError> {
        self.attempt.transition(step, StepEvent::Skip(reason.to_string()))?;
        self.task.update(1, None);
        Ok(())
    }

    fn warn(&mut self, message: String) {
        warn!("{}: {}", self.attempt.domain, message);
        self.attempt.warn(message);
    }

    /// Record how the attempt ended and settle every step that never finished
    fn settle_failure(&mut self, step: DeployStep, error: &ManagerError) {
        let event = if self.attempt.status(step) == StepStatus::Running {
            StepEvent::Fail(error.to_string())
        } else {
            StepEvent::Skip(error.to_string())
        };
        let _ = self.attempt.transition(step, event);
        for pending in DeployStep::ALL {
            if self.attempt.status(pending) == StepStatus::Pending {
                let _ = self.attempt.transition(pending, StepEvent::Skip("not reached".to_string()));
            }
        }
        self.attempt.outcome = match error {
            ManagerError::Cancelled => AttemptOutcome::Cancelled,
            _ => AttemptOutcome::Failed,
        };
    }
}

/// Sequences sources, builds, nginx and systemd into deployment workflows
pub struct Orchestrator {
    paths: SystemPaths,
    settings: Settings,
    runner: Arc<dyn CommandRunner>,
    records: Arc<dyn RecordStore>,
    backups: Arc<dyn BackupStore>,
    ports: PortRegistry,
    locks: DomainLocks,
    progress: Progress,
    fetcher: SourceFetcher,
    nginx: NginxService,
    systemd: SystemdService,
}

impl Orchestrator {
    /// Orchestrator over the JSON record store and directory backups of `paths`
    pub fn new(
        paths: SystemPaths,
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        progress: Progress,
    ) -> Self {
        let records = Arc::new(JsonRecordStore::new(paths.records_file(), paths.apps_dir.clone()));
        let backups = Arc::new(DirBackupStore::new(paths.backup_dir.clone()));
        Self {
            fetcher: SourceFetcher::new(runner.clone(), settings.git_timeout()),
            nginx: NginxService::new(paths.clone(), runner.clone()),
            systemd: SystemdService::new(paths.clone(), runner.clone(), settings.service_user.clone()),
            ports: PortRegistry::new(),
            locks: DomainLocks::new(),
            paths,
            settings,
            runner,
            records,
            backups,
            progress,
        }
    }

    pub fn paths(&self) -> &SystemPaths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn backups(&self) -> &Arc<dyn BackupStore> {
        &self.backups
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn locks(&self) -> &DomainLocks {
        &self.locks
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn nginx(&self) -> &NginxService {
        &self.nginx
    }

    pub fn systemd(&self) -> &SystemdService {
        &self.systemd
    }

    // ========================== workflows ========================== //

    /// Deploy a new application
    pub async fn add(&self, spec: AppSpec, cancel: &CancelToken) -> Result<DeploySummary, ManagerError> {
        let _lock = self.locks.try_acquire(&spec.domain)?;
        let mut ctx = self.start(WorkflowKind::Add, &spec.domain, cancel)?;
        let mut plan = RollbackPlan::default();
        let result = self.run_add(&spec, &mut ctx, &mut plan).await;
        self.conclude(ctx, plan, result).await
    }

    /// Redeploy an application from the newest revision of its source
    pub async fn update(
        &self,
        domain: &str,
        branch: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<DeploySummary, ManagerError> {
        let _lock = self.locks.try_acquire(domain)?;
        let mut ctx = self.start(WorkflowKind::Update, domain, cancel)?;
        let mut plan = RollbackPlan::default();
        let result = self.run_update(domain, branch, &mut ctx, &mut plan).await;
        self.conclude(ctx, plan, result).await
    }

    /// Rebuild an application's dependencies from its current source and
    /// recreate its unit, without fetching anything
    pub async fn repair(&self, domain: &str, cancel: &CancelToken) -> Result<DeploySummary, ManagerError> {
        let _lock = self.locks.try_acquire(domain)?;
        let mut ctx = self.start(WorkflowKind::Repair, domain, cancel)?;
        let mut plan = RollbackPlan::default();
        let result = self.run_update(domain, None, &mut ctx, &mut plan).await;
        self.conclude(ctx, plan, result).await
    }

    /// Restart the process of an application behind the updating page
    pub async fn restart(&self, domain: &str, cancel: &CancelToken) -> Result<DeploySummary, ManagerError> {
        let _lock = self.locks.try_acquire(domain)?;
        let mut ctx = self.start(WorkflowKind::Restart, domain, cancel)?;
        let mut plan = RollbackPlan::default();
        let result = self.run_restart(domain, &mut ctx, &mut plan).await;
        self.conclude(ctx, plan, result).await
    }

    /// Stop, unwire and forget an application
    pub async fn remove(
        &self,
        domain: &str,
        options: RemoveOptions,
        cancel: &CancelToken,
    ) -> Result<DeploySummary, ManagerError> {
        let _lock = self.locks.try_acquire(domain)?;
        let mut ctx = self.start(WorkflowKind::Remove, domain, cancel)?;
        let mut plan = RollbackPlan::default();
        let result = self.run_remove(domain, options, &mut ctx, &mut plan).await;
        self.conclude(ctx, plan, result).await
    }

    fn start<'a>(
        &self,
        kind: WorkflowKind,
        domain: &str,
        cancel: &'a CancelToken,
    ) -> Result<AttemptCtx<'a>, ManagerError> {
        let attempt = DeploymentAttempt::new(kind, domain);
        let task = self
            .progress
            .begin(domain, format!("{} {}", capitalize(&kind.to_string()), domain), attempt.planned())?;
        info!("Starting {} of {} (attempt {})", kind, domain, attempt.id);
        Ok(AttemptCtx {
            attempt,
            task,
            cancel,
            current: None,
        })
    }

    async fn run_add(
        &self,
        spec: &AppSpec,
        ctx: &mut AttemptCtx<'_>,
        plan: &mut RollbackPlan,
    ) -> Result<Option<ApplicationRecord>, ManagerError> {
        let domain = spec.domain.as_str();

        ctx.begin(DeployStep::ValidateInputs)?;
        validate_domain(domain)?;
        validate_port(spec.port)?;
        validate_branch(&spec.branch)?;
        validate_env(&spec.env_vars)?;
        let locator = SourceLocator::parse(&spec.source)?;
        if self.records.get(domain).await?.is_some() {
            return Err(ManagerError::ValidationError(format!(
                "{} is already deployed; use update instead",
                domain
            )));
        }
        let _lease = self
            .ports
            .reserve(spec.port, domain, self.records.as_ref(), self.settings.verify_port_binding)
            .await?;
        ctx.done(DeployStep::ValidateInputs, None)?;

        ctx.begin(DeployStep::FetchSource)?;
        let serve_in_place = spec.app_type == AppType::Static
            && spec.build_command.as_deref().is_none_or(|c| c.trim().is_empty());
        let (workspace, source) = match &locator {
            SourceLocator::Local(path) if serve_in_place => {
                let dir = local_source_dir(path).await?;
                let source = ResolvedSource::local(&dir.path().display().to_string());
                (Workspace::InPlace(dir), source)
            }
            _ => {
                let staging = self.paths.staging_dir(domain);
                plan.staging = Some(staging.clone());
                let source = self.fetcher.fetch(&locator, &spec.branch, &staging).await?;
                (Workspace::Staged(staging), source)
            }
        };
        let working_dir = match &workspace {
            Workspace::InPlace(dir) => dir.path().to_path_buf(),
            Workspace::Staged(_) => self.paths.app_dir(domain).path().to_path_buf(),
        };
        let mut record = ApplicationRecord::new(spec, working_dir);
        record.resolved_branch = source.branch.clone();
        record.commit = source.commit.clone();
        self.note_source(ctx, &source, &spec.branch);
        ctx.done(DeployStep::FetchSource, Some(describe_source(&source)))?;

        ctx.begin(DeployStep::Prepare)?;
        let build = self.prepare(&workspace, &record).await?;
        if let Workspace::Staged(staging) = &workspace {
            plan.live_touched = true;
            plan.created_app_dir = Some(self.paths.app_dir(domain));
            self.promote(&record, staging).await?;
            plan.staging = None;
        }
        record.document_root = build.document_root.clone();
        ctx.done(DeployStep::Prepare, build.start_command.clone())?;

        ctx.begin(DeployStep::WriteProxyConfig)?;
        plan.touched_proxy = true;
        self.nginx.install(domain, &self.nginx.render(&record)).await?;
        plan.installed_site = true;
        ctx.done(DeployStep::WriteProxyConfig, None)?;

        let has_process = record.app_type.has_process();
        if has_process {
            ctx.begin(DeployStep::WriteSupervisorUnit)?;
            plan.created_unit = true;
            self.write_unit(&record, &build).await?;
            ctx.done(DeployStep::WriteSupervisorUnit, None)?;
        } else {
            ctx.skip(DeployStep::WriteSupervisorUnit, "static sites are served by nginx")?;
        }

        ctx.begin(DeployStep::SwitchTraffic)?;
        if has_process {
            plan.stop_started = true;
            self.systemd.restart(domain).await?;
        } else {
            self.nginx.test_and_reload().await?;
        }
        ctx.done(DeployStep::SwitchTraffic, None)?;

        self.verify_step(ctx, &mut record).await?;

        ctx.begin(DeployStep::Finalize)?;
        record.set_status(AppStatus::Active);
        plan.record_written = true;
        self.records.upsert(&record).await?;
        ctx.done(DeployStep::Finalize, Some(record.url()))?;

        info!("{} deployed at {} (port {})", domain, record.url(), record.port);
        Ok(Some(record))
    }

    async fn run_update(
        &self,
        domain: &str,
        branch: Option<&str>,
        ctx: &mut AttemptCtx<'_>,
        plan: &mut RollbackPlan,
    ) -> Result<Option<ApplicationRecord>, ManagerError> {
        ctx.begin(DeployStep::ValidateInputs)?;
        let previous = self.require(domain).await?;
        let branch = branch.map(str::to_string).unwrap_or_else(|| previous.branch.clone());
        validate_branch(&branch)?;
        validate_port(previous.port)?;
        validate_env(&previous.env_vars)?;
        let locator = SourceLocator::parse(&previous.source)?;
        // The running app holds its own port, so no bind check here
        let _lease = self
            .ports
            .reserve(previous.port, domain, self.records.as_ref(), false)
            .await?;
        let has_process = previous.app_type.has_process();
        let was_running = has_process && self.systemd.status(domain).await? == RunState::Active;
        plan.previous_record = Some(previous.clone());
        ctx.done(DeployStep::ValidateInputs, None)?;

        let managed = previous.working_dir == self.paths.app_dir(domain).path();

        ctx.begin(DeployStep::Backup)?;
        let mut artifacts = self.paths.artifacts(domain);
        if !managed && !locator.is_local() {
            artifacts.push(previous.working_dir.clone());
        }
        let snapshot = self.backups.create(domain, &artifacts).await?;
        let snapshot_id = snapshot.id.clone();
        plan.snapshot = Some(snapshot);
        plan.restart_previous = was_running;
        ctx.done(DeployStep::Backup, Some(snapshot_id))?;

        let live = Dir::new(&previous.working_dir);
        let mut record = previous.clone();
        let fetched = if ctx.attempt.kind == WorkflowKind::Repair {
            None
        } else {
            ctx.begin(DeployStep::FetchSource)?;
            let (workspace, source) = if managed {
                let staging = self.paths.staging_dir(domain);
                plan.staging = Some(staging.clone());
                let source = if !locator.is_local() && live.subdir(".git").exists().await {
                    staging.delete().await?;
                    live.copy_to(staging.path()).await?;
                    self.fetcher.refresh(&staging, &branch).await?
                } else {
                    self.fetcher.fetch(&locator, &branch, &staging).await?
                };
                (Workspace::Staged(staging), source)
            } else if locator.is_local() {
                let dir = local_source_dir(&previous.working_dir).await?;
                let source = ResolvedSource::local(&dir.path().display().to_string());
                (Workspace::InPlace(dir), source)
            } else {
                plan.live_touched = true;
                let source = self.fetcher.refresh(&live, &branch).await?;
                (Workspace::InPlace(live.clone()), source)
            };
            record.branch = branch.clone();
            if source.branch.is_some() {
                record.resolved_branch = source.branch.clone();
            }
            record.commit = source.commit.clone().or(record.commit);
            self.note_source(ctx, &source, &branch);
            ctx.done(DeployStep::FetchSource, Some(describe_source(&source)))?;
            Some(workspace)
        };

        ctx.begin(DeployStep::Prepare)?;
        let workspace = match fetched {
            Some(workspace) => workspace,
            None => self.stage_repair(&record, &live, managed, locator.is_local(), plan).await?,
        };
        let build = self.prepare(&workspace, &record).await?;
        plan.live_touched = true;
        if let Workspace::Staged(staging) = &workspace {
            self.promote(&record, staging).await?;
            plan.staging = None;
        }
        record.document_root = build.document_root.clone();
        ctx.done(DeployStep::Prepare, build.start_command.clone())?;

        ctx.begin(DeployStep::WriteProxyConfig)?;
        plan.touched_proxy = true;
        self.nginx.install(domain, &self.nginx.render(&record)).await?;
        ctx.done(DeployStep::WriteProxyConfig, None)?;

        if has_process {
            ctx.begin(DeployStep::WriteSupervisorUnit)?;
            self.write_unit(&record, &build).await?;
            ctx.done(DeployStep::WriteSupervisorUnit, None)?;

            self.maintenance_step(ctx, &record).await?;
        } else {
            ctx.skip(DeployStep::WriteSupervisorUnit, "static sites are served by nginx")?;
            ctx.skip(DeployStep::ActivateMaintenanceMode, "static sites switch without downtime")?;
        }

        ctx.begin(DeployStep::SwitchTraffic)?;
        if has_process {
            plan.stop_started = true;
            self.systemd.restart(domain).await?;
        }
        self.nginx.install(domain, &self.nginx.render(&record)).await?;
        ctx.done(DeployStep::SwitchTraffic, None)?;

        self.verify_step(ctx, &mut record).await?;

        ctx.begin(DeployStep::Finalize)?;
        record.set_status(AppStatus::Active);
        plan.record_written = true;
        self.records.upsert(&record).await?;
        self.prune(ctx, domain).await;
        ctx.done(DeployStep::Finalize, Some(record.url()))?;

        match ctx.attempt.kind {
            WorkflowKind::Repair => info!("{} repaired", domain),
            _ => info!("{} updated to {}", domain, record.commit.as_deref().unwrap_or("latest")),
        }
        Ok(Some(record))
    }

    async fn run_restart(
        &self,
        domain: &str,
        ctx: &mut AttemptCtx<'_>,
        plan: &mut RollbackPlan,
    ) -> Result<Option<ApplicationRecord>, ManagerError> {
        ctx.begin(DeployStep::ValidateInputs)?;
        let previous = self.require(domain).await?;
        let has_process = previous.app_type.has_process();
        if has_process && !self.systemd.exists(domain).await {
            return Err(ManagerError::SupervisorError(format!(
                "unit {} does not exist; run update to recreate it",
                SystemdService::unit_name(domain)
            )));
        }
        plan.restart_previous = has_process && self.systemd.status(domain).await? == RunState::Active;
        plan.previous_record = Some(previous.clone());
        ctx.done(DeployStep::ValidateInputs, None)?;

        let mut record = previous.clone();
        if has_process {
            if self.maintenance_step(ctx, &record).await? {
                plan.restore_site = Some(record.clone());
            }
        } else {
            ctx.skip(DeployStep::ActivateMaintenanceMode, "static sites switch without downtime")?;
        }

        ctx.begin(DeployStep::SwitchTraffic)?;
        plan.live_touched = true;
        plan.touched_proxy = true;
        if has_process {
            plan.stop_started = true;
            self.systemd.restart(domain).await?;
        }
        if plan.restore_site.is_some() {
            self.nginx.leave_maintenance(&record).await?;
            plan.restore_site = None;
        } else {
            self.nginx.test_and_reload().await?;
        }
        ctx.done(DeployStep::SwitchTraffic, None)?;

        self.verify_step(ctx, &mut record).await?;

        ctx.begin(DeployStep::Finalize)?;
        record.set_status(AppStatus::Active);
        plan.record_written = true;
        self.records.upsert(&record).await?;
        ctx.done(DeployStep::Finalize, Some(record.url()))?;

        info!("{} restarted", domain);
        Ok(Some(record))
    }

    async fn run_remove(
        &self,
        domain: &str,
        options: RemoveOptions,
        ctx: &mut AttemptCtx<'_>,
        plan: &mut RollbackPlan,
    ) -> Result<Option<ApplicationRecord>, ManagerError> {
        ctx.begin(DeployStep::ValidateInputs)?;
        let previous = self.require(domain).await?;
        let unit_exists = self.systemd.exists(domain).await;
        let was_running = unit_exists && self.systemd.status(domain).await? == RunState::Active;
        plan.previous_record = Some(previous.clone());
        ctx.done(DeployStep::ValidateInputs, None)?;

        if options.backup {
            ctx.begin(DeployStep::Backup)?;
            let snapshot = self.backups.create(domain, &self.paths.artifacts(domain)).await?;
            let snapshot_id = snapshot.id.clone();
            plan.snapshot = Some(snapshot);
            plan.restart_previous = was_running;
            plan.reenable = unit_exists;
            ctx.done(DeployStep::Backup, Some(snapshot_id))?;
        } else {
            ctx.skip(DeployStep::Backup, "backup disabled")?;
        }

        ctx.begin(DeployStep::SwitchTraffic)?;
        plan.live_touched = true;
        plan.touched_proxy = true;
        if unit_exists {
            self.systemd.remove(domain).await?;
        }
        self.nginx.remove(domain).await?;
        ctx.done(DeployStep::SwitchTraffic, Some("stopped and unwired".to_string()))?;

        ctx.begin(DeployStep::Finalize)?;
        plan.record_written = true;
        self.records.delete(domain).await?;
        let app_dir = self.paths.app_dir(domain);
        if options.keep_source {
            info!("Keeping {}", app_dir.path().display());
        } else {
            app_dir.delete().await?;
        }
        self.paths.staging_dir(domain).delete().await?;
        self.paths.retired_dir(domain).delete().await?;
        if previous.ssl {
            self.revoke_certificate(ctx, domain).await;
        }
        ctx.done(DeployStep::Finalize, Some("record and source deleted".to_string()))?;

        info!("{} removed", domain);
        Ok(None)
    }

    // ============================ steps ============================ //

    /// Workspace for a repair: the current tree without its installed
    /// dependencies, staged when the tree is managed
    async fn stage_repair(
        &self,
        record: &ApplicationRecord,
        live: &Dir,
        managed: bool,
        local: bool,
        plan: &mut RollbackPlan,
    ) -> Result<Workspace, ManagerError> {
        let deployer = self.deployer(record.app_type);
        if managed {
            let staging = self.paths.staging_dir(&record.domain);
            plan.staging = Some(staging.clone());
            staging.delete().await?;
            live.copy_to(staging.path()).await?;
            deployer.clean(&staging).await?;
            Ok(Workspace::Staged(staging))
        } else if local {
            // Served from the operator's directory, which is never cleaned
            Ok(Workspace::InPlace(local_source_dir(live.path()).await?))
        } else {
            plan.live_touched = true;
            deployer.clean(live).await?;
            Ok(Workspace::InPlace(live.clone()))
        }
    }

    fn deployer(&self, app_type: AppType) -> AppDeployer {
        AppDeployer::for_type(app_type, self.runner.clone(), self.settings.command_timeout())
    }

    async fn prepare(&self, workspace: &Workspace, record: &ApplicationRecord) -> Result<BuildResult, ManagerError> {
        self.deployer(record.app_type).prepare(workspace.dir(), record).await
    }

    /// Swap the staging directory in as the live one
    async fn promote(&self, record: &ApplicationRecord, staging: &Dir) -> Result<(), ManagerError> {
        let live = self.paths.app_dir(&record.domain);
        let retired = self.paths.retired_dir(&record.domain);
        retired.delete().await?;
        if live.exists().await {
            live.rename_to(retired.path()).await?;
        }
        staging.rename_to(live.path()).await?;
        retired.delete().await?;
        self.deployer(record.app_type).relocate(staging, &live).await?;
        debug!("Promoted {} to {}", staging.path().display(), live.path().display());
        Ok(())
    }

    async fn write_unit(&self, record: &ApplicationRecord, build: &BuildResult) -> Result<(), ManagerError> {
        let start = build.start_command.as_deref().ok_or_else(|| {
            ManagerError::Internal(format!("no start command resolved for {}", record.domain))
        })?;
        self.systemd
            .create(&record.domain, start, &record.working_dir, &build.environment)
            .await?;
        self.systemd.enable(&record.domain).await
    }

    /// Best effort: a failure is recorded as a warning. Returns whether the
    /// updating page is now served.
    async fn maintenance_step(
        &self,
        ctx: &mut AttemptCtx<'_>,
        record: &ApplicationRecord,
    ) -> Result<bool, ManagerError> {
        ctx.begin(DeployStep::ActivateMaintenanceMode)?;
        match self.nginx.enter_maintenance(record, MaintenancePage::Updating).await {
            Ok(()) => {
                ctx.done(DeployStep::ActivateMaintenanceMode, Some("updating page".to_string()))?;
                Ok(true)
            }
            Err(e) => {
                ctx.warn(format!("maintenance page not activated: {}", e));
                ctx.done(DeployStep::ActivateMaintenanceMode, Some("not activated".to_string()))?;
                Ok(false)
            }
        }
    }

    async fn verify_step(&self, ctx: &mut AttemptCtx<'_>, record: &mut ApplicationRecord) -> Result<(), ManagerError> {
        if !record.app_type.has_process() {
            record.health = RunState::Active;
            return ctx.skip(DeployStep::VerifyHealth, "no process to supervise");
        }

        ctx.begin(DeployStep::VerifyHealth)?;
        let state = self.wait_active(&record.domain).await?;
        record.health = state;
        if self.settings.verify_port_binding && !port_accepts_connections(record.port).await {
            ctx.warn(format!("unit is active but nothing answers on 127.0.0.1:{} yet", record.port));
        }
        ctx.done(DeployStep::VerifyHealth, Some(state.to_string()))
    }

    /// Poll the unit until it is active
    async fn wait_active(&self, domain: &str) -> Result<RunState, ManagerError> {
        let deadline = Instant::now() + self.settings.health_timeout();
        let last = loop {
            let state = match self.systemd.status(domain).await? {
                RunState::Active => return Ok(RunState::Active),
                RunState::Failed => {
                    return Err(ManagerError::SupervisorError(format!(
                        "{} entered the failed state",
                        SystemdService::unit_name(domain)
                    )))
                }
                other => other,
            };
            if Instant::now() >= deadline {
                break state;
            }
            tokio::time::sleep(self.settings.health_poll_interval()).await;
        };
        Err(ManagerError::TimedOut(format!(
            "{} not active after {:?} (last state: {})",
            SystemdService::unit_name(domain),
            self.settings.health_timeout(),
            last
        )))
    }

    /// Best effort; a failure becomes a warning
    async fn revoke_certificate(&self, ctx: &mut AttemptCtx<'_>, domain: &str) {
        let command = format!("certbot delete --cert-name {} --non-interactive", domain);
        let spec = CommandSpec::new(command).elevated().timeout(self.settings.command_timeout());
        match self.runner.run(&spec).await {
            Ok(_) => debug!("Deleted the certificate of {}", domain),
            Err(e) => ctx.warn(format!("certificate not deleted: {}", e)),
        }
    }

    async fn prune(&self, ctx: &mut AttemptCtx<'_>, domain: &str) {
        match self.backups.prune(domain, &self.settings.backups).await {
            Ok(0) => {}
            Ok(pruned) => debug!("Pruned {} backup(s) of {}", pruned, domain),
            Err(e) => ctx.warn(format!("backup pruning failed: {}", e)),
        }
    }

    fn note_source(&self, ctx: &mut AttemptCtx<'_>, source: &ResolvedSource, requested: &str) {
        if source.protocol_substituted {
            ctx.warn("SSH clone failed, source fetched over HTTPS".to_string());
        }
        if source.branch_substituted {
            if let Some(branch) = &source.branch {
                ctx.warn(format!("branch '{}' not found, deployed '{}' instead", requested, branch));
            }
        }
        ctx.attempt.source = Some(source.clone());
    }

    // =========================== outcome =========================== //

    async fn conclude(
        &self,
        mut ctx: AttemptCtx<'_>,
        plan: RollbackPlan,
        result: Result<Option<ApplicationRecord>, ManagerError>,
    ) -> Result<DeploySummary, ManagerError> {
        let domain = ctx.attempt.domain.clone();
        match result {
            Ok(record) => {
                ctx.attempt.outcome = AttemptOutcome::Succeeded;
                let AttemptCtx { attempt, task, .. } = ctx;
                let message = match &record {
                    Some(record) => format!("{} ({} on port {})", record.url(), record.app_type, record.port),
                    None => format!("{} removed", domain),
                };
                task.complete(Some(&message));
                Ok(DeploySummary { record, attempt })
            }
            Err(error) => {
                let step = ctx.current.unwrap_or(DeployStep::ValidateInputs);
                ctx.settle_failure(step, &error);
                error!("{} of {} failed at {}: {}", ctx.attempt.kind, domain, step, error);

                let rollback_error = match self.rollback(&domain, plan).await {
                    Ok(()) => None,
                    Err(e) => {
                        error!("Rollback of {} failed: {}", domain, e);
                        Some(e)
                    }
                };

                let failure = DeployFailure {
                    domain,
                    step,
                    error,
                    rollback_error,
                };
                let message = failure.to_string();
                match ctx.attempt.outcome {
                    AttemptOutcome::Cancelled => ctx.task.cancel(&message),
                    _ => ctx.task.fail(&message),
                }
                Err(ManagerError::Deployment(Box::new(failure)))
            }
        }
    }

    /// Undo what `plan` records. Every action is attempted; failures are
    /// collected into one `RollbackFailed`.
    async fn rollback(&self, domain: &str, plan: RollbackPlan) -> Result<(), ManagerError> {
        let mut failures: Vec<String> = Vec::new();
        let mut check = |action: &str, result: Result<(), ManagerError>| {
            if let Err(e) = result {
                warn!("Rollback of {}: {} failed: {}", domain, action, e);
                failures.push(format!("{}: {}", action, e));
            }
        };

        if let Some(staging) = &plan.staging {
            check("remove staging directory", staging.delete().await);
        }

        if plan.created_unit {
            check("remove unit", self.systemd.remove(domain).await);
        }
        if plan.installed_site {
            check("remove site", self.nginx.remove(domain).await);
        }
        if let Some(dir) = &plan.created_app_dir {
            check("remove application directory", dir.delete().await);
        }

        if plan.live_touched {
            if let Some(snapshot) = &plan.snapshot {
                info!("Restoring {} from backup {}", domain, snapshot.id);
                check("restore backup", self.backups.restore(snapshot).await);
                check("reload units", self.systemd.daemon_reload().await);
            }
        }

        if let Some(record) = &plan.restore_site {
            check("leave maintenance mode", self.nginx.leave_maintenance(record).await);
        }

        if plan.record_written {
            match &plan.previous_record {
                Some(record) => check("restore record", self.records.upsert(record).await),
                None => check("delete record", self.records.delete(domain).await.map(|_| ())),
            }
        }

        if plan.live_touched && plan.reenable {
            check("re-enable unit", self.systemd.enable(domain).await);
        }
        if plan.live_touched && plan.restart_previous {
            check("restart previous process", self.systemd.restart(domain).await);
        } else if plan.stop_started && !plan.created_unit && self.systemd.exists(domain).await {
            check("stop process", self.systemd.stop(domain).await);
        }

        if plan.touched_proxy {
            check("reload nginx", self.nginx.test_and_reload().await);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::RollbackFailed(failures.join("; ")))
        }
    }

    // ========================= inspection ========================== //

    async fn require(&self, domain: &str) -> Result<ApplicationRecord, ManagerError> {
        self.records
            .get(domain)
            .await?
            .ok_or_else(|| ManagerError::NotFound(format!("no application named {}", domain)))
    }

    /// Live state of one application
    pub async fn status(&self, domain: &str) -> Result<AppReport, ManagerError> {
        let record = self.require(domain).await?;
        self.report(record).await
    }

    /// Live state of every application
    pub async fn list(&self) -> Result<Vec<AppReport>, ManagerError> {
        let records = self.records.list().await?;
        join_all(records.into_iter().map(|record| self.report(record)))
            .await
            .into_iter()
            .collect()
    }

    async fn report(&self, record: ApplicationRecord) -> Result<AppReport, ManagerError> {
        let site_installed = self.nginx.is_installed(&record.domain).await;
        let site_enabled = self.nginx.is_enabled(&record.domain).await;
        let run_state = if record.app_type.has_process() {
            self.systemd.status(&record.domain).await?
        } else if site_enabled {
            RunState::Active
        } else {
            RunState::Inactive
        };
        Ok(AppReport {
            in_maintenance: self.nginx.is_in_maintenance(&record.domain).await?,
            record,
            run_state,
            site_installed,
            site_enabled,
        })
    }

    /// Recent journal lines of an application
    pub async fn logs(&self, domain: &str, lines: usize) -> Result<String, ManagerError> {
        let record = self.require(domain).await?;
        if !record.app_type.has_process() {
            return Err(ManagerError::ValidationError(format!(
                "{} is a static site; see {}",
                domain,
                self.paths.access_log(domain).display()
            )));
        }
        self.systemd.logs(domain, lines).await
    }

    // ========================= maintenance ========================= //

    /// Serve the maintenance page instead of the application, or stop doing so
    pub async fn set_maintenance(&self, domain: &str, enable: bool) -> Result<(), ManagerError> {
        let _lock = self.locks.try_acquire(domain)?;
        let record = self.require(domain).await?;
        if enable {
            install_pages(&self.paths, false).await?;
            self.nginx.enter_maintenance(&record, MaintenancePage::Maintenance).await?;
            info!("{} is in maintenance mode", domain);
        } else {
            self.nginx.leave_maintenance(&record).await?;
            info!("{} left maintenance mode", domain);
        }
        Ok(())
    }

    /// Re-render every site that predates maintenance error routing
    pub async fn apply_maintenance(&self) -> Result<MaintenanceReport, ManagerError> {
        install_pages(&self.paths, false).await?;
        let mut report = MaintenanceReport::default();

        for record in self.records.list().await? {
            let domain = record.domain.clone();
            if !self.nginx.is_installed(&domain).await
                || self.nginx.is_in_maintenance(&domain).await?
                || self.nginx.has_maintenance_routing(&domain).await?
            {
                report.unchanged.push(domain);
                continue;
            }

            let result = match self.locks.try_acquire(&domain) {
                Ok(_lock) => self.nginx.install(&domain, &self.nginx.render(&record)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.updated.push(domain),
                Err(e) => {
                    warn!("Could not add maintenance routing to {}: {}", domain, e);
                    report.failed.push((domain, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Create the directory layout and the maintenance pages
    pub async fn setup(&self) -> Result<Vec<PathBuf>, ManagerError> {
        self.paths.setup().await?;
        install_pages(&self.paths, false).await
    }

    // ========================= certificates ======================== //

    /// Obtain a certificate with certbot's nginx plugin and serve the site
    /// over HTTPS from then on. `email` defaults to `admin@<domain>`.
    pub async fn setup_ssl(&self, domain: &str, email: Option<&str>) -> Result<ApplicationRecord, ManagerError> {
        let _lock = self.locks.try_acquire(domain)?;
        let mut record = self.require(domain).await?;
        let email = email.map_or_else(|| format!("admin@{}", domain), str::to_string);
        validate_email(&email)?;

        let certbot = self.runner.run(&CommandSpec::new("command -v certbot").unchecked()).await?;
        if !certbot.success() {
            return Err(ManagerError::ConfigError(
                "certbot is not installed (apt install certbot python3-certbot-nginx)".to_string(),
            ));
        }

        let command = format!(
            "certbot --nginx -d {} --non-interactive --agree-tos --email {} --redirect",
            domain,
            shell_quote(&email)
        );
        self.runner
            .run(&CommandSpec::new(command).elevated().timeout(self.settings.command_timeout()))
            .await?;

        // certbot edited the site in place; put the managed rendering back with TLS
        record.ssl = true;
        let content = if self.nginx.is_in_maintenance(domain).await? {
            self.nginx.render_maintenance(&record, MaintenancePage::Maintenance)
        } else {
            self.nginx.render(&record)
        };
        self.nginx.install(domain, &content).await?;

        record.touch();
        self.records.upsert(&record).await?;
        info!("{} is served at {}", domain, record.url());
        Ok(record)
    }

    // ======================== export / import ====================== //

    /// Every record, ready to be written elsewhere
    pub async fn export_records(&self) -> Result<RecordExport, ManagerError> {
        Ok(RecordExport::new(self.records.list().await?))
    }

    /// Merge exported records into the store. Existing domains are kept
    /// unless `replace` is set. Nothing is deployed; run update afterwards.
    pub async fn import_records(&self, export: RecordExport, replace: bool) -> Result<ImportReport, ManagerError> {
        let mut report = ImportReport::default();
        for record in export.into_records() {
            let domain = record.domain.clone();
            match self.import_record(record, replace).await {
                Ok(true) => report.imported.push(domain),
                Ok(false) => report.skipped.push(domain),
                Err(e) => {
                    warn!("Could not import {}: {}", domain, e);
                    report.failed.push((domain, e.to_string()));
                }
            }
        }
        info!(
            "Imported {} record(s), skipped {}, failed {}",
            report.imported.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn import_record(&self, mut record: ApplicationRecord, replace: bool) -> Result<bool, ManagerError> {
        let domain = record.domain.clone();
        let _lock = self.locks.try_acquire(&domain)?;
        validate_domain(&domain)?;
        validate_branch(&record.branch)?;
        validate_env(&record.env_vars)?;
        SourceLocator::parse(&record.source)?;
        if !replace && self.records.get(&domain).await?.is_some() {
            return Ok(false);
        }
        let _lease = self
            .ports
            .reserve(record.port, &domain, self.records.as_ref(), false)
            .await?;
        if record.working_dir.as_os_str().is_empty() {
            record.working_dir = self.paths.app_dir(&domain).path().to_path_buf();
        }
        self.records.upsert(&record).await?;
        Ok(true)
    }
}

/// Canonical directory of a local source, served without copying
async fn local_source_dir(path: &std::path::Path) -> Result<Dir, ManagerError> {
    let unavailable = || ManagerError::SourceUnavailable {
        attempts: vec![format!("local:{}", path.display())],
    };
    let resolved = tokio::fs::canonicalize(path).await.map_err(|_| unavailable())?;
    let dir = Dir::new(resolved);
    if !dir.exists().await {
        return Err(unavailable());
    }
    Ok(dir)
}

/// Whether something accepts connections on the loopback port
pub async fn port_accepts_connections(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

fn describe_source(source: &ResolvedSource) -> String {
    match (&source.branch, &source.commit) {
        (Some(branch), Some(commit)) => format!("{} {}@{}", source.protocol, branch, commit),
        (Some(branch), None) => format!("{} {}", source.protocol, branch),
        _ => source.protocol.to_string(),
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
