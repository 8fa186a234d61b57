//! Archetype-specific install/build strategies

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::cmd::{CommandOutput, CommandRunner, CommandSpec};
use crate::deploy::fastapi::FastApiDeployer;
use crate::deploy::nextjs::NextJsDeployer;
use crate::deploy::nodejs::NodeJsDeployer;
use crate::deploy::static_site::StaticDeployer;
use crate::errors::{BuildStage, ManagerError};
use crate::filesys::dir::Dir;
use crate::models::app::{AppType, ApplicationRecord};

/// What `prepare` hands back to the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildResult {
    /// Command the supervisor runs; `None` for static sites
    pub start_command: Option<String>,

    /// Directory nginx serves, static sites only
    pub document_root: Option<PathBuf>,

    /// Environment for the unit, before record env vars are applied
    pub environment: BTreeMap<String, String>,
}

/// Closed set of deployment strategies
pub enum AppDeployer {
    NextJs(NextJsDeployer),
    FastApi(FastApiDeployer),
    NodeJs(NodeJsDeployer),
    Static(StaticDeployer),
}

impl AppDeployer {
    pub fn for_type(app_type: AppType, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        let build = BuildRunner { runner, timeout };
        match app_type {
            AppType::Nextjs => AppDeployer::NextJs(NextJsDeployer::new(build)),
            AppType::Fastapi => AppDeployer::FastApi(FastApiDeployer::new(build)),
            AppType::Nodejs => AppDeployer::NodeJs(NodeJsDeployer::new(build)),
            AppType::Static => AppDeployer::Static(StaticDeployer::new(build)),
        }
    }

    /// Install dependencies and build in `source_dir`.
    ///
    /// Paths in the result refer to `record.working_dir`, where the tree
    /// lives once promoted. Running it again over the same tree succeeds and
    /// yields the same start command.
    pub async fn prepare(
        &self,
        source_dir: &Dir,
        record: &ApplicationRecord,
    ) -> Result<BuildResult, ManagerError> {
        info!("Preparing {} ({}) in {}", record.domain, record.app_type, source_dir.path().display());
        let mut result = match self {
            AppDeployer::NextJs(d) => d.prepare(source_dir, record).await?,
            AppDeployer::FastApi(d) => d.prepare(source_dir, record).await?,
            AppDeployer::NodeJs(d) => d.prepare(source_dir, record).await?,
            AppDeployer::Static(d) => d.prepare(source_dir, record).await?,
        };

        if let Some(command) = &result.start_command {
            debug!("Start command for {}: {}", record.domain, command);
        }
        for (key, value) in &record.env_vars {
            result.environment.insert(key.clone(), value.clone());
        }
        result.environment.insert("PORT".to_string(), record.port.to_string());
        Ok(result)
    }

    /// Delete installed dependencies and build output so the next `prepare`
    /// starts from the source alone
    pub async fn clean(&self, dir: &Dir) -> Result<(), ManagerError> {
        let generated: &[&str] = match self {
            AppDeployer::NextJs(_) => &["node_modules", ".next"],
            AppDeployer::NodeJs(_) => &["node_modules"],
            AppDeployer::FastApi(_) => &[".venv"],
            AppDeployer::Static(_) => &[],
        };
        for name in generated {
            debug!("Removing {}/{}", dir.path().display(), name);
            dir.subdir(name).delete().await?;
        }
        Ok(())
    }

    /// Fix up a tree that was built in `built_in` and then moved to `live`
    pub async fn relocate(&self, built_in: &Dir, live: &Dir) -> Result<(), ManagerError> {
        match self {
            AppDeployer::FastApi(_) => {
                crate::deploy::fastapi::relocate_venv(built_in.path(), live).await?;
            }
            AppDeployer::NextJs(_) | AppDeployer::NodeJs(_) | AppDeployer::Static(_) => {}
        }
        Ok(())
    }

    /// Start command without inspecting the tree
    pub fn start_command(&self, record: &ApplicationRecord) -> Option<String> {
        if let Some(custom) = &record.start_command {
            return Some(custom.clone());
        }
        match self {
            AppDeployer::NextJs(_) => Some(NextJsDeployer::default_start(record.port)),
            AppDeployer::FastApi(_) => Some(FastApiDeployer::default_start("main", record.port)),
            AppDeployer::NodeJs(_) => Some("npm start".to_string()),
            AppDeployer::Static(_) => None,
        }
    }
}

/// Runs build commands and maps failures to [`ManagerError::BuildError`]
#[derive(Clone)]
pub struct BuildRunner {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl BuildRunner {
    pub async fn run(&self, stage: BuildStage, dir: &Dir, command: &str) -> Result<CommandOutput, ManagerError> {
        info!("[{}] {}", stage, command);
        let spec = CommandSpec::new(command).cwd(dir.path()).timeout(self.timeout);
        self.runner.run(&spec).await.map_err(|e| match e {
            ManagerError::CommandFailed { command, exit_code, output_tail } => ManagerError::BuildError {
                stage,
                message: format!("`{}` exited with status {}", command, exit_code),
                output_tail,
            },
            other => other,
        })
    }

    /// Run a command whose failure is only logged
    pub async fn run_best_effort(&self, dir: &Dir, command: &str) {
        let spec = CommandSpec::new(command).cwd(dir.path()).timeout(self.timeout).unchecked();
        match self.runner.run(&spec).await {
            Ok(output) if !output.success() => debug!("`{}` failed (ignored): {}", command, output.tail()),
            Err(e) => debug!("`{}` failed (ignored): {}", command, e),
            Ok(_) => {}
        }
    }
}

/// The parts of `package.json` the deployers look at
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,

    #[serde(default)]
    pub dependencies: BTreeMap<String, serde_json::Value>,

    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub main: Option<String>,
}

impl PackageManifest {
    /// Read `package.json` from `dir`; `None` when it does not exist
    pub async fn load(dir: &Dir) -> Result<Option<Self>, ManagerError> {
        let file = dir.file("package.json");
        let Some(contents) = file.read_optional().await? else {
            return Ok(None);
        };
        serde_json::from_str(&contents).map(Some).map_err(|e| ManagerError::BuildError {
            stage: BuildStage::Env,
            message: format!("package.json is not valid JSON: {}", e),
            output_tail: String::new(),
        })
    }

    pub fn has_script(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }

    pub fn depends_on(&self, package: &str) -> bool {
        self.dependencies.contains_key(package) || self.dev_dependencies.contains_key(package)
    }
}

/// `npm ci` when a lockfile pins the tree, `npm install` otherwise
pub async fn npm_install_command(dir: &Dir, production_only: bool) -> String {
    let base = if dir.file("package-lock.json").exists().await {
        "npm ci"
    } else {
        "npm install"
    };
    if production_only {
        format!("{} --omit=dev", base)
    } else {
        format!("{} --include=dev", base)
    }
}

pub fn env_error(message: impl Into<String>) -> ManagerError {
    ManagerError::BuildError {
        stage: BuildStage::Env,
        message: message.into(),
        output_tail: String::new(),
    }
}

pub fn build_error(message: impl Into<String>) -> ManagerError {
    ManagerError::BuildError {
        stage: BuildStage::Build,
        message: message.into(),
        output_tail: String::new(),
    }
}

/// Guess the archetype of a source tree
pub async fn detect_app_type(dir: &Dir) -> Result<Option<AppType>, ManagerError> {
    if let Some(manifest) = PackageManifest::load(dir).await? {
        if manifest.depends_on("next") {
            return Ok(Some(AppType::Nextjs));
        }
        let only_builds = manifest.has_script("build") && !manifest.has_script("start");
        if only_builds && manifest.main.is_none() {
            return Ok(Some(AppType::Static));
        }
        return Ok(Some(AppType::Nodejs));
    }

    for marker in ["requirements.txt", "pyproject.toml", "main.py", "app/main.py"] {
        if dir.file(marker).exists().await {
            return Ok(Some(AppType::Fastapi));
        }
    }

    if dir.file("index.html").exists().await {
        return Ok(Some(AppType::Static));
    }
    Ok(None)
}
