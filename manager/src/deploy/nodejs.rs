//! Node.js deployer

use std::collections::BTreeMap;

use crate::deploy::deployer::{build_error, npm_install_command, BuildResult, BuildRunner, PackageManifest};
use crate::errors::{BuildStage, ManagerError};
use crate::filesys::dir::Dir;
use crate::models::app::ApplicationRecord;

const ENTRY_POINTS: [&str; 3] = ["server.js", "index.js", "app.js"];

pub struct NodeJsDeployer {
    build: BuildRunner,
}

impl NodeJsDeployer {
    pub fn new(build: BuildRunner) -> Self {
        Self { build }
    }

    pub async fn prepare(&self, dir: &Dir, record: &ApplicationRecord) -> Result<BuildResult, ManagerError> {
        let manifest = PackageManifest::load(dir).await?;

        if let Some(manifest) = &manifest {
            let builds = record.build_command.is_some() || manifest.has_script("build");
            let install = npm_install_command(dir, !builds).await;
            self.build.run(BuildStage::Dependency, dir, &install).await?;
        }

        match (&record.build_command, &manifest) {
            (Some(build), _) => {
                self.build.run(BuildStage::Build, dir, build).await?;
            }
            (None, Some(manifest)) if manifest.has_script("build") => {
                self.build.run(BuildStage::Build, dir, "npm run build").await?;
            }
            _ => {}
        }

        let start_command = match &record.start_command {
            Some(custom) => custom.clone(),
            None => default_start(dir, manifest.as_ref()).await?,
        };

        let environment = BTreeMap::from([
            ("NODE_ENV".to_string(), "production".to_string()),
            ("HOST".to_string(), "127.0.0.1".to_string()),
        ]);

        Ok(BuildResult {
            start_command: Some(start_command),
            document_root: None,
            environment,
        })
    }
}

async fn default_start(dir: &Dir, manifest: Option<&PackageManifest>) -> Result<String, ManagerError> {
    if manifest.is_some_and(|m| m.has_script("start")) {
        return Ok("npm start".to_string());
    }

    let declared = manifest.and_then(|m| m.main.clone());
    for entry in declared.iter().map(String::as_str).chain(ENTRY_POINTS) {
        if dir.file(entry).exists().await {
            return Ok(format!("node {}", entry));
        }
    }

    Err(build_error(
        "no start script and no entry point (server.js, index.js, app.js); set a start command",
    ))
}
