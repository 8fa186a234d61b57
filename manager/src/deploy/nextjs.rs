//! Next.js deployer

use std::collections::BTreeMap;

use crate::deploy::deployer::{build_error, env_error, npm_install_command, BuildResult, BuildRunner, PackageManifest};
use crate::errors::{BuildStage, ManagerError};
use crate::filesys::dir::Dir;
use crate::models::app::ApplicationRecord;

pub struct NextJsDeployer {
    build: BuildRunner,
}

impl NextJsDeployer {
    pub fn new(build: BuildRunner) -> Self {
        Self { build }
    }

    pub fn default_start(port: u16) -> String {
        format!("./node_modules/.bin/next start --port {}", port)
    }

    pub async fn prepare(&self, dir: &Dir, record: &ApplicationRecord) -> Result<BuildResult, ManagerError> {
        if PackageManifest::load(dir).await?.is_none() {
            return Err(env_error("package.json not found; not a Next.js project"));
        }

        // The build needs devDependencies (typescript, tailwind, ...)
        let install = npm_install_command(dir, false).await;
        self.build.run(BuildStage::Dependency, dir, &install).await?;

        let build = record.build_command.as_deref().unwrap_or("npm run build");
        self.build.run(BuildStage::Build, dir, build).await?;

        if !dir.subdir(".next").exists().await {
            return Err(build_error("build finished but produced no .next directory"));
        }

        let environment = BTreeMap::from([
            ("NODE_ENV".to_string(), "production".to_string()),
            ("HOSTNAME".to_string(), "127.0.0.1".to_string()),
            ("NEXT_TELEMETRY_DISABLED".to_string(), "1".to_string()),
        ]);

        Ok(BuildResult {
            start_command: Some(
                record
                    .start_command
                    .clone()
                    .unwrap_or_else(|| Self::default_start(record.port)),
            ),
            document_root: None,
            environment,
        })
    }
}
