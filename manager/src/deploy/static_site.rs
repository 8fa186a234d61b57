//! Static site deployer

use std::collections::BTreeMap;

use tracing::info;

use crate::deploy::deployer::{build_error, npm_install_command, BuildResult, BuildRunner};
use crate::errors::{BuildStage, ManagerError};
use crate::filesys::dir::Dir;
use crate::models::app::ApplicationRecord;

/// Where a built site usually ends up, in lookup order
const OUTPUT_DIRS: [&str; 4] = ["dist", "build", "out", "public"];

pub struct StaticDeployer {
    build: BuildRunner,
}

impl StaticDeployer {
    pub fn new(build: BuildRunner) -> Self {
        Self { build }
    }

    pub async fn prepare(&self, dir: &Dir, record: &ApplicationRecord) -> Result<BuildResult, ManagerError> {
        if let Some(build) = &record.build_command {
            if dir.file("package.json").exists().await {
                let install = npm_install_command(dir, false).await;
                self.build.run(BuildStage::Dependency, dir, &install).await?;
            }
            self.build.run(BuildStage::Build, dir, build).await?;
        }

        let root = document_subdir(dir)
            .await
            .ok_or_else(|| build_error("index.html not found in the site root or in dist/, build/, out/, public/"))?;
        let document_root = match root {
            Some(sub) => record.working_dir.join(sub),
            None => record.working_dir.clone(),
        };
        info!("Serving {} from {}", record.domain, document_root.display());

        Ok(BuildResult {
            start_command: None,
            document_root: Some(document_root),
            environment: BTreeMap::new(),
        })
    }
}

/// `Some(None)` for the root itself, `Some(Some(sub))` for an output directory
async fn document_subdir(dir: &Dir) -> Option<Option<&'static str>> {
    if dir.file("index.html").exists().await {
        return Some(None);
    }
    for sub in OUTPUT_DIRS {
        if dir.subdir(sub).file("index.html").exists().await {
            return Some(Some(sub));
        }
    }
    None
}
