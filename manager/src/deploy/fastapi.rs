//! FastAPI deployer

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};

use crate::deploy::deployer::{env_error, BuildResult, BuildRunner};
use crate::errors::{BuildStage, ManagerError};
use crate::filesys::dir::Dir;
use crate::models::app::ApplicationRecord;

const VENV_DIR: &str = ".venv";
const VENV_PYTHON: &str = ".venv/bin/python";
const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub struct FastApiDeployer {
    build: BuildRunner,
}

impl FastApiDeployer {
    pub fn new(build: BuildRunner) -> Self {
        Self { build }
    }

    pub fn default_start(module: &str, port: u16) -> String {
        format!("{} -m uvicorn {}:app --host 127.0.0.1 --port {}", VENV_PYTHON, module, port)
    }

    pub async fn prepare(&self, dir: &Dir, record: &ApplicationRecord) -> Result<BuildResult, ManagerError> {
        // Reused across updates; pip runs through the interpreter so a stale
        // script shebang never matters while building
        if dir.file(VENV_PYTHON).exists().await {
            debug!("Reusing virtualenv in {}", dir.path().display());
        } else {
            self.build.run(BuildStage::Env, dir, "python3 -m venv .venv").await?;
        }

        self.build
            .run_best_effort(dir, &format!("{} -m pip install --upgrade pip", VENV_PYTHON))
            .await;

        let install = if dir.file("requirements.txt").exists().await {
            format!("{} -m pip install -r requirements.txt", VENV_PYTHON)
        } else {
            info!("No requirements.txt, installing fastapi and uvicorn");
            format!("{} -m pip install fastapi 'uvicorn[standard]'", VENV_PYTHON)
        };
        self.build.run(BuildStage::Dependency, dir, &install).await?;

        if let Some(build) = &record.build_command {
            self.build.run(BuildStage::Build, dir, build).await?;
        }

        let start_command = match &record.start_command {
            Some(custom) => custom.clone(),
            None => Self::default_start(&app_module(dir).await?, record.port),
        };

        let mut environment = BTreeMap::from([
            ("HOST".to_string(), "127.0.0.1".to_string()),
            ("ENVIRONMENT".to_string(), "production".to_string()),
            ("PYTHONPATH".to_string(), record.working_dir.display().to_string()),
            (
                "PATH".to_string(),
                format!("{}/{}/bin:{}", record.working_dir.display(), VENV_DIR, SYSTEM_PATH),
            ),
        ]);
        if let Some(contents) = dir.file(".env").read_optional().await? {
            let loaded = parse_dotenv(&contents);
            debug!("Loaded {} variable(s) from .env", loaded.len());
            environment.extend(loaded);
        }

        Ok(BuildResult {
            start_command: Some(start_command),
            document_root: None,
            environment,
        })
    }
}

/// Rewrite the absolute paths a virtualenv built under `built_in` recorded
/// (script shebangs, activate scripts, `pyvenv.cfg`) to point into `live`.
///
/// Returns how many files were rewritten.
pub async fn relocate_venv(built_in: &Path, live: &Dir) -> Result<usize, ManagerError> {
    let from = built_in.join(VENV_DIR).display().to_string();
    let to = live.path().join(VENV_DIR).display().to_string();
    let venv = live.subdir(VENV_DIR);
    let bin = venv.subdir("bin");
    if from == to || !bin.exists().await {
        return Ok(0);
    }

    let mut candidates = vec![venv.path().join("pyvenv.cfg")];
    let mut entries = tokio::fs::read_dir(bin.path()).await?;
    while let Some(entry) = entries.next_entry().await? {
        // Interpreter symlinks point outside the venv
        if entry.file_type().await?.is_file() {
            candidates.push(entry.path());
        }
    }

    let mut rewritten = 0;
    for path in candidates {
        let Ok(bytes) = tokio::fs::read(&path).await else {
            continue;
        };
        let Ok(text) = String::from_utf8(bytes) else {
            continue;
        };
        if text.contains(&from) {
            // Plain write keeps the executable bit
            tokio::fs::write(&path, text.replace(&from, &to)).await?;
            rewritten += 1;
        }
    }
    debug!("Relocated {} virtualenv file(s) from {} to {}", rewritten, from, to);
    Ok(rewritten)
}

/// Python module holding the `app` object
async fn app_module(dir: &Dir) -> Result<String, ManagerError> {
    if dir.file("main.py").exists().await {
        Ok("main".to_string())
    } else if dir.file("app/main.py").exists().await {
        Ok("app.main".to_string())
    } else {
        Err(env_error("neither main.py nor app/main.py found; set a start command"))
    }
}

/// `KEY=VALUE` lines; comments, blanks and `export ` prefixes are tolerated
pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let unquoted = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        vars.insert(key.trim().to_string(), unquoted.to_string());
    }
    vars
}
