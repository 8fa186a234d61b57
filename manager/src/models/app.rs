//! Application records

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Supported application archetypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Nextjs,
    Fastapi,
    #[serde(alias = "node")]
    Nodejs,
    Static,
}

impl AppType {
    pub const ALL: [AppType; 4] = [AppType::Nextjs, AppType::Fastapi, AppType::Nodejs, AppType::Static];

    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Nextjs => "nextjs",
            AppType::Fastapi => "fastapi",
            AppType::Nodejs => "nodejs",
            AppType::Static => "static",
        }
    }

    /// Human-readable description used by the CLI
    pub fn description(&self) -> &'static str {
        match self {
            AppType::Nextjs => "Next.js application served by `next start` behind nginx",
            AppType::Fastapi => "FastAPI application served by uvicorn in a virtualenv",
            AppType::Nodejs => "Node.js server started with `npm start` or its entry point",
            AppType::Static => "Static files served directly by nginx",
        }
    }

    /// Whether the archetype runs a supervised process
    pub fn has_process(&self) -> bool {
        !matches!(self, AppType::Static)
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nextjs" | "next" => Ok(AppType::Nextjs),
            "fastapi" => Ok(AppType::Fastapi),
            "nodejs" | "node" => Ok(AppType::Nodejs),
            "static" => Ok(AppType::Static),
            _ => Err(format!(
                "Invalid application type: {} (expected nextjs, fastapi, nodejs or static)",
                s
            )),
        }
    }
}

/// Lifecycle status of a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Pending,
    Active,
    Failed,
    Stopped,
    #[default]
    Unknown,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppStatus::Pending => "pending",
            AppStatus::Active => "active",
            AppStatus::Failed => "failed",
            AppStatus::Stopped => "stopped",
            AppStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Run state reported by the supervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Active,
    Activating,
    Inactive,
    Failed,
    #[default]
    Unknown,
}

impl RunState {
    /// Parse the output of `systemctl is-active`
    pub fn from_is_active(output: &str) -> Self {
        match output.trim() {
            "active" | "reloading" => RunState::Active,
            "activating" => RunState::Activating,
            "inactive" | "deactivating" => RunState::Inactive,
            "failed" => RunState::Failed,
            _ => RunState::Unknown,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Active => "active",
            RunState::Activating => "activating",
            RunState::Inactive => "inactive",
            RunState::Failed => "failed",
            RunState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Input of an add workflow
#[derive(Debug, Clone)]
pub struct AppSpec {
    pub domain: String,
    pub app_type: AppType,
    pub source: String,
    pub branch: String,
    pub port: u16,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub env_vars: BTreeMap<String, String>,
}

/// One managed application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RecordDocument")]
pub struct ApplicationRecord {
    /// Unique, immutable key
    pub domain: String,

    /// Immutable archetype
    pub app_type: AppType,

    /// Local path or repository URL
    pub source: String,

    /// Requested branch
    pub branch: String,

    /// Internal port the process listens on
    pub port: u16,

    /// Directory the process runs in (or nginx serves from)
    pub working_dir: PathBuf,

    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub env_vars: BTreeMap<String, String>,

    pub status: AppStatus,

    /// Last known supervisor state
    pub health: RunState,

    /// Branch actually deployed, when it differs from the request
    pub resolved_branch: Option<String>,

    /// Short SHA of the deployed revision
    pub commit: Option<String>,

    /// Directory nginx serves for static sites
    pub document_root: Option<PathBuf>,

    /// A certificate is installed; the site redirects HTTP to HTTPS
    pub ssl: bool,

    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ApplicationRecord {
    /// Build a pending record for a new application
    pub fn new(spec: &AppSpec, working_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            domain: spec.domain.clone(),
            app_type: spec.app_type,
            source: spec.source.clone(),
            branch: spec.branch.clone(),
            port: spec.port,
            working_dir,
            build_command: non_empty(spec.build_command.clone()),
            start_command: non_empty(spec.start_command.clone()),
            env_vars: spec.env_vars.clone(),
            status: AppStatus::Pending,
            health: RunState::Unknown,
            resolved_branch: None,
            commit: None,
            document_root: None,
            ssl: false,
            created: now,
            last_updated: now,
        }
    }

    pub fn url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.domain)
    }

    /// Branch that is actually deployed
    pub fn deployed_branch(&self) -> &str {
        self.resolved_branch.as_deref().unwrap_or(&self.branch)
    }

    pub fn set_status(&mut self, status: AppStatus) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// On-disk shape of a record, including legacy spellings
#[derive(Deserialize)]
struct RecordDocument {
    #[serde(default)]
    domain: String,
    #[serde(alias = "type")]
    app_type: AppType,
    #[serde(default)]
    source: String,
    #[serde(default)]
    branch: Option<String>,
    port: u16,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    build_command: Option<String>,
    #[serde(default)]
    start_command: Option<String>,
    #[serde(default)]
    env_vars: Option<BTreeMap<String, String>>,
    #[serde(default)]
    status: AppStatus,
    #[serde(default)]
    health: RunState,
    #[serde(default)]
    resolved_branch: Option<String>,
    #[serde(default)]
    commit: Option<String>,
    #[serde(default)]
    document_root: Option<PathBuf>,
    #[serde(default)]
    ssl: bool,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    created: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    last_updated: Option<DateTime<Utc>>,
}

impl From<RecordDocument> for ApplicationRecord {
    fn from(doc: RecordDocument) -> Self {
        let created = doc.created.unwrap_or_else(Utc::now);
        Self {
            domain: doc.domain,
            app_type: doc.app_type,
            source: doc.source,
            branch: non_empty(doc.branch).unwrap_or_else(|| "main".to_string()),
            port: doc.port,
            // Filled in by the record store, which knows the apps directory
            working_dir: doc.working_dir.unwrap_or_default(),
            build_command: non_empty(doc.build_command),
            start_command: non_empty(doc.start_command),
            env_vars: doc.env_vars.unwrap_or_default(),
            status: doc.status,
            health: doc.health,
            resolved_branch: non_empty(doc.resolved_branch),
            commit: non_empty(doc.commit),
            document_root: doc.document_root,
            ssl: doc.ssl,
            created,
            last_updated: doc.last_updated.unwrap_or(created),
        }
    }
}

/// Accepts RFC 3339 as well as naive ISO timestamps (taken as UTC)
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(serde::de::Error::custom)
}
