//! Health checks for the host and for single applications

use serde::Serialize;

use crate::cmd::CommandSpec;
use crate::deploy::orchestrator::{port_accepts_connections, Orchestrator};
use crate::errors::ManagerError;
use crate::models::app::RunState;
use crate::services::maintenance::pages_installed;
use crate::services::systemd::SystemdService;

/// Commands the manager shells out to
pub const PREREQUISITES: [&str; 6] = ["nginx", "systemctl", "git", "node", "npm", "python3"];

/// Result of one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub check: String,
    pub ok: bool,
    pub detail: String,

    /// Suggested follow-up when the check failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Finding {
    fn pass(check: &str, detail: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            ok: true,
            detail: detail.into(),
            hint: None,
        }
    }

    fn fail(check: &str, detail: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            ok: false,
            detail: detail.into(),
            hint: Some(hint.into()),
        }
    }
}

/// Host checks without a domain, application checks with one
pub async fn diagnose(orchestrator: &Orchestrator, domain: Option<&str>) -> Result<Vec<Finding>, ManagerError> {
    match domain {
        Some(domain) => diagnose_app(orchestrator, domain).await,
        None => diagnose_host(orchestrator).await,
    }
}

async fn diagnose_host(orchestrator: &Orchestrator) -> Result<Vec<Finding>, ManagerError> {
    let mut findings = Vec::new();

    for command in PREREQUISITES {
        let spec = CommandSpec::new(format!("command -v {}", command)).unchecked();
        let output = orchestrator.runner().run(&spec).await?;
        findings.push(if output.success() {
            Finding::pass(command, output.stdout.trim())
        } else {
            Finding::fail(command, "not found on PATH", format!("install {}", command))
        });
    }

    findings.push(nginx_finding(orchestrator).await?);

    let paths = orchestrator.paths();
    findings.push(if pages_installed(paths).await {
        Finding::pass("maintenance pages", paths.maintenance_dir.display().to_string())
    } else {
        Finding::fail(
            "maintenance pages",
            format!("missing in {}", paths.maintenance_dir.display()),
            "run `webmgr setup`",
        )
    });

    let records = orchestrator.records().list().await?;
    findings.push(Finding::pass("applications", format!("{} managed", records.len())));

    Ok(findings)
}

async fn diagnose_app(orchestrator: &Orchestrator, domain: &str) -> Result<Vec<Finding>, ManagerError> {
    let record = orchestrator
        .records()
        .get(domain)
        .await?
        .ok_or_else(|| ManagerError::NotFound(format!("no application named {}", domain)))?;
    let nginx = orchestrator.nginx();
    let mut findings = Vec::new();

    if record.app_type.has_process() {
        let state = orchestrator.systemd().status(domain).await?;
        findings.push(match state {
            RunState::Active => Finding::pass("unit", state.to_string()),
            _ => Finding::fail(
                "unit",
                format!("{} is {}", SystemdService::unit_name(domain), state),
                format!("check `webmgr logs --domain {}` then `webmgr restart --domain {}`", domain, domain),
            ),
        });

        findings.push(if port_accepts_connections(record.port).await {
            Finding::pass("port", format!("127.0.0.1:{} accepts connections", record.port))
        } else {
            Finding::fail(
                "port",
                format!("nothing listens on 127.0.0.1:{}", record.port),
                "make sure the application binds the PORT it is given",
            )
        });
    }

    findings.push(if nginx.is_installed(domain).await && nginx.is_enabled(domain).await {
        Finding::pass("site", orchestrator.paths().site_file(domain).path().display().to_string())
    } else {
        Finding::fail(
            "site",
            "site file missing or not enabled",
            format!("run `webmgr update --domain {}`", domain),
        )
    });

    findings.push(nginx_finding(orchestrator).await?);

    findings.push(if nginx.is_in_maintenance(domain).await? {
        Finding::fail(
            "maintenance routing",
            "maintenance mode is on",
            format!("run `webmgr maintenance --domain {} --disable`", domain),
        )
    } else if nginx.has_maintenance_routing(domain).await? {
        Finding::pass("maintenance routing", "error pages routed")
    } else {
        Finding::fail(
            "maintenance routing",
            "site predates maintenance error pages",
            "run `webmgr apply-maintenance`",
        )
    });

    Ok(findings)
}

async fn nginx_finding(orchestrator: &Orchestrator) -> Result<Finding, ManagerError> {
    let test = orchestrator.nginx().test().await?;
    Ok(if test.ok {
        Finding::pass("nginx config", "syntax ok")
    } else {
        Finding::fail("nginx config", test.output, "fix the reported file and run `nginx -t`")
    })
}
