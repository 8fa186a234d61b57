//! Built-in maintenance pages served by nginx

use std::path::PathBuf;

use tracing::info;

use crate::errors::ManagerError;
use crate::storage::layout::SystemPaths;

/// The fixed set of pages under the maintenance directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenancePage {
    /// Planned downtime; also the target of `error_page 500`
    Maintenance,

    /// Backend unreachable; target of `error_page 502 503 504`
    BadGateway,

    /// Shown while an update or restart switches processes
    Updating,
}

impl MaintenancePage {
    pub const ALL: [MaintenancePage; 3] = [
        MaintenancePage::Maintenance,
        MaintenancePage::BadGateway,
        MaintenancePage::Updating,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            MaintenancePage::Maintenance => "maintenance.html",
            MaintenancePage::BadGateway => "error502.html",
            MaintenancePage::Updating => "updating.html",
        }
    }

    pub fn html(&self) -> String {
        let (title, message, refresh) = match self {
            MaintenancePage::Maintenance => (
                "Under maintenance",
                "This site is undergoing scheduled maintenance. Please check back shortly.",
                60,
            ),
            MaintenancePage::BadGateway => (
                "Service temporarily unavailable",
                "The application is not responding right now. It is probably restarting.",
                15,
            ),
            MaintenancePage::Updating => (
                "Updating",
                "A new version is being deployed. This page refreshes automatically.",
                10,
            ),
        };
        render_page(title, message, refresh)
    }
}

fn render_page(title: &str, message: &str, refresh_secs: u32) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <meta http-equiv="refresh" content="{refresh_secs}">
  <title>{title}</title>
  <style>
    body {{ margin: 0; min-height: 100vh; display: flex; align-items: center; justify-content: center;
           font-family: -apple-system, "Segoe UI", Roboto, sans-serif; background: #f4f5f7; color: #1f2933; }}
    main {{ max-width: 32rem; padding: 2.5rem; background: #fff; border-radius: 12px;
           box-shadow: 0 4px 24px rgba(0, 0, 0, 0.08); text-align: center; }}
    h1 {{ font-size: 1.6rem; margin: 0 0 1rem; }}
    p {{ line-height: 1.5; margin: 0; color: #52606d; }}
  </style>
</head>
<body>
  <main>
    <h1>{title}</h1>
    <p>{message}</p>
  </main>
</body>
</html>
"#
    )
}

/// Write the maintenance pages. Existing pages are kept unless `overwrite` is set,
/// so operators can customize them.
pub async fn install_pages(paths: &SystemPaths, overwrite: bool) -> Result<Vec<PathBuf>, ManagerError> {
    let mut written = Vec::new();
    for page in MaintenancePage::ALL {
        let file = paths.maintenance_page(page.file_name());
        if file.exists().await && !overwrite {
            continue;
        }
        file.write_string(&page.html()).await?;
        written.push(file.path().to_path_buf());
    }
    if !written.is_empty() {
        info!("Installed {} maintenance page(s) in {}", written.len(), paths.maintenance_dir.display());
    }
    Ok(written)
}

/// Whether every page is present
pub async fn pages_installed(paths: &SystemPaths) -> bool {
    for page in MaintenancePage::ALL {
        if !paths.maintenance_page(page.file_name()).exists().await {
            return false;
        }
    }
    true
}
