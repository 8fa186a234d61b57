//! Host filesystem layout

use std::path::{Path, PathBuf};

use crate::errors::ManagerError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Every host path the manager reads or writes.
///
/// Production code uses [`SystemPaths::default`]; tests build an isolated
/// instance with [`SystemPaths::under`].
#[derive(Debug, Clone)]
pub struct SystemPaths {
    /// Managed application directories
    pub apps_dir: PathBuf,

    /// nginx `sites-available`
    pub nginx_sites: PathBuf,

    /// nginx `sites-enabled`
    pub nginx_enabled: PathBuf,

    /// systemd unit directory
    pub systemd_dir: PathBuf,

    /// Application and manager logs
    pub log_dir: PathBuf,

    /// Manager state: records, settings, unit environment files
    pub state_dir: PathBuf,

    /// Backup snapshots
    pub backup_dir: PathBuf,

    /// Shared maintenance pages served by nginx
    pub maintenance_dir: PathBuf,

    /// certbot configuration and certificates
    pub letsencrypt_dir: PathBuf,
}

impl SystemPaths {
    /// Layout rooted at `root`, mirroring the production tree
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let defaults = Self::default();
        let rebase = |p: &Path| root.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            apps_dir: rebase(&defaults.apps_dir),
            nginx_sites: rebase(&defaults.nginx_sites),
            nginx_enabled: rebase(&defaults.nginx_enabled),
            systemd_dir: rebase(&defaults.systemd_dir),
            log_dir: rebase(&defaults.log_dir),
            state_dir: rebase(&defaults.state_dir),
            backup_dir: rebase(&defaults.backup_dir),
            maintenance_dir: rebase(&defaults.maintenance_dir),
            letsencrypt_dir: rebase(&defaults.letsencrypt_dir),
        }
    }

    /// Directory certbot keeps the current certificate of a domain in
    pub fn cert_dir(&self, domain: &str) -> PathBuf {
        self.letsencrypt_dir.join("live").join(domain)
    }

    /// Managed directory of an application
    pub fn app_dir(&self, domain: &str) -> Dir {
        Dir::new(self.apps_dir.join(domain))
    }

    /// Scratch directory an attempt builds in before promotion
    pub fn staging_dir(&self, domain: &str) -> Dir {
        Dir::new(self.apps_dir.join(format!(".{}.staging", domain)))
    }

    /// Where the live directory is parked while a promotion swaps it out
    pub fn retired_dir(&self, domain: &str) -> Dir {
        Dir::new(self.apps_dir.join(format!(".{}.retired", domain)))
    }

    /// nginx site file
    pub fn site_file(&self, domain: &str) -> File {
        File::new(self.nginx_sites.join(domain))
    }

    /// nginx `sites-enabled` symlink
    pub fn site_link(&self, domain: &str) -> PathBuf {
        self.nginx_enabled.join(domain)
    }

    /// systemd unit file
    pub fn unit_file(&self, domain: &str) -> File {
        File::new(self.systemd_dir.join(format!("{}.service", domain)))
    }

    /// Environment file referenced by the unit
    pub fn env_file(&self, domain: &str) -> File {
        File::new(self.state_dir.join("env").join(format!("{}.env", domain)))
    }

    /// Application records document
    pub fn records_file(&self) -> File {
        File::new(self.state_dir.join("apps.json"))
    }

    /// Manager settings
    pub fn settings_file(&self) -> File {
        File::new(self.state_dir.join("settings.json"))
    }

    pub fn maintenance_page(&self, name: &str) -> File {
        File::new(self.maintenance_dir.join(name))
    }

    pub fn access_log(&self, domain: &str) -> PathBuf {
        self.log_dir.join(format!("{}-access.log", domain))
    }

    pub fn error_log(&self, domain: &str) -> PathBuf {
        self.log_dir.join(format!("{}-error.log", domain))
    }

    /// Every artifact a snapshot of `domain` captures
    pub fn artifacts(&self, domain: &str) -> Vec<PathBuf> {
        vec![
            self.app_dir(domain).path().to_path_buf(),
            self.site_file(domain).path().to_path_buf(),
            self.site_link(domain),
            self.unit_file(domain).path().to_path_buf(),
            self.env_file(domain).path().to_path_buf(),
        ]
    }

    /// Create every directory of the layout
    pub async fn setup(&self) -> Result<(), ManagerError> {
        for dir in [
            &self.apps_dir,
            &self.nginx_sites,
            &self.nginx_enabled,
            &self.systemd_dir,
            &self.log_dir,
            &self.state_dir,
            &self.backup_dir,
            &self.maintenance_dir,
        ] {
            Dir::new(dir).create().await?;
        }
        Dir::new(self.state_dir.join("env")).create().await?;
        Ok(())
    }
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            apps_dir: PathBuf::from("/var/www/apps"),
            nginx_sites: PathBuf::from("/etc/nginx/sites-available"),
            nginx_enabled: PathBuf::from("/etc/nginx/sites-enabled"),
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            log_dir: PathBuf::from("/var/log/apps"),
            state_dir: PathBuf::from("/etc/webapp-manager"),
            backup_dir: PathBuf::from("/var/backups/webapp-manager"),
            maintenance_dir: PathBuf::from("/var/www/maintenance"),
            letsencrypt_dir: PathBuf::from("/etc/letsencrypt"),
        }
    }
}
