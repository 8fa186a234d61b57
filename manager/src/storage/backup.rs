//! Backup snapshots of an application's host artifacts

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::errors::ManagerError;
use crate::filesys::dir::{remove_path, Dir};
use crate::filesys::file::File;
use crate::storage::settings::RetentionPolicy;

/// Reference to a stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHandle {
    pub id: String,
    pub label: String,
    pub created: DateTime<Utc>,
    pub dir: PathBuf,
}

/// Snapshot storage consumed by the orchestrator
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Capture the current state of `paths`, including which ones are absent
    async fn create(&self, label: &str, paths: &[PathBuf]) -> Result<BackupHandle, ManagerError>;

    /// Return every captured path to its captured state
    async fn restore(&self, handle: &BackupHandle) -> Result<(), ManagerError>;

    /// Delete snapshots of `label` the policy no longer keeps; returns how many went
    async fn prune(&self, label: &str, policy: &RetentionPolicy) -> Result<usize, ManagerError>;

    /// Snapshots of `label`, newest first
    async fn list(&self, label: &str) -> Result<Vec<BackupHandle>, ManagerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    File,
    Dir,
    Symlink,
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    original: PathBuf,
    kind: EntryKind,
    #[serde(default)]
    stored: Option<String>,
    #[serde(default)]
    link_target: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    id: String,
    label: String,
    created: DateTime<Utc>,
    entries: Vec<ManifestEntry>,
}

const MANIFEST: &str = "manifest.json";

/// Snapshots stored as directory copies under `<root>/<label>/<id>/`
#[derive(Debug, Clone)]
pub struct DirBackupStore {
    root: Dir,
}

impl DirBackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Dir::new(root.into()),
        }
    }

    async fn read_manifest(&self, dir: &Path) -> Result<Manifest, ManagerError> {
        File::new(dir.join(MANIFEST)).read_json().await
    }
}

#[async_trait]
impl BackupStore for DirBackupStore {
    async fn create(&self, label: &str, paths: &[PathBuf]) -> Result<BackupHandle, ManagerError> {
        let created = Utc::now();
        let short = crate::utils::generate_uuid();
        let id = format!("{}-{}", created.format("%Y%m%dT%H%M%S%3fZ"), &short[..8]);
        let dir = self.root.subdir(label).subdir(&id);
        let items = dir.subdir("items");
        items.create().await?;

        let mut entries = Vec::with_capacity(paths.len());
        for (index, path) in paths.iter().enumerate() {
            let stored = index.to_string();
            let entry = match fs::symlink_metadata(path).await {
                Ok(meta) if meta.file_type().is_symlink() => ManifestEntry {
                    original: path.clone(),
                    kind: EntryKind::Symlink,
                    stored: None,
                    link_target: Some(fs::read_link(path).await?),
                },
                Ok(meta) if meta.is_dir() => {
                    Dir::new(path).copy_to(&items.path().join(&stored)).await?;
                    ManifestEntry {
                        original: path.clone(),
                        kind: EntryKind::Dir,
                        stored: Some(stored),
                        link_target: None,
                    }
                }
                Ok(_) => {
                    File::new(path).copy_to(&items.path().join(&stored)).await?;
                    ManifestEntry {
                        original: path.clone(),
                        kind: EntryKind::File,
                        stored: Some(stored),
                        link_target: None,
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => ManifestEntry {
                    original: path.clone(),
                    kind: EntryKind::Absent,
                    stored: None,
                    link_target: None,
                },
                Err(e) => return Err(e.into()),
            };
            entries.push(entry);
        }

        let manifest = Manifest {
            id: id.clone(),
            label: label.to_string(),
            created,
            entries,
        };
        dir.file(MANIFEST).write_json(&manifest).await?;
        info!("Created backup {} for {}", id, label);

        Ok(BackupHandle {
            id,
            label: label.to_string(),
            created,
            dir: dir.path().to_path_buf(),
        })
    }

    async fn restore(&self, handle: &BackupHandle) -> Result<(), ManagerError> {
        let manifest = self.read_manifest(&handle.dir).await?;
        let items = Dir::new(handle.dir.join("items"));

        for entry in &manifest.entries {
            remove_path(&entry.original).await?;
            match (entry.kind, &entry.stored, &entry.link_target) {
                (EntryKind::Dir, Some(stored), _) => {
                    items.subdir(stored).copy_to(&entry.original).await?;
                }
                (EntryKind::File, Some(stored), _) => {
                    items.file(stored).copy_to(&entry.original).await?;
                }
                (EntryKind::Symlink, _, Some(target)) => {
                    File::new(target).link_at(&entry.original).await?;
                }
                (EntryKind::Absent, _, _) => {}
                (kind, _, _) => {
                    return Err(ManagerError::Internal(format!(
                        "Corrupt backup manifest {}: {:?} entry for {} has no data",
                        handle.id,
                        kind,
                        entry.original.display()
                    )));
                }
            }
            debug!("Restored {}", entry.original.display());
        }

        info!("Restored backup {} for {}", handle.id, handle.label);
        Ok(())
    }

    async fn prune(&self, label: &str, policy: &RetentionPolicy) -> Result<usize, ManagerError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(policy.retention_days));
        let mut removed = 0;

        for (index, handle) in self.list(label).await?.into_iter().enumerate() {
            if index >= policy.max_backups_per_app || handle.created < cutoff {
                Dir::new(&handle.dir).delete().await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Pruned {} backup(s) of {}", removed, label);
        }
        Ok(removed)
    }

    async fn list(&self, label: &str) -> Result<Vec<BackupHandle>, ManagerError> {
        let label_dir = self.root.subdir(label);
        if !label_dir.exists().await {
            return Ok(Vec::new());
        }

        let mut handles = Vec::new();
        for dir in label_dir.list_dirs().await? {
            match self.read_manifest(&dir).await {
                Ok(manifest) => handles.push(BackupHandle {
                    id: manifest.id,
                    label: manifest.label,
                    created: manifest.created,
                    dir,
                }),
                Err(e) => warn!("Skipping unreadable backup {}: {}", dir.display(), e),
            }
        }

        handles.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(handles)
    }
}
