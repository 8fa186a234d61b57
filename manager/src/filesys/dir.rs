//! Directory operations

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::fs;

use crate::errors::ManagerError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Check that the directory exists and has at least one entry
    pub async fn is_populated(&self) -> bool {
        match fs::read_dir(&self.path).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
            Err(_) => false,
        }
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), ManagerError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), ManagerError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// List subdirectories
    pub async fn list_dirs(&self) -> Result<Vec<PathBuf>, ManagerError> {
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }

        dirs.sort();
        Ok(dirs)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Recursively copy the contents into `dest`. Symlinks are copied as links.
    pub async fn copy_to(&self, dest: &Path) -> Result<(), ManagerError> {
        copy_tree(self.path.clone(), dest.to_path_buf()).await
    }

    /// Move the directory to `dest`, replacing anything already there
    pub async fn rename_to(&self, dest: &Path) -> Result<Dir, ManagerError> {
        remove_path(dest).await?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&self.path, dest).await?;
        Ok(Dir::new(dest))
    }
}

fn copy_tree(
    src: PathBuf,
    dst: PathBuf,
) -> Pin<Box<dyn Future<Output = Result<(), ManagerError>> + Send>> {
    Box::pin(async move {
        fs::create_dir_all(&dst).await?;
        let mut entries = fs::read_dir(&src).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = dst.join(entry.file_name());
            if file_type.is_dir() {
                copy_tree(entry.path(), target).await?;
            } else if file_type.is_symlink() {
                let link = fs::read_link(entry.path()).await?;
                #[cfg(unix)]
                fs::symlink(&link, &target).await?;
                #[cfg(not(unix))]
                {
                    let _ = link;
                    fs::copy(entry.path(), &target).await?;
                }
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }

        Ok(())
    })
}

/// Remove whatever lives at `path` (file, symlink or directory tree)
pub async fn remove_path(path: &Path) -> Result<(), ManagerError> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await?,
        Ok(_) => fs::remove_file(path).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
