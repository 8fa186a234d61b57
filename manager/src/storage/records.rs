//! Persistent application records

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::ManagerError;
use crate::filesys::file::File;
use crate::models::app::ApplicationRecord;

/// Storage for [`ApplicationRecord`]s keyed by domain
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, domain: &str) -> Result<Option<ApplicationRecord>, ManagerError>;

    /// Insert or replace the record for its domain
    async fn upsert(&self, record: &ApplicationRecord) -> Result<(), ManagerError>;

    /// Delete a record, returning whether it existed
    async fn delete(&self, domain: &str) -> Result<bool, ManagerError>;

    /// All records ordered by domain
    async fn list(&self) -> Result<Vec<ApplicationRecord>, ManagerError>;
}

/// The records document. Unknown top-level keys are carried through untouched.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordsDocument {
    #[serde(default)]
    apps: BTreeMap<String, ApplicationRecord>,

    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Portable copy of the record set.
///
/// Shaped like the records document, so a plain copy of `apps.json` imports too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordExport {
    #[serde(default = "Utc::now")]
    pub exported_at: DateTime<Utc>,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub apps: BTreeMap<String, ApplicationRecord>,
}

impl RecordExport {
    pub fn new(records: Vec<ApplicationRecord>) -> Self {
        Self {
            exported_at: Utc::now(),
            version: crate::utils::version_info().version,
            apps: records.into_iter().map(|r| (r.domain.clone(), r)).collect(),
        }
    }

    /// Records ordered by domain; a record without a domain takes its key
    pub fn into_records(self) -> Vec<ApplicationRecord> {
        self.apps
            .into_iter()
            .map(|(domain, mut record)| {
                if record.domain.is_empty() {
                    record.domain = domain;
                }
                record
            })
            .collect()
    }
}

/// Records kept in a single JSON document, rewritten atomically
pub struct JsonRecordStore {
    file: File,
    apps_dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonRecordStore {
    pub fn new(file: File, apps_dir: impl Into<PathBuf>) -> Self {
        Self {
            file,
            apps_dir: apps_dir.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<RecordsDocument, ManagerError> {
        let Some(contents) = self.file.read_optional().await? else {
            debug!("No records file at {}", self.file.path().display());
            return Ok(RecordsDocument::default());
        };
        if contents.trim().is_empty() {
            return Ok(RecordsDocument::default());
        }

        let mut doc: RecordsDocument = serde_json::from_str(&contents)?;
        for (domain, record) in doc.apps.iter_mut() {
            if record.domain.is_empty() {
                record.domain = domain.clone();
            }
            if record.working_dir.as_os_str().is_empty() {
                record.working_dir = self.apps_dir.join(domain);
            }
        }
        Ok(doc)
    }

    async fn save(&self, doc: &RecordsDocument) -> Result<(), ManagerError> {
        self.file.write_json(doc).await
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn get(&self, domain: &str) -> Result<Option<ApplicationRecord>, ManagerError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.apps.remove(domain))
    }

    async fn upsert(&self, record: &ApplicationRecord) -> Result<(), ManagerError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        doc.apps.insert(record.domain.clone(), record.clone());
        self.save(&doc).await
    }

    async fn delete(&self, domain: &str) -> Result<bool, ManagerError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let existed = doc.apps.remove(domain).is_some();
        if existed {
            self.save(&doc).await?;
        }
        Ok(existed)
    }

    async fn list(&self) -> Result<Vec<ApplicationRecord>, ManagerError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.apps.into_values().collect())
    }
}
