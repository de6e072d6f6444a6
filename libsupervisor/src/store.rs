use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::{UserWorkerSpec, UsersDocument};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;

/// Persistence collaborator holding the durable user records.
///
/// The supervisor never caches records: every status transition re-reads the
/// record before writing it back.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn read_record(&self, user_id: &str) -> Result<UserWorkerSpec, StoreError>;

    /// Insert or replace the record with the same id.
    async fn write_record(&self, spec: &UserWorkerSpec) -> Result<(), StoreError>;

    async fn delete_record(&self, user_id: &str) -> Result<(), StoreError>;

    async fn list_records(&self) -> Result<Vec<UserWorkerSpec>, StoreError>;
}

/// Records kept in a single `users.json` document.
pub struct JsonFileStore {
    path: PathBuf,
    // serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<UsersDocument, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(UsersDocument::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UsersDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a sibling temp file and rename, so readers (including
    /// the worker scripts) never observe a half-written document.
    async fn save(&self, doc: &UsersDocument) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(doc)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), users = doc.users.len(), "users file saved");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn read_record(&self, user_id: &str) -> Result<UserWorkerSpec, StoreError> {
        let _guard = self.lock.lock().await;
        self.load()
            .await?
            .users
            .into_iter()
            .find(|u| u.id == user_id)
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))
    }

    async fn write_record(&self, spec: &UserWorkerSpec) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        match doc.users.iter_mut().find(|u| u.id == spec.id) {
            Some(existing) => *existing = spec.clone(),
            None => doc.users.push(spec.clone()),
        }
        self.save(&doc).await
    }

    async fn delete_record(&self, user_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let before = doc.users.len();
        doc.users.retain(|u| u.id != user_id);
        if doc.users.len() == before {
            return Err(StoreError::NotFound(user_id.to_string()));
        }
        self.save(&doc).await
    }

    async fn list_records(&self) -> Result<Vec<UserWorkerSpec>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.users)
    }
}

/// In-process store, used when the records live elsewhere or in tests.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, UserWorkerSpec>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = UserWorkerSpec>) -> Self {
        MemoryStore {
            records: Mutex::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn read_record(&self, user_id: &str) -> Result<UserWorkerSpec, StoreError> {
        self.records
            .lock()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))
    }

    async fn write_record(&self, spec: &UserWorkerSpec) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .insert(spec.id.clone(), spec.clone());
        Ok(())
    }

    async fn delete_record(&self, user_id: &str) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .remove(user_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(user_id.to_string()))
    }

    async fn list_records(&self) -> Result<Vec<UserWorkerSpec>, StoreError> {
        let mut records: Vec<_> = self.records.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}
