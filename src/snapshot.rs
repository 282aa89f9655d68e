//! Offline snapshot of sync state.
//!
//! Persistence is best-effort: the session keeps running when a save or
//! load fails, it just logs and carries on with what it has in memory.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::reconcile::StoredEntity;
use crate::types::{ActivityEntry, ApprovalRequest};

/// Everything worth carrying across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub entities: HashMap<String, StoredEntity>,
    pub activity: Vec<ActivityEntry>,
    pub approvals: Vec<ApprovalRequest>,
    pub saved_at: DateTime<Utc>,
}

impl SyncSnapshot {
    pub fn new(
        entities: HashMap<String, StoredEntity>,
        activity: Vec<ActivityEntry>,
        approvals: Vec<ApprovalRequest>,
    ) -> Self {
        Self {
            entities,
            activity,
            approvals,
            saved_at: Utc::now(),
        }
    }
}

/// Where snapshots go. Implementations must not assume they are called
/// from a single task.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when no snapshot has ever been saved.
    async fn load(&self) -> Result<Option<SyncSnapshot>>;
    async fn save(&self, snapshot: &SyncSnapshot) -> Result<()>;
}

/// JSON file store. Writes stage to a sibling temp file and rename into
/// place so a crash mid-write never corrupts the previous snapshot.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<SyncSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::Snapshot(e.to_string())),
        };
        let snapshot =
            serde_json::from_slice(&bytes).map_err(|e| SyncError::Snapshot(e.to_string()))?;
        debug!(path = %self.path.display(), "Loaded snapshot");
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &SyncSnapshot) -> Result<()> {
        let bytes =
            serde_json::to_vec(snapshot).map_err(|e| SyncError::Snapshot(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SyncError::Snapshot(e.to_string()))?;
            }
        }

        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, &bytes)
            .await
            .map_err(|e| SyncError::Snapshot(e.to_string()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| SyncError::Snapshot(e.to_string()))?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Saved snapshot");
        Ok(())
    }
}

/// Keeps the latest snapshot in memory. Test double for the file store.
#[derive(Default)]
pub struct MemorySnapshotStore {
    latest: Mutex<Option<SyncSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<SyncSnapshot>> {
        Ok(self.latest.lock().await.clone())
    }

    async fn save(&self, snapshot: &SyncSnapshot) -> Result<()> {
        *self.latest.lock().await = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityKind, MutationEvent, MutationOp};

    fn sample_snapshot() -> SyncSnapshot {
        let event = MutationEvent::new(
            MutationOp::Create,
            EntityKind::Expense,
            "exp-1",
            serde_json::json!({"amount": 12.5}),
            "user-1",
            None,
        );
        let mut entities = HashMap::new();
        entities.insert("exp-1".to_string(), StoredEntity::from_event(&event));
        SyncSnapshot::new(entities, vec![ActivityEntry::from_mutation(&event)], vec![])
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("state.json"));

        let saved = sample_snapshot();
        store.save(&saved).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.entities.len(), 1);
        assert_eq!(loaded.activity.len(), 1);
        assert_eq!(loaded.saved_at, saved.saved_at);
        assert!(loaded.entities.contains_key("exp-1"));
    }

    #[tokio::test]
    async fn test_memory_store_keeps_latest() {
        let store = MemorySnapshotStore::new();
        assert!(store.load().await.unwrap().is_none());

        let first = sample_snapshot();
        store.save(&first).await.unwrap();
        let second = sample_snapshot();
        store.save(&second).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.saved_at, second.saved_at);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_snapshot_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let store = FileSnapshotStore::new(path);
        assert!(matches!(
            store.load().await,
            Err(SyncError::Snapshot(_))
        ));
    }

    #[tokio::test]
    async fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("nested/deeper/state.json"));
        store.save(&sample_snapshot()).await.unwrap();
        assert!(store.load().await.unwrap().is_some());
    }
}
