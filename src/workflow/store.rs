//! Checkpoint stores
//!
//! Only the latest checkpoint per session is kept. The file store writes each
//! checkpoint to a temporary file and renames it into place, so a crash
//! mid-write leaves the previous checkpoint intact.

use super::execution::Checkpoint;
use crate::storage::Namespaces;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Checkpoint I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Corrupt checkpoint at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replace the session's checkpoint
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Checkpoints of executions that have not reached a terminal status
    async fn load_active(&self) -> Result<Vec<Checkpoint>, StoreError>;

    async fn remove(&self, session_id: &str) -> Result<(), StoreError>;
}

/// In-process store keyed by namespaced checkpoint keys
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    namespaces: Namespaces,
    checkpoints: DashMap<String, Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new(namespaces: Namespaces) -> Self {
        Self {
            namespaces,
            checkpoints: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.checkpoints.insert(
            self.namespaces.checkpoint_key(&checkpoint.session_id),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .checkpoints
            .get(&self.namespaces.checkpoint_key(session_id))
            .map(|entry| entry.clone()))
    }

    async fn load_active(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let mut active: Vec<Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(active)
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        self.checkpoints
            .remove(&self.namespaces.checkpoint_key(session_id));
        Ok(())
    }
}

/// One JSON file per session under a directory
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    namespaces: Namespaces,
}

impl FileCheckpointStore {
    pub async fn open(dir: impl Into<PathBuf>, namespaces: Namespaces) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir, namespaces })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        let key = self.namespaces.checkpoint_key(session_id);
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }

    async fn read(&self, path: &Path) -> Result<Checkpoint, StoreError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let path = self.path_for(&checkpoint.session_id);
        let tmp = path.with_extension("json.tmp");
        let encoded = serde_json::to_vec_pretty(checkpoint)?;

        fs::write(&tmp, encoded)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        debug!(
            session_id = %checkpoint.session_id,
            revision = checkpoint.revision,
            "Checkpoint written"
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let path = self.path_for(session_id);
        match fs::try_exists(&path).await {
            Ok(true) => self.read(&path).await.map(Some),
            Ok(false) => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn load_active(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let mut active = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(checkpoint) if checkpoint.is_active() => active.push(checkpoint),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable checkpoint"),
            }
        }
        active.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(active)
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(session_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::{WorkflowDefinition, WorkflowStep};
    use crate::workflow::execution::{ExecutionStatus, WorkflowExecution};
    use serde_json::json;

    fn checkpoint(session_id: &str, status: ExecutionStatus) -> Checkpoint {
        let definition = WorkflowDefinition::new("w", vec![WorkflowStep::agent("a", "x")]);
        let mut execution = WorkflowExecution::new(definition, session_id, json!({}));
        execution.set_status(status);
        Checkpoint::new(1, &execution)
    }

    #[tokio::test]
    async fn test_memory_store_latest_wins() {
        let store = MemoryCheckpointStore::default();
        store
            .save(&checkpoint("s1", ExecutionStatus::Running))
            .await
            .unwrap();
        let mut later = checkpoint("s1", ExecutionStatus::Completed);
        later.revision = 2;
        store.save(&later).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.load("s1").await.unwrap().unwrap().revision, 2);
        assert!(store.load_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_active_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path(), Namespaces::default())
            .await
            .unwrap();

        store
            .save(&checkpoint("s1", ExecutionStatus::Running))
            .await
            .unwrap();
        store
            .save(&checkpoint("s2", ExecutionStatus::Failed))
            .await
            .unwrap();

        let active = store.load_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "s1");

        store.remove("s1").await.unwrap();
        store.remove("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path(), Namespaces::default())
            .await
            .unwrap();
        store
            .save(&checkpoint("good", ExecutionStatus::Paused))
            .await
            .unwrap();
        std::fs::write(dir.path().join("garbage.json"), "{not json").unwrap();

        let active = store.load_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert!(matches!(
            store.read(&dir.path().join("garbage.json")).await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
