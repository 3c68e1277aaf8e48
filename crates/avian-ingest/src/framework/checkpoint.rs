//! High-water-mark persistence per source
//!
//! The store enforces monotonicity itself: saving a timestamp older than
//! the stored one leaves the stored value in place. A crash during a save
//! leaves the previous file intact because writes go through a temp file and
//! rename.

use crate::error::{IngestError, Result};
use crate::framework::storage::write_atomic;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub source_id: String,
    pub last_timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(source_id: impl Into<String>, last_timestamp: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            last_timestamp,
            updated_at,
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>>;

    /// Persist unless it would move the checkpoint backwards; returns the
    /// checkpoint now in effect
    async fn save(&self, checkpoint: Checkpoint) -> Result<Checkpoint>;
}

/// Pick the checkpoint that wins under the never-regress rule
fn advance(stored: Option<Checkpoint>, candidate: Checkpoint) -> (Checkpoint, bool) {
    match stored {
        Some(stored) if stored.last_timestamp > candidate.last_timestamp => {
            info!(
                source = %candidate.source_id,
                stored = %stored.last_timestamp,
                candidate = %candidate.last_timestamp,
                "Ignoring checkpoint older than stored value"
            );
            (stored, false)
        },
        _ => (candidate, true),
    }
}

/// One JSON file per source: `{dir}/{source_id}_checkpoint.json`
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    // serializes read-modify-write in save
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path_for(&self, source_id: &str) -> PathBuf {
        self.dir.join(format!("{source_id}_checkpoint.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(source_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
            IngestError::Parse(format!("corrupt checkpoint {}: {e}", path.display()))
        })?;
        if checkpoint.source_id.is_empty() {
            checkpoint.source_id = source_id.to_string();
        }
        debug!(source = source_id, last_timestamp = %checkpoint.last_timestamp, "Loaded checkpoint");
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let _guard = self.write_lock.lock().await;

        let stored = self.load(&checkpoint.source_id).await?;
        let (effective, changed) = advance(stored, checkpoint);
        if changed {
            let bytes = serde_json::to_vec_pretty(&effective)?;
            write_atomic(&self.path_for(&effective.source_id), &bytes).await?;
            info!(
                source = %effective.source_id,
                last_timestamp = %effective.last_timestamp,
                "Checkpoint saved"
            );
        }
        Ok(effective)
    }
}

/// In-process store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        let store = Self::default();
        store.entries().insert(checkpoint.source_id.clone(), checkpoint);
        store
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Checkpoint>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.entries().get(source_id).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let mut entries = self.entries();
        let (effective, _) = advance(entries.get(&checkpoint.source_id).cloned(), checkpoint);
        entries.insert(effective.source_id.clone(), effective.clone());
        Ok(effective)
    }
}
