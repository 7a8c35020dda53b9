//! Durable checkpoint persistence for resumable collection batches.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cspf_core::CollectedRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cspf-storage";

/// A unit that ended in failure during the run that produced the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub unit_id: String,
    pub error: String,
}

/// Progress snapshot for one collection task.
///
/// `completed` and `data` only grow during a run; the persisted file is
/// rewritten whole on every save because saves are serialized by the batch
/// coordinator. Unknown fields are ignored and every optional field defaults,
/// so a prior-version reader keeps loading newer checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed: Vec<FailedUnit>,
    #[serde(default)]
    pub data: Vec<CollectedRecord>,
    #[serde(default)]
    pub cursor_state: Option<serde_json::Value>,
}

impl CheckpointEntry {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            timestamp: Utc::now(),
            completed: Vec::new(),
            failed: Vec::new(),
            data: Vec::new(),
            cursor_state: None,
        }
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_completed(&self, unit_id: &str) -> bool {
        self.completed.iter().any(|id| id == unit_id)
    }

    pub fn record_success(&mut self, unit_id: &str, records: Vec<CollectedRecord>) {
        self.data.extend(records);
        self.completed.push(unit_id.to_string());
        self.timestamp = Utc::now();
    }

    pub fn record_failure(&mut self, unit_id: &str, error: &str) {
        self.failed.push(FailedUnit {
            unit_id: unit_id.to_string(),
            error: error.to_string(),
        });
        self.timestamp = Utc::now();
    }

    /// Drops the failed-unit rows so a resume can retry them once; returns the
    /// dropped rows for logging.
    pub fn take_failures(&mut self) -> Vec<FailedUnit> {
        std::mem::take(&mut self.failed)
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt checkpoint {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding checkpoint for task {task_id}: {source}")]
    Encode {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Filesystem-backed checkpoint store, one JSON file per task id.
///
/// `save` is atomic: the new entry is written to a temp file and renamed over
/// the old one, so a concurrent `load` observes either the previous entry or
/// the new one, never a half-written file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{task_id}.checkpoint.json"))
    }

    pub async fn save(&self, entry: &CheckpointEntry) -> Result<(), CheckpointError> {
        let path = self.path_for(&entry.task_id);
        let bytes = serde_json::to_vec_pretty(entry).map_err(|source| {
            CheckpointError::Encode {
                task_id: entry.task_id.clone(),
                source,
            }
        })?;
        write_atomic(&path, &bytes).await?;
        debug!(
            task_id = %entry.task_id,
            completed = entry.completed_count(),
            failed = entry.failed_count(),
            records = entry.data.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    pub async fn load(&self, task_id: &str) -> Result<Option<CheckpointEntry>, CheckpointError> {
        let path = self.path_for(task_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        // A torn or hand-mangled file is fatal, not an empty checkpoint.
        let entry = serde_json::from_slice(&bytes)
            .map_err(|source| CheckpointError::Corrupt { path, source })?;
        Ok(Some(entry))
    }

    pub async fn clear(&self, task_id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(task_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }
}

/// Writes bytes via a same-directory temp file and rename, so readers never
/// observe a partial write.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_err)?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err)?;
    if let Err(source) = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok::<_, std::io::Error>(())
    }
    .await
    {
        drop(file);
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(source));
    }
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(source));
    }
    Ok(())
}
