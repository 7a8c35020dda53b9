//! Carrier collector contracts and the checkpointed worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cspf_core::{Carrier, CollectedRecord};
use cspf_storage::{CheckpointEntry, CheckpointStore};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cspf-collect";

/// One enumerable unit of collection work (a device page, a subscription-type
/// listing, an OCR'd price sheet). Opaque to the scheduler beyond its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    #[serde(default)]
    pub params: JsonValue,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: JsonValue::Null,
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("{0}")]
    Message(String),
    #[error("unit timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One implementation per carrier; invoked by the scheduler as an opaque
/// unit-of-work function. Browser/page mechanics live behind this seam.
#[async_trait]
pub trait CarrierCollector: Send + Sync {
    fn carrier(&self) -> Carrier;

    async fn collect(&self, unit: &WorkUnit) -> Result<Vec<CollectedRecord>, CollectError>;
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_workers: usize,
    pub unit_timeout: Duration,
    pub resume: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            unit_timeout: Duration::from_secs(90),
            resume: false,
        }
    }
}

/// Counts reported at the end of every run, also on partial failure.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub task_id: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Units actually executed this run (resume skips are not executions).
    pub executed: usize,
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
    pub records: usize,
}

/// Bounded-concurrency executor with single-writer checkpointing.
///
/// Workers run collection units in parallel and report over a channel; only
/// the coordinator mutates the checkpoint entry and persists it, after every
/// unit completion. A crash therefore loses at most the in-flight units.
pub struct BatchRunner {
    store: CheckpointStore,
    config: BatchConfig,
}

impl BatchRunner {
    pub fn new(store: CheckpointStore, config: BatchConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(
        &self,
        task_id: &str,
        units: &[WorkUnit],
        collector: Arc<dyn CarrierCollector>,
    ) -> Result<BatchSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let mut entry = if self.config.resume {
            match self
                .store
                .load(task_id)
                .await
                .with_context(|| format!("loading checkpoint for task {task_id}"))?
            {
                Some(mut entry) => {
                    let retried = entry.take_failures();
                    if !retried.is_empty() {
                        info!(
                            task_id,
                            retried = retried.len(),
                            "retrying previously failed units once"
                        );
                    }
                    entry
                }
                None => CheckpointEntry::new(task_id),
            }
        } else {
            CheckpointEntry::new(task_id)
        };

        let pending: Vec<WorkUnit> = units
            .iter()
            .filter(|unit| !entry.is_completed(&unit.id))
            .cloned()
            .collect();
        let skipped = units.len() - pending.len();
        info!(
            task_id,
            %run_id,
            total = units.len(),
            pending = pending.len(),
            skipped,
            workers = self.config.max_workers,
            "starting collection batch"
        );

        // Entry exists on disk from job start, so even an all-failed run is
        // observable and resumable.
        self.store
            .save(&entry)
            .await
            .with_context(|| format!("persisting initial checkpoint for task {task_id}"))?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let (tx, mut rx) = mpsc::channel::<(String, Result<Vec<CollectedRecord>, CollectError>)>(
            pending.len().max(1),
        );
        let mut workers = JoinSet::new();
        for unit in pending.iter().cloned() {
            let semaphore = semaphore.clone();
            let collector = collector.clone();
            let tx = tx.clone();
            let unit_timeout = self.config.unit_timeout;
            workers.spawn(async move {
                // The semaphore lives for the whole batch, so acquire only
                // fails if the runner is being torn down.
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result =
                    match tokio::time::timeout(unit_timeout, collector.collect(&unit)).await {
                        Ok(result) => result,
                        Err(_) => Err(CollectError::Timeout(unit_timeout)),
                    };
                let _ = tx.send((unit.id, result)).await;
            });
        }
        drop(tx);

        let mut executed = 0usize;
        while let Some((unit_id, result)) = rx.recv().await {
            executed += 1;
            match result {
                Ok(records) => {
                    debug!(task_id, unit_id, records = records.len(), "unit completed");
                    entry.record_success(&unit_id, records);
                }
                Err(err) => {
                    warn!(task_id, unit_id, error = %err, "unit failed; batch continues");
                    entry.record_failure(&unit_id, &err.to_string());
                }
            }
            if let Err(save_err) = self.store.save(&entry).await {
                // Checkpoint durability failures are fatal; the previously
                // persisted entry stays intact because saves are atomic.
                workers.abort_all();
                return Err(anyhow::Error::new(save_err))
                    .with_context(|| format!("persisting checkpoint for task {task_id}"));
            }
        }
        while workers.join_next().await.is_some() {}

        let summary = BatchSummary {
            task_id: task_id.to_string(),
            run_id,
            started_at,
            finished_at: Utc::now(),
            executed,
            skipped,
            completed: entry.completed_count(),
            failed: entry.failed_count(),
            records: entry.data.len(),
        };
        info!(
            task_id,
            executed = summary.executed,
            completed = summary.completed,
            failed = summary.failed,
            records = summary.records,
            "collection batch finished"
        );
        Ok(summary)
    }
}

/// Offline collector reading per-unit JSON record bundles from
/// `<root>/<carrier>/<unit_id>.json`. Stands in for the live page-automation
/// collectors in tests and dry runs.
#[derive(Debug, Clone)]
pub struct FixtureCollector {
    carrier: Carrier,
    root: PathBuf,
}

impl FixtureCollector {
    pub fn new(root: impl Into<PathBuf>, carrier: Carrier) -> Self {
        Self {
            carrier,
            root: root.into(),
        }
    }

    fn carrier_dir(&self) -> PathBuf {
        self.root.join(self.carrier.code().to_ascii_lowercase())
    }

    pub fn unit_path(&self, unit_id: &str) -> PathBuf {
        self.carrier_dir().join(format!("{unit_id}.json"))
    }

    /// Enumerates units from the fixture directory, ordered by file name.
    pub fn enumerate_units(&self) -> Result<Vec<WorkUnit>> {
        let dir = self.carrier_dir();
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("reading fixture directory {}", dir.display()))?;
        for dir_entry in entries {
            let dir_entry = dir_entry
                .with_context(|| format!("reading fixture directory {}", dir.display()))?;
            let path = dir_entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids.into_iter().map(WorkUnit::new).collect())
    }
}

#[async_trait]
impl CarrierCollector for FixtureCollector {
    fn carrier(&self) -> Carrier {
        self.carrier
    }

    async fn collect(&self, unit: &WorkUnit) -> Result<Vec<CollectedRecord>, CollectError> {
        let path = self.unit_path(&unit.id);
        let records = read_record_bundle(&path).await?;
        for record in &records {
            if record.carrier() != self.carrier {
                return Err(CollectError::Message(format!(
                    "bundle {} carries carrier {} but collector is {}",
                    path.display(),
                    record.carrier(),
                    self.carrier
                )));
            }
        }
        Ok(records)
    }
}

async fn read_record_bundle(path: &Path) -> Result<Vec<CollectedRecord>, CollectError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| CollectError::Message(format!("reading {}: {err}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|err| CollectError::Message(format!("parsing {}: {err}", path.display())))
}
