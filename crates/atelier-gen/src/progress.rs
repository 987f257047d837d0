//! Checkpointed run state
//!
//! One checkpoint row per run, keyed by the run id and rewritten at every
//! task boundary. Its metadata records which fingerprints finished and which
//! failed, so a restarted run knows what is left. The cache remains the
//! authority on whether an asset exists; the checkpoint only says where the
//! run got to.

use crate::queue::AssetRequest;
use crate::retry::retry_storage_once;
use atelier_core::{now, AtelierError, CheckpointStatus, Fingerprint, Result};
use atelier_store::{AssetDatabase, Checkpoint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// Typed view of a checkpoint's metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    /// Assets the run was asked for
    #[serde(default)]
    pub total: usize,
    /// Fingerprints (hex) that reached the cache
    #[serde(default)]
    pub completed: BTreeSet<String>,
    /// Fingerprint (hex) -> last error
    #[serde(default)]
    pub failed: BTreeMap<String, String>,
    /// Approval batch holding this run's assets
    #[serde(default)]
    pub approval_batch: Option<String>,
    /// Style guide the prompts were resolved with
    #[serde(default)]
    pub style: Option<String>,
    /// What the run was asked to produce, for resuming
    #[serde(default)]
    pub requests: Vec<AssetRequest>,
}

impl RunProgress {
    pub fn from_checkpoint(cp: &Checkpoint) -> Result<Self> {
        serde_json::from_value(cp.metadata.clone())
            .map_err(|e| AtelierError::JsonError(format!("checkpoint {}: {}", cp.id, e)))
    }

    pub fn is_completed(&self, fingerprint: &Fingerprint) -> bool {
        self.completed.contains(&fingerprint.to_hex())
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed.len() + self.failed.len())
    }
}

pub struct ProgressTracker {
    db: AssetDatabase,
    // Serializes read-modify-write cycles on a checkpoint
    write_lock: Mutex<()>,
}

impl ProgressTracker {
    pub fn new(db: AssetDatabase) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the checkpoint for a new run. An existing run id must be resumed instead.
    pub fn start_run(&self, run_id: &str, total: usize) -> Result<Checkpoint> {
        self.start_with(
            run_id,
            RunProgress {
                total,
                ..Default::default()
            },
        )
    }

    /// Start a run that remembers its requests, so it can be resumed
    pub fn start_run_with(&self, run_id: &str, requests: &[AssetRequest], style: Option<&str>) -> Result<Checkpoint> {
        self.start_with(
            run_id,
            RunProgress {
                total: requests.len(),
                style: style.map(str::to_string),
                requests: requests.to_vec(),
                ..Default::default()
            },
        )
    }

    fn start_with(&self, run_id: &str, progress: RunProgress) -> Result<Checkpoint> {
        let _guard = self.lock();
        if self.db.read_latest_checkpoint(run_id)?.is_some() {
            return Err(AtelierError::InvalidState(format!(
                "run {} already exists; resume it instead",
                run_id
            )));
        }
        let total = progress.total;
        let cp = Checkpoint {
            id: run_id.to_string(),
            status: CheckpointStatus::Started,
            position: 0,
            metadata: to_value(&progress)?,
            timestamp: now(),
        };
        self.write(&cp)?;
        tracing::info!(run_id, total, "run started");
        Ok(cp)
    }

    /// Overwrite the run's position and metadata
    pub fn checkpoint(&self, run_id: &str, position: u64, metadata: serde_json::Value) -> Result<Checkpoint> {
        let _guard = self.lock();
        let cp = Checkpoint {
            id: run_id.to_string(),
            status: CheckpointStatus::InProgress,
            position,
            metadata,
            timestamp: now(),
        };
        self.write(&cp)?;
        Ok(cp)
    }

    /// Note a finished asset and advance the position
    pub fn record_completed(&self, run_id: &str, fingerprint: &Fingerprint) -> Result<Checkpoint> {
        self.update(run_id, |progress| {
            let key = fingerprint.to_hex();
            progress.failed.remove(&key);
            progress.completed.insert(key);
        })
    }

    /// Note a terminally failed asset
    pub fn record_failed(&self, run_id: &str, fingerprint: &Fingerprint, error: &str) -> Result<Checkpoint> {
        self.update(run_id, |progress| {
            let key = fingerprint.to_hex();
            if !progress.completed.contains(&key) {
                progress.failed.insert(key, error.to_string());
            }
        })
    }

    /// Move a stored asset back to failed after a reviewer rejected it
    pub fn record_rejected(&self, run_id: &str, fingerprint: &Fingerprint, reason: &str) -> Result<Checkpoint> {
        self.update(run_id, |progress| {
            let key = fingerprint.to_hex();
            progress.completed.remove(&key);
            progress.failed.insert(key, reason.to_string());
        })
    }

    pub fn set_approval_batch(&self, run_id: &str, batch_id: &str) -> Result<Checkpoint> {
        self.update(run_id, |progress| {
            progress.approval_batch = Some(batch_id.to_string());
        })
    }

    /// Failed assets get another chance on resume
    pub fn clear_failures(&self, run_id: &str) -> Result<Checkpoint> {
        self.update(run_id, |progress| progress.failed.clear())
    }

    fn update(&self, run_id: &str, apply: impl FnOnce(&mut RunProgress)) -> Result<Checkpoint> {
        let _guard = self.lock();
        let mut cp = self
            .db
            .read_latest_checkpoint(run_id)?
            .ok_or_else(|| AtelierError::NotFound(format!("run {}", run_id)))?;
        let mut progress = RunProgress::from_checkpoint(&cp)?;
        apply(&mut progress);

        cp.position = progress.completed.len() as u64;
        cp.metadata = to_value(&progress)?;
        cp.status = CheckpointStatus::InProgress;
        cp.timestamp = now();
        self.write(&cp)?;
        tracing::debug!(
            run_id,
            position = cp.position,
            failed = progress.failed.len(),
            "checkpoint written"
        );
        Ok(cp)
    }

    /// Mark a crashed or interrupted run as resumed and return its last checkpoint
    pub fn resume(&self, run_id: &str) -> Result<Checkpoint> {
        let _guard = self.lock();
        let mut cp = self
            .db
            .read_latest_checkpoint(run_id)?
            .ok_or_else(|| AtelierError::NotFound(format!("run {}", run_id)))?;
        if cp.status.is_terminal() {
            tracing::info!(run_id, "run already completed");
            return Ok(cp);
        }
        cp.status = CheckpointStatus::Resumed;
        cp.timestamp = now();
        self.write(&cp)?;
        tracing::info!(run_id, position = cp.position, "run resumed");
        Ok(cp)
    }

    /// Close the run as completed or failed
    pub fn finish(&self, run_id: &str, success: bool) -> Result<Checkpoint> {
        let _guard = self.lock();
        let mut cp = self
            .db
            .read_latest_checkpoint(run_id)?
            .ok_or_else(|| AtelierError::NotFound(format!("run {}", run_id)))?;
        cp.status = if success {
            CheckpointStatus::Completed
        } else {
            CheckpointStatus::Failed
        };
        cp.timestamp = now();
        self.write(&cp)?;
        tracing::info!(run_id, status = %cp.status, "run finished");
        Ok(cp)
    }

    pub fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        self.db.read_latest_checkpoint(run_id)
    }

    pub fn progress(&self, run_id: &str) -> Result<RunProgress> {
        let cp = self
            .db
            .read_latest_checkpoint(run_id)?
            .ok_or_else(|| AtelierError::NotFound(format!("run {}", run_id)))?;
        RunProgress::from_checkpoint(&cp)
    }

    /// Every run, most recent first
    pub fn runs(&self) -> Result<Vec<Checkpoint>> {
        self.db.list_checkpoints()
    }

    fn write(&self, cp: &Checkpoint) -> Result<()> {
        retry_storage_once("write checkpoint", || self.db.write_checkpoint(cp))
    }
}

fn to_value(progress: &RunProgress) -> Result<serde_json::Value> {
    serde_json::to_value(progress).map_err(|e| AtelierError::JsonError(e.to_string()))
}
