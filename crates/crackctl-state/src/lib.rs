#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod fs;
pub mod transitions;

use std::path::Path;

use crackctl_core::summary::SnapshotSummary;
use crackctl_core::types::{
    AnomalyOverride, AttackPhase, BatchDefinition, BatchDefinitionError, BatchRecord, BatchSeq,
    BatchState, JobId, PartRecord,
};
use thiserror::Error;

pub use fs::{FsStateStore, LockOwner, WriterLockGuard};

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("batch {0} not found")]
    NotFound(BatchSeq),
    #[error("batch {0} already exists with a different definition")]
    BatchConflict(BatchSeq),
    #[error("invalid batch definition: {0}")]
    InvalidDefinition(#[from] BatchDefinitionError),
    #[error("invalid transition for {batch}: {reason}")]
    InvalidTransition { batch: BatchSeq, reason: String },
    #[error("writer lock for {0} is held by another writer")]
    LockBusy(BatchSeq),
    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateStoreError {
    pub(crate) fn transition(batch: BatchSeq, reason: impl Into<String>) -> Self {
        StateStoreError::InvalidTransition {
            batch,
            reason: reason.into(),
        }
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, StateStoreError::InvalidTransition { .. })
    }
}

/// Local authoritative record of batch progression.
///
/// - Every mutation is a single atomic commit of the whole batch record.
/// - One writer per batch at a time; readers never block.
/// - State only moves forward (see [`BatchState::can_transition_to`]).
pub trait StateStore: Send + Sync + 'static {
    fn create_batch(&self, def: BatchDefinition) -> Result<BatchRecord, StateStoreError>;
    fn read_batch(&self, seq: BatchSeq) -> Result<BatchRecord, StateStoreError>;
    fn list_batches(&self) -> Result<Vec<BatchSeq>, StateStoreError>;

    fn record_part_submitted(
        &self,
        seq: BatchSeq,
        part: PartRecord,
    ) -> Result<BatchRecord, StateStoreError>;

    fn record_attack_phase_applied(
        &self,
        seq: BatchSeq,
        phase: &AttackPhase,
        cracked: u64,
    ) -> Result<BatchRecord, StateStoreError>;

    /// Records RUNNING / COMPLETE / ANOMALOUS as derived by evaluation.
    fn record_observed_state(
        &self,
        seq: BatchSeq,
        state: BatchState,
    ) -> Result<BatchRecord, StateStoreError>;

    fn record_anomaly_override(
        &self,
        seq: BatchSeq,
        ov: AnomalyOverride,
    ) -> Result<BatchRecord, StateStoreError>;

    /// COMPLETE → ARCHIVED for the batch and every part in one commit.
    fn mark_batch_archived(&self, seq: BatchSeq) -> Result<BatchRecord, StateStoreError>;

    /// Clears `external_archive_pending` for the given jobs.
    fn confirm_external_archive(
        &self,
        seq: BatchSeq,
        jobs: &[JobId],
    ) -> Result<BatchRecord, StateStoreError>;

    fn write_snapshot_summary(&self, summary: &SnapshotSummary) -> Result<(), StateStoreError>;
    fn read_snapshot_summary(&self) -> Result<Option<SnapshotSummary>, StateStoreError>;
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path must have parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad filename"))?;
    let tmp = path.with_file_name(format!(
        "{file_name}.tmp.{}.{}",
        std::process::id(),
        crackctl_observe::time::unix_time_ms()
    ));

    {
        let mut f = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    std::fs::rename(tmp, path)?;
    Ok(())
}
