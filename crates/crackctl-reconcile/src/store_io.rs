//! Async face of the [`StateStore`]. Store calls do file I/O and may wait on a
//! batch writer lock, so they run on the blocking pool and never park a
//! runtime worker.

use std::sync::Arc;

use crackctl_core::summary::SnapshotSummary;
use crackctl_core::types::{AttackPhase, BatchRecord, BatchSeq, BatchState, JobId, PartRecord};
use crackctl_state::{StateStore, StateStoreError};

use crate::error::ReconcileError;

#[derive(Clone)]
pub struct BlockingStore {
    inner: Arc<dyn StateStore>,
}

impl BlockingStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self { inner }
    }

    pub async fn call<T, F>(&self, f: F) -> Result<T, ReconcileError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StateStore) -> Result<T, StateStoreError> + Send + 'static,
    {
        let store = self.inner.clone();
        match tokio::task::spawn_blocking(move || f(store.as_ref())).await {
            Ok(res) => Ok(res?),
            Err(err) => Err(ReconcileError::StoreTask(err.to_string())),
        }
    }

    pub async fn read_batch(&self, seq: BatchSeq) -> Result<BatchRecord, ReconcileError> {
        self.call(move |s| s.read_batch(seq)).await
    }

    /// Every stored batch, split into unarchived and archived.
    pub async fn load_batches(&self) -> Result<(Vec<BatchRecord>, Vec<BatchRecord>), ReconcileError> {
        self.call(|s| {
            let mut active = Vec::new();
            let mut archived = Vec::new();
            for seq in s.list_batches()? {
                let rec = s.read_batch(seq)?;
                if rec.state == BatchState::Archived {
                    archived.push(rec);
                } else {
                    active.push(rec);
                }
            }
            Ok((active, archived))
        })
        .await
    }

    pub async fn record_part_submitted(
        &self,
        seq: BatchSeq,
        part: PartRecord,
    ) -> Result<BatchRecord, ReconcileError> {
        self.call(move |s| s.record_part_submitted(seq, part)).await
    }

    pub async fn record_attack_phase_applied(
        &self,
        seq: BatchSeq,
        phase: AttackPhase,
        cracked: u64,
    ) -> Result<BatchRecord, ReconcileError> {
        self.call(move |s| s.record_attack_phase_applied(seq, &phase, cracked))
            .await
    }

    pub async fn record_observed_state(
        &self,
        seq: BatchSeq,
        state: BatchState,
    ) -> Result<BatchRecord, ReconcileError> {
        self.call(move |s| s.record_observed_state(seq, state)).await
    }

    pub async fn mark_batch_archived(&self, seq: BatchSeq) -> Result<BatchRecord, ReconcileError> {
        self.call(move |s| s.mark_batch_archived(seq)).await
    }

    pub async fn confirm_external_archive(
        &self,
        seq: BatchSeq,
        jobs: Vec<JobId>,
    ) -> Result<BatchRecord, ReconcileError> {
        self.call(move |s| s.confirm_external_archive(seq, &jobs))
            .await
    }

    pub async fn write_snapshot_summary(
        &self,
        summary: SnapshotSummary,
    ) -> Result<(), ReconcileError> {
        self.call(move |s| s.write_snapshot_summary(&summary)).await
    }
}
