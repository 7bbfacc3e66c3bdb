//! Machine-readable operator report, written once per tick.

use std::path::Path;

use crackctl_core::summary::SnapshotSummary;
use crackctl_core::types::{
    AttackPhase, BatchRecord, BatchSeq, BatchState, ChunkId, JobId, PartIndex, PartKey,
};
use serde::Serialize;

use crate::archiver::{ArchiveOutcome, GateFailure, GateReport};
use crate::error::{ErrorKind, ReconcileError};
use crate::evaluator::{AdvisoryDisagreement, Anomaly, BatchStatus, Evaluation};
use crate::resolver::Resolution;
use crate::submitter::SubmitOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    /// Something could not be observed or is waiting on a retry.
    Degraded,
    /// Needs an operator.
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportedError {
    pub batch: Option<BatchSeq>,
    /// `None` for failures outside the error taxonomy, e.g. a panicked task.
    pub kind: Option<ErrorKind>,
    pub message: String,
}

impl ReportedError {
    pub fn new(batch: Option<BatchSeq>, err: &ReconcileError) -> Self {
        Self {
            batch,
            kind: Some(err.kind()),
            message: err.to_string(),
        }
    }

    pub fn internal(batch: Option<BatchSeq>, message: impl Into<String>) -> Self {
        Self {
            batch,
            kind: None,
            message: message.into(),
        }
    }

    fn health(&self) -> Health {
        match self.kind {
            Some(ErrorKind::InvariantViolation | ErrorKind::ExternalStateAnomaly) => Health::Blocked,
            Some(ErrorKind::TransientNetwork | ErrorKind::QueryDegraded) | None => Health::Degraded,
        }
    }
}

/// Something the loop did to a batch during the tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    ObservedState {
        from: BatchState,
        to: BatchState,
    },
    PhaseApplied {
        phase: AttackPhase,
        cracked: u64,
    },
    Archive {
        outcome: ArchiveOutcome,
    },
    ExternalArchive {
        archived_jobs: Vec<JobId>,
        pending_jobs: Vec<JobId>,
    },
    Resolve {
        key: PartKey,
        chunk_id: ChunkId,
        resolution: Resolution,
    },
    Submit {
        index: PartIndex,
        phase: AttackPhase,
        outcome: SubmitOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch: BatchSeq,
    pub state: BatchState,
    pub health: Health,
    /// Absent for archived batches, which are no longer evaluated.
    pub status: Option<BatchStatus>,
    pub degraded: bool,
    pub blocking_gate: Option<GateFailure>,
    pub other_gate_failures: Vec<GateFailure>,
    pub anomalies: Vec<Anomaly>,
    pub advisory_disagreements: Vec<AdvisoryDisagreement>,
    pub pending_external_archive: Vec<JobId>,
    pub actions: Vec<Action>,
    pub errors: Vec<ReportedError>,
}

impl BatchReport {
    pub fn new(rec: &BatchRecord) -> Self {
        Self {
            batch: rec.seq,
            state: rec.state,
            health: Health::Healthy,
            status: None,
            degraded: false,
            blocking_gate: None,
            other_gate_failures: Vec::new(),
            anomalies: Vec::new(),
            advisory_disagreements: Vec::new(),
            pending_external_archive: rec.pending_external_archive().map(|p| p.job_id).collect(),
            actions: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn observe(&mut self, eval: &Evaluation, gates: &GateReport, degraded: bool) {
        self.status = Some(eval.status.clone());
        self.degraded = degraded;
        let mut failures = gates.failures.iter().cloned();
        self.blocking_gate = failures.next();
        self.other_gate_failures = failures.collect();
        self.anomalies = eval.anomalies.clone();
        self.advisory_disagreements = eval.advisory_disagreements.clone();
    }

    pub fn push_error(&mut self, err: &ReconcileError) {
        self.errors.push(ReportedError::new(Some(self.batch), err));
    }

    /// Re-reads the lifecycle fields after the tick mutated the batch.
    pub fn refresh(&mut self, rec: &BatchRecord) {
        self.state = rec.state;
        self.pending_external_archive = rec.pending_external_archive().map(|p| p.job_id).collect();
    }

    /// A gate blocking a running batch is normal and does not count here;
    /// only anomalies and errors that need an operator do.
    pub fn compute_health(&mut self) -> Health {
        let mut health = Health::Healthy;
        match &self.status {
            Some(BatchStatus::Anomalous) => health = health.max(Health::Blocked),
            Some(BatchStatus::InsufficientInformation { .. }) => {
                health = health.max(Health::Degraded)
            }
            _ => {}
        }
        if self.degraded || !self.pending_external_archive.is_empty() {
            health = health.max(Health::Degraded);
        }
        for err in &self.errors {
            health = health.max(err.health());
        }
        self.health = health;
        health
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorReport {
    pub generated_unix_s: u64,
    pub health: Health,
    pub snapshot: SnapshotSummary,
    pub batches: Vec<BatchReport>,
    pub errors: Vec<ReportedError>,
}

impl OperatorReport {
    pub fn new(
        generated_unix_s: u64,
        snapshot: SnapshotSummary,
        mut batches: Vec<BatchReport>,
        errors: Vec<ReportedError>,
    ) -> Self {
        batches.sort_by_key(|b| b.batch);
        let mut health = if snapshot.agents.is_known() {
            Health::Healthy
        } else {
            Health::Degraded
        };
        for batch in &mut batches {
            health = health.max(batch.compute_health());
        }
        for err in &errors {
            health = health.max(err.health());
        }
        Self {
            generated_unix_s,
            health,
            snapshot,
            batches,
            errors,
        }
    }

    pub fn batch(&self, seq: BatchSeq) -> Option<&BatchReport> {
        self.batches.iter().find(|b| b.batch == seq)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), std::io::Error> {
        let bytes = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        crackctl_state::write_atomic(path, &bytes)
    }
}
