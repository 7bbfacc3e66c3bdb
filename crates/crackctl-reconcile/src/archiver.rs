use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crackctl_client::Orchestrator;
use crackctl_core::observed::Observed;
use crackctl_core::types::{
    AgentId, BatchRecord, BatchSeq, BatchState, ChunkState, JobId, KeyRange,
};
use crackctl_state::StateStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::coverage;
use crate::error::ReconcileError;
use crate::evaluator::{evaluate, finished_ranges, is_superseded, Evaluation, EvaluatorConfig};
use crate::locks::BatchLocks;
use crate::snapshot::Snapshot;
use crate::store_io::BlockingStore;

/// Archive gates in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    DeclaredKeyspace,
    MeasuredProgress,
    NoInFlightChunks,
    AbortedChunksSuperseded,
    TerminalSuccessPerPart,
    NoUnresolvedAnomaly,
    KeyspaceCoverage,
}

impl Gate {
    pub const ALL: [Gate; 7] = [
        Gate::DeclaredKeyspace,
        Gate::MeasuredProgress,
        Gate::NoInFlightChunks,
        Gate::AbortedChunksSuperseded,
        Gate::TerminalSuccessPerPart,
        Gate::NoUnresolvedAnomaly,
        Gate::KeyspaceCoverage,
    ];

    pub fn number(self) -> u8 {
        match self {
            Gate::DeclaredKeyspace => 1,
            Gate::MeasuredProgress => 2,
            Gate::NoInFlightChunks => 3,
            Gate::AbortedChunksSuperseded => 4,
            Gate::TerminalSuccessPerPart => 5,
            Gate::NoUnresolvedAnomaly => 6,
            Gate::KeyspaceCoverage => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Gate::DeclaredKeyspace => "declared_keyspace",
            Gate::MeasuredProgress => "measured_progress",
            Gate::NoInFlightChunks => "no_in_flight_chunks",
            Gate::AbortedChunksSuperseded => "aborted_chunks_superseded",
            Gate::TerminalSuccessPerPart => "terminal_success_per_part",
            Gate::NoUnresolvedAnomaly => "no_unresolved_anomaly",
            Gate::KeyspaceCoverage => "keyspace_coverage",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gate {} ({})", self.number(), self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateFailure {
    pub gate: Gate,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateReport {
    pub batch: BatchSeq,
    /// In gate order; empty when every gate passes.
    pub failures: Vec<GateFailure>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn first(&self) -> Option<&GateFailure> {
        self.failures.first()
    }
}

/// Collects the offending parts of one gate into a single failure.
struct GateCheck {
    gate: Gate,
    offenders: Vec<String>,
}

impl GateCheck {
    fn new(gate: Gate) -> Self {
        Self {
            gate,
            offenders: Vec::new(),
        }
    }

    fn fail(&mut self, reason: String) {
        self.offenders.push(reason);
    }

    fn finish(self) -> Option<GateFailure> {
        let mut offenders = self.offenders.into_iter();
        let first = offenders.next()?;
        let more = offenders.count();
        let reason = if more == 0 {
            first
        } else {
            format!("{first} (+{more} more)")
        };
        Some(GateFailure {
            gate: self.gate,
            reason,
        })
    }
}

/// Evaluates every gate against one snapshot. Pure; the first entry of the
/// report is the blocking gate.
pub fn check_gates(snapshot: &Snapshot, rec: &BatchRecord, eval: &Evaluation) -> GateReport {
    let mut checks: [GateCheck; 7] = Gate::ALL.map(GateCheck::new);
    let [g1, g2, g3, g4, g5, g6, g7] = &mut checks;

    for missing in rec.missing_parts() {
        g1.fail(format!("{missing}: not submitted"));
    }

    for (index, phase) in rec.expected_parts() {
        let Some(part) = rec.part(index, phase) else {
            continue;
        };
        let key = part.key(rec.seq);
        let Some(obs) = snapshot.part(&key) else {
            for g in [&mut *g1, &mut *g2, &mut *g3, &mut *g4, &mut *g5, &mut *g7] {
                g.fail(format!("{key}: not observed"));
            }
            continue;
        };

        match &obs.job {
            Observed::Known(job) => {
                if job.keyspace == 0 {
                    g1.fail(format!("{key}: declared keyspace is zero (job {})", job.id));
                }
                if job.keyspace_progress == 0 {
                    g2.fail(format!("{key}: no measured progress (job {})", job.id));
                }
            }
            Observed::Unavailable(u) => {
                g1.fail(format!("{key}: declared keyspace {u}"));
                g2.fail(format!("{key}: measured progress {u}"));
            }
        }

        let chunks = match obs.chunk_records() {
            Observed::Known(chunks) => chunks,
            Observed::Unavailable(u) => {
                for g in [&mut *g3, &mut *g4, &mut *g5, &mut *g7] {
                    g.fail(format!("{key}: chunks {u}"));
                }
                continue;
            }
        };

        if let Some(c) = chunks.iter().find(|c| c.state.is_in_flight()) {
            g3.fail(format!("{key}: chunk {} is {}", c.id, c.state));
        }

        let finished = finished_ranges(chunks.iter().copied());
        if let Some(c) = chunks
            .iter()
            .find(|c| c.state == ChunkState::Aborted && !is_superseded(c, &finished))
        {
            g4.fail(format!(
                "{key}: aborted chunk {} over {} has no terminal-success successor",
                c.id, c.range
            ));
        }

        if !chunks.iter().any(|c| c.state.is_terminal_success()) {
            g5.fail(format!("{key}: no terminal-success chunk"));
        }

        if let Observed::Known(job) = &obs.job {
            let gaps = coverage::uncovered(KeyRange::new(0, job.keyspace), &finished);
            if let Some(gap) = gaps.first() {
                g7.fail(format!("{key}: keyspace {gap} not finished"));
            }
        } else {
            g7.fail(format!("{key}: declared keyspace unknown"));
        }
    }

    for a in eval.unresolved_anomalies() {
        g6.fail(format!(
            "{}: {} cracked vs peer mean {:.1} (stddev {:.1})",
            a.key, a.cracked, a.peer_mean, a.peer_stddev
        ));
    }

    GateReport {
        batch: rec.seq,
        failures: checks.into_iter().filter_map(GateCheck::finish).collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    Commit,
    DryRun,
}

/// Result of propagating a local archive commit to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExternalCleanup {
    pub archived_jobs: Vec<JobId>,
    pub cleared_agents: Vec<AgentId>,
    /// Still flagged `external_archive_pending`; retried next tick.
    pub pending_jobs: Vec<JobId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Archived {
        batch: BatchSeq,
        cleanup: ExternalCleanup,
    },
    WouldArchive {
        batch: BatchSeq,
    },
    AlreadyArchived {
        batch: BatchSeq,
    },
    Blocked {
        batch: BatchSeq,
        gate: GateFailure,
        others: Vec<GateFailure>,
    },
}

pub struct SafeArchiver {
    store: BlockingStore,
    orchestrator: Arc<dyn Orchestrator>,
    locks: Arc<BatchLocks>,
    evaluator: EvaluatorConfig,
}

impl SafeArchiver {
    pub fn new(
        store: Arc<dyn StateStore>,
        orchestrator: Arc<dyn Orchestrator>,
        locks: Arc<BatchLocks>,
        evaluator: EvaluatorConfig,
    ) -> Self {
        Self {
            store: BlockingStore::new(store),
            orchestrator,
            locks,
            evaluator,
        }
    }

    /// Runs every gate against `snapshot`. On `Commit` with all gates passing,
    /// the batch and all its parts become ARCHIVED in one local commit before
    /// anything is sent to the server.
    pub async fn archive(
        &self,
        snapshot: &Snapshot,
        seq: BatchSeq,
        mode: ArchiveMode,
    ) -> Result<ArchiveOutcome, ReconcileError> {
        let _guard = self.locks.lock(seq).await;
        let rec = self.store.read_batch(seq).await?;
        if rec.state == BatchState::Archived {
            return Ok(ArchiveOutcome::AlreadyArchived { batch: seq });
        }

        let eval = evaluate(snapshot, &rec, &self.evaluator);
        let report = check_gates(snapshot, &rec, &eval);
        let mut failures = report.failures.into_iter();
        if let Some(first) = failures.next() {
            let others: Vec<GateFailure> = failures.collect();
            warn!(
                target: "crackctl_audit",
                event = "archive_blocked",
                batch = %seq,
                gate = first.gate.number(),
                gate_name = first.gate.as_str(),
                reason = %first.reason,
                other_failures = others.len() as u64,
                dry_run = mode == ArchiveMode::DryRun,
                "archive blocked"
            );
            return Ok(ArchiveOutcome::Blocked {
                batch: seq,
                gate: first,
                others,
            });
        }

        if mode == ArchiveMode::DryRun {
            info!(
                target: "crackctl_audit",
                event = "archive_dry_run_passed",
                batch = %seq,
                "all archive gates pass"
            );
            return Ok(ArchiveOutcome::WouldArchive { batch: seq });
        }

        if rec.state != BatchState::Complete {
            self.store
                .record_observed_state(seq, BatchState::Complete)
                .await?;
        }
        let archived = self.store.mark_batch_archived(seq).await?;
        info!(
            target: "crackctl_audit",
            event = "batch_archived",
            batch = %seq,
            parts = archived.parts.len() as u64,
            "batch archived locally; propagating to server"
        );

        let cleanup = self.propagate(&archived).await?;
        Ok(ArchiveOutcome::Archived {
            batch: seq,
            cleanup,
        })
    }

    /// Retries server-side archiving for parts still flagged pending.
    pub async fn finish_external(&self, seq: BatchSeq) -> Result<ExternalCleanup, ReconcileError> {
        let _guard = self.locks.lock(seq).await;
        let rec = self.store.read_batch(seq).await?;
        if rec.state != BatchState::Archived {
            return Err(ReconcileError::invariant(
                seq,
                format!("external archive requested while batch is {}", rec.state),
            ));
        }
        self.propagate(&rec).await
    }

    async fn propagate(&self, rec: &BatchRecord) -> Result<ExternalCleanup, ReconcileError> {
        let seq = rec.seq;
        let pending: Vec<JobId> = rec.pending_external_archive().map(|p| p.job_id).collect();
        let mut cleanup = ExternalCleanup::default();
        if pending.is_empty() {
            return Ok(cleanup);
        }

        let batch_jobs: BTreeSet<JobId> = rec.parts.iter().map(|p| p.job_id).collect();
        let agents = match self.orchestrator.list_agents().await {
            Ok(agents) => agents,
            Err(err) => {
                warn!(
                    batch = %seq,
                    error = %err,
                    "agent query failed; external archive stays pending"
                );
                cleanup.pending_jobs = pending;
                return Ok(cleanup);
            }
        };
        let assigned: Vec<(AgentId, JobId)> = agents
            .iter()
            .filter_map(|a| a.assigned_job.map(|j| (a.id, j)))
            .filter(|(_, j)| batch_jobs.contains(j))
            .collect();

        let mut confirmed = Vec::new();
        for job in pending {
            let archived = match self.orchestrator.archive_job(job).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(batch = %seq, job_id = %job, error = %err, "archive_job failed");
                    false
                }
            };
            let mut cleared_all = true;
            for (agent, _) in assigned.iter().filter(|(_, j)| *j == job) {
                match self.orchestrator.clear_agent_assignment(*agent).await {
                    Ok(()) => cleanup.cleared_agents.push(*agent),
                    Err(err) => {
                        warn!(
                            batch = %seq,
                            job_id = %job,
                            agent_id = %agent,
                            error = %err,
                            "clearing agent assignment failed"
                        );
                        cleared_all = false;
                    }
                }
            }
            if archived && cleared_all {
                confirmed.push(job);
                cleanup.archived_jobs.push(job);
            } else {
                cleanup.pending_jobs.push(job);
            }
        }

        if !confirmed.is_empty() {
            self.store.confirm_external_archive(seq, confirmed).await?;
        }
        info!(
            target: "crackctl_audit",
            event = "external_archive",
            batch = %seq,
            archived_jobs = cleanup.archived_jobs.len() as u64,
            cleared_agents = cleanup.cleared_agents.len() as u64,
            pending_jobs = cleanup.pending_jobs.len() as u64,
            "server-side archive propagated"
        );
        Ok(cleanup)
    }
}
