use std::sync::Arc;

use crackctl_client::Orchestrator;
use crackctl_core::catalog::PhaseCatalog;
use crackctl_core::naming::JobName;
use crackctl_core::priority::PriorityPolicy;
use crackctl_core::profile::JobProfile;
use crackctl_core::types::{
    AttackPhase, BatchRecord, BatchSeq, BatchState, DependencyProbe, JobId, NewJob, PartIndex,
    PartKey, PartRecord,
};
use crackctl_observe::time::unix_time_ms;
use crackctl_state::StateStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ReconcileError;
use crate::locks::BatchLocks;
use crate::store_io::BlockingStore;

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub priority: PriorityPolicy,
    pub profile: JobProfile,
    pub chunk_time_secs: u32,
    pub status_timer_secs: u32,
    /// 0 means unlimited.
    pub max_agents: u32,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            priority: PriorityPolicy::default(),
            profile: JobProfile::V1,
            chunk_time_secs: 600,
            status_timer_secs: 5,
            max_agents: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingSource {
    StateStore,
    /// Found on the server by job name and adopted into the state store.
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Created { job_id: JobId, priority: u32 },
    AlreadyExists { job_id: JobId, source: ExistingSource },
}

/// Parts the batch is ready to submit: the unsubmitted parts of the earliest
/// phase not yet recorded as applied. Later phases wait.
pub fn next_submissions(rec: &BatchRecord) -> Vec<(PartIndex, AttackPhase)> {
    if rec.state == BatchState::Archived {
        return Vec::new();
    }
    let Some(phase) = rec.next_phase() else {
        return Vec::new();
    };
    (0..rec.part_count())
        .map(PartIndex)
        .filter(|i| rec.part(*i, phase).is_none())
        .map(|i| (i, phase.clone()))
        .collect()
}

/// Issues at most one external job per (batch, part, phase).
pub struct Submitter {
    store: BlockingStore,
    orchestrator: Arc<dyn Orchestrator>,
    locks: Arc<BatchLocks>,
    catalog: PhaseCatalog,
    cfg: SubmitterConfig,
}

impl Submitter {
    pub fn new(
        store: Arc<dyn StateStore>,
        orchestrator: Arc<dyn Orchestrator>,
        locks: Arc<BatchLocks>,
        catalog: PhaseCatalog,
        cfg: SubmitterConfig,
    ) -> Self {
        Self {
            store: BlockingStore::new(store),
            orchestrator,
            locks,
            catalog,
            cfg,
        }
    }

    pub async fn submit(
        &self,
        seq: BatchSeq,
        index: PartIndex,
        phase: &AttackPhase,
    ) -> Result<SubmitOutcome, ReconcileError> {
        let _guard = self.locks.lock(seq).await;
        let rec = self.store.read_batch(seq).await?;
        if let Some(existing) = rec.part(index, phase) {
            return Ok(SubmitOutcome::AlreadyExists {
                job_id: existing.job_id,
                source: ExistingSource::StateStore,
            });
        }

        if rec.state == BatchState::Archived {
            return Err(ReconcileError::invariant(seq, "batch is archived"));
        }
        if !rec.phases.contains(phase) {
            return Err(ReconcileError::invariant(
                seq,
                format!("phase {phase} is not part of this batch"),
            ));
        }
        let Some(hashlist_id) = rec.hashlist_for(index) else {
            return Err(ReconcileError::invariant(
                seq,
                format!("part {index} out of range ({} parts)", rec.part_count()),
            ));
        };
        let Some(spec) = self.catalog.get(phase) else {
            return Err(ReconcileError::invariant(
                seq,
                format!("no attack definition for phase {phase}"),
            ));
        };

        let key = PartKey {
            batch: seq,
            index,
            phase: phase.clone(),
        };
        let name = JobName::new(key.clone()).to_string();
        let priority = self.cfg.priority.for_batch(seq);
        if self.cfg.priority.is_sentinel(priority) {
            return Err(ReconcileError::invariant(
                seq,
                format!("priority {priority} equals the complete sentinel"),
            ));
        }
        if seq > self.cfg.priority.last_ordered_seq() {
            warn!(
                batch = %seq,
                priority,
                "priority clamped at the floor; batch no longer outranks later batches"
            );
        }

        let jobs = self.orchestrator.list_jobs().await?;
        let matches: Vec<JobId> = jobs.iter().filter(|j| j.name == name).map(|j| j.id).collect();
        match matches.as_slice() {
            [] => {}
            [job_id] => {
                self.store
                    .record_part_submitted(
                        seq,
                        PartRecord {
                            index,
                            phase: phase.clone(),
                            job_id: *job_id,
                            hashlist_id,
                            priority,
                            submitted_unix_ms: unix_time_ms(),
                            archived: false,
                            external_archive_pending: false,
                        },
                    )
                    .await?;
                info!(
                    target: "crackctl_audit",
                    event = "job_adopted",
                    batch = %seq,
                    part = %index,
                    phase = %phase,
                    job_id = %job_id,
                    "existing server job adopted for part"
                );
                return Ok(SubmitOutcome::AlreadyExists {
                    job_id: *job_id,
                    source: ExistingSource::Server,
                });
            }
            many => {
                return Err(ReconcileError::ExternalAnomaly(format!(
                    "{} server jobs are named {name}",
                    many.len()
                )))
            }
        }

        for dep in &spec.dependencies {
            let reason = match self.orchestrator.check_dependency(dep).await? {
                DependencyProbe::Resolvable => continue,
                DependencyProbe::Missing { reason } => format!("missing: {reason}"),
                DependencyProbe::Unresolvable { reason } => reason,
            };
            warn!(
                target: "crackctl_audit",
                event = "submit_blocked",
                batch = %seq,
                part = %index,
                phase = %phase,
                dependency = %dep.name,
                reason = %reason,
                "dependency failed resolution probe"
            );
            return Err(ReconcileError::Dependency {
                key,
                name: dep.name.clone(),
                reason,
            });
        }

        let job = NewJob {
            name,
            hashlist_id,
            attack_cmd: spec.attack_cmd.clone(),
            priority,
            chunk_time_secs: self.cfg.chunk_time_secs,
            status_timer_secs: self.cfg.status_timer_secs,
            benchmark_mode: self.cfg.profile.benchmark_mode,
            files: spec.dependencies.iter().map(|d| d.file_id).collect(),
            max_agents: self.cfg.max_agents,
        };
        let job_id = self.orchestrator.create_job(&job).await?;
        info!(
            target: "crackctl_audit",
            event = "job_created",
            batch = %seq,
            part = %index,
            phase = %phase,
            job_id = %job_id,
            priority = priority,
            benchmark = %self.cfg.profile.benchmark_mode,
            "job created"
        );

        self.store
            .record_part_submitted(
                seq,
                PartRecord {
                    index,
                    phase: phase.clone(),
                    job_id,
                    hashlist_id,
                    priority,
                    submitted_unix_ms: unix_time_ms(),
                    archived: false,
                    external_archive_pending: false,
                },
            )
            .await?;
        Ok(SubmitOutcome::Created { job_id, priority })
    }
}
