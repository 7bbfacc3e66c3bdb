use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crackctl_client::{ClientError, Orchestrator};
use crackctl_core::observed::Observed;
use crackctl_core::types::{
    AgentHealth, AgentRecord, BatchRecord, ChunkId, ChunkRecord, ChunkState, JobId,
};
use crackctl_observe::time::unix_time_secs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::ReconcileError;
use crate::snapshot::{AgentObservation, ChunkObservation, PartObservation, Snapshot, StuckVerdict};

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub heartbeat_stale_after: Duration,
    pub heartbeat_critical_after: Duration,
    /// DISPATCHED chunks older than this get a second progress reading.
    pub chunk_stale_after: Duration,
    pub sample_window: Duration,
    pub max_concurrency: usize,
    /// Everything not observed within this budget is marked unavailable.
    pub tick_deadline: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_stale_after: Duration::from_secs(120),
            heartbeat_critical_after: Duration::from_secs(300),
            chunk_stale_after: Duration::from_secs(15 * 60),
            sample_window: Duration::from_secs(20),
            max_concurrency: 8,
            tick_deadline: Duration::from_secs(28),
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.heartbeat_stale_after >= self.heartbeat_critical_after {
            return Err(ReconcileError::Config(format!(
                "heartbeat stale threshold {:?} must be below critical threshold {:?}",
                self.heartbeat_stale_after, self.heartbeat_critical_after
            )));
        }
        if self.sample_window.is_zero() || self.sample_window >= self.tick_deadline {
            return Err(ReconcileError::Config(format!(
                "sample window {:?} must be non-zero and below the tick deadline {:?}",
                self.sample_window, self.tick_deadline
            )));
        }
        if self.chunk_stale_after.is_zero() {
            return Err(ReconcileError::Config(
                "chunk staleness age must be non-zero".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ReconcileError::Config(
                "collector concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// `idle` whenever nothing is assigned; otherwise by heartbeat age.
pub fn classify_agent(agent: &AgentRecord, now_unix_s: u64, cfg: &CollectorConfig) -> AgentHealth {
    if agent.assigned_job.is_none() {
        return AgentHealth::Idle;
    }
    let Some(heartbeat) = agent.last_heartbeat_unix_s else {
        return AgentHealth::Critical;
    };
    let age = now_unix_s.saturating_sub(heartbeat);
    if age > cfg.heartbeat_critical_after.as_secs() {
        AgentHealth::Critical
    } else if age > cfg.heartbeat_stale_after.as_secs() {
        AgentHealth::Stale
    } else {
        AgentHealth::Healthy
    }
}

/// Read-only: issues queries only, never a mutation.
#[derive(Clone)]
pub struct SnapshotCollector {
    orchestrator: Arc<dyn Orchestrator>,
    cfg: CollectorConfig,
}

impl SnapshotCollector {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, cfg: CollectorConfig) -> Self {
        Self { orchestrator, cfg }
    }

    /// Observes every submitted part of `batches`. Never fails: anything that
    /// could not be read is carried as [`Observed::Unavailable`], and
    /// [`Snapshot::is_degraded`] reports whether that happened.
    pub async fn collect(&self, batches: &[BatchRecord]) -> Snapshot {
        let deadline = Instant::now() + self.cfg.tick_deadline;
        let now_s = unix_time_secs();

        let agents = match timeout_at(deadline, self.orchestrator.list_agents()).await {
            Ok(Ok(agents)) => Observed::Known(
                agents
                    .into_iter()
                    .map(|record| AgentObservation {
                        health: classify_agent(&record, now_s, &self.cfg),
                        heartbeat_age_s: record
                            .last_heartbeat_unix_s
                            .map(|hb| now_s.saturating_sub(hb)),
                        record,
                    })
                    .collect(),
            ),
            Ok(Err(err)) => {
                warn!(error = %err, "agent query failed");
                Observed::unavailable(format!("list agents: {err}"))
            }
            Err(_) => Observed::unavailable("list agents: tick deadline exceeded"),
        };

        let sem = Arc::new(Semaphore::new(self.cfg.max_concurrency));
        let mut parts = BTreeMap::new();
        let mut set = JoinSet::new();
        for batch in batches {
            for part in &batch.parts {
                let key = part.key(batch.seq);
                let job_id = part.job_id;
                parts.insert(
                    key.clone(),
                    PartObservation::unavailable(job_id, "not observed"),
                );

                let orchestrator = self.orchestrator.clone();
                let sem = sem.clone();
                let cfg = self.cfg.clone();
                set.spawn(async move {
                    let observed = timeout_at(
                        deadline,
                        observe_part(orchestrator.as_ref(), &sem, &cfg, job_id, now_s),
                    )
                    .await;
                    let obs = match observed {
                        Ok(obs) => obs,
                        Err(_) => {
                            warn!(
                                batch = %key.batch,
                                part = %key.index,
                                phase = %key.phase,
                                job_id = %job_id,
                                "part query missed the tick deadline"
                            );
                            PartObservation::unavailable(job_id, "tick deadline exceeded")
                        }
                    };
                    (key, obs)
                });
            }
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((key, obs)) => {
                    parts.insert(key, obs);
                }
                Err(err) => warn!(error = %err, "part observation task failed"),
            }
        }

        Snapshot {
            taken_unix_s: now_s,
            agents,
            parts,
        }
    }
}

async fn observe_part(
    orchestrator: &dyn Orchestrator,
    sem: &Semaphore,
    cfg: &CollectorConfig,
    job_id: JobId,
    now_s: u64,
) -> PartObservation {
    let (job, first) = {
        let Ok(_permit) = sem.acquire().await else {
            return PartObservation::unavailable(job_id, "collector shut down");
        };
        let job = Observed::from(orchestrator.get_job(job_id).await);
        let chunks = orchestrator.list_chunks(job_id).await;
        (job, chunks)
    };

    let first = match first {
        Ok(chunks) => chunks,
        Err(err) => {
            debug!(job_id = %job_id, error = %err, "chunk query failed");
            return PartObservation {
                job_id,
                job,
                chunks: Observed::unavailable(format!("list chunks: {err}")),
            };
        }
    };

    let stale_after_s = cfg.chunk_stale_after.as_secs();
    let candidates: Vec<&ChunkRecord> = first
        .iter()
        .filter(|c| {
            c.state == ChunkState::Dispatched
                && now_s.saturating_sub(c.dispatched_unix_s) >= stale_after_s
        })
        .collect();

    let second = if candidates.is_empty() {
        None
    } else {
        tokio::time::sleep(cfg.sample_window).await;
        let Ok(_permit) = sem.acquire().await else {
            return PartObservation::unavailable(job_id, "collector shut down");
        };
        Some(second_reading(orchestrator, job_id).await)
    };

    let chunks = first
        .iter()
        .map(|c| {
            let age_s = now_s.saturating_sub(c.dispatched_unix_s);
            let stuck = match &second {
                Some(second) if c.state == ChunkState::Dispatched && age_s >= stale_after_s => {
                    verdict(c, second)
                }
                _ => StuckVerdict::NotChecked,
            };
            ChunkObservation {
                record: c.clone(),
                age_s,
                stuck,
            }
        })
        .collect();

    PartObservation {
        job_id,
        job,
        chunks: Observed::Known(chunks),
    }
}

async fn second_reading(
    orchestrator: &dyn Orchestrator,
    job_id: JobId,
) -> Result<HashMap<ChunkId, ChunkRecord>, ClientError> {
    let chunks = orchestrator.list_chunks(job_id).await?;
    Ok(chunks.into_iter().map(|c| (c.id, c)).collect())
}

fn verdict(
    first: &ChunkRecord,
    second: &Result<HashMap<ChunkId, ChunkRecord>, ClientError>,
) -> StuckVerdict {
    let second = match second {
        Ok(map) => map,
        Err(err) => {
            return StuckVerdict::Unknown {
                reason: format!("second reading failed: {err}"),
            }
        }
    };
    let Some(again) = second.get(&first.id) else {
        return StuckVerdict::Unknown {
            reason: "chunk vanished between readings".to_string(),
        };
    };
    if again.state != ChunkState::Dispatched {
        return StuckVerdict::Progressing {
            first: first.progress,
            second: again.progress,
        };
    }
    if again.progress == first.progress {
        StuckVerdict::Stuck {
            progress: first.progress,
        }
    } else {
        StuckVerdict::Progressing {
            first: first.progress,
            second: again.progress,
        }
    }
}
