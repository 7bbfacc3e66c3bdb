//! Immutable, timestamped read of agents, jobs and chunks for one tick.

use std::collections::BTreeMap;

use crackctl_core::observed::Observed;
use crackctl_core::summary::{AgentHealthCounts, SnapshotSummary};
use crackctl_core::types::{
    AgentHealth, AgentRecord, BatchSeq, ChunkId, ChunkRecord, JobId, JobRecord, PartKey,
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentObservation {
    pub record: AgentRecord,
    pub health: AgentHealth,
    /// `None` when the agent never reported a heartbeat.
    pub heartbeat_age_s: Option<u64>,
}

/// Result of the two-reading progress check on an old DISPATCHED chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum StuckVerdict {
    /// Not DISPATCHED, or younger than the staleness age.
    NotChecked,
    Progressing { first: u64, second: u64 },
    Stuck { progress: u64 },
    /// The second reading could not be taken.
    Unknown { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkObservation {
    pub record: ChunkRecord,
    pub age_s: u64,
    pub stuck: StuckVerdict,
}

impl ChunkObservation {
    pub fn is_stuck(&self) -> bool {
        matches!(self.stuck, StuckVerdict::Stuck { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartObservation {
    pub job_id: JobId,
    pub job: Observed<JobRecord>,
    pub chunks: Observed<Vec<ChunkObservation>>,
}

impl PartObservation {
    pub fn unavailable(job_id: JobId, reason: &str) -> Self {
        Self {
            job_id,
            job: Observed::unavailable(reason),
            chunks: Observed::unavailable(reason),
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.job.is_known() || !self.chunks.is_known()
    }

    pub fn chunk_records(&self) -> Observed<Vec<&ChunkRecord>> {
        self.chunks
            .as_ref()
            .map(|chunks| chunks.iter().map(|c| &c.record).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub taken_unix_s: u64,
    pub agents: Observed<Vec<AgentObservation>>,
    pub parts: BTreeMap<PartKey, PartObservation>,
}

impl Snapshot {
    pub fn part(&self, key: &PartKey) -> Option<&PartObservation> {
        self.parts.get(key)
    }

    pub fn batch_parts(
        &self,
        seq: BatchSeq,
    ) -> impl Iterator<Item = (&PartKey, &PartObservation)> + '_ {
        self.parts.iter().filter(move |(k, _)| k.batch == seq)
    }

    pub fn agent_health_counts(&self) -> Observed<AgentHealthCounts> {
        self.agents.as_ref().map(|agents| {
            let mut counts = AgentHealthCounts::default();
            for a in agents {
                counts.record(a.health);
            }
            counts
        })
    }

    /// Unavailable when the part was not observed or its job query failed.
    pub fn crack_count(&self, key: &PartKey) -> Observed<u64> {
        match self.parts.get(key) {
            Some(obs) => obs.job.as_ref().map(|j| j.cracked),
            None => Observed::unavailable(format!("{key} not observed")),
        }
    }


    pub fn is_batch_degraded(&self, seq: BatchSeq) -> bool {
        self.batch_parts(seq).any(|(_, obs)| obs.is_degraded())
    }

    pub fn is_degraded(&self) -> bool {
        !self.agents.is_known() || self.parts.values().any(PartObservation::is_degraded)
    }

    pub fn stuck_chunks(&self) -> Vec<(&PartKey, &ChunkObservation)> {
        let mut out = Vec::new();
        for (key, obs) in &self.parts {
            if let Some(chunks) = obs.chunks.known() {
                out.extend(chunks.iter().filter(|c| c.is_stuck()).map(|c| (key, c)));
            }
        }
        out
    }

    pub fn stuck_chunk_ids(&self) -> Vec<ChunkId> {
        self.stuck_chunks()
            .into_iter()
            .map(|(_, c)| c.record.id)
            .collect()
    }

    pub fn summary(&self) -> SnapshotSummary {
        let mut degraded_batches: Vec<BatchSeq> = self
            .parts
            .iter()
            .filter(|(_, obs)| obs.is_degraded())
            .map(|(k, _)| k.batch)
            .collect();
        degraded_batches.dedup();
        let parts_unavailable = self.parts.values().filter(|o| o.is_degraded()).count() as u64;
        SnapshotSummary {
            taken_unix_s: self.taken_unix_s,
            agents: self.agent_health_counts(),
            parts_observed: self.parts.len() as u64 - parts_unavailable,
            parts_unavailable,
            degraded_batches,
            stuck_chunks: self.stuck_chunk_ids(),
        }
    }
}
