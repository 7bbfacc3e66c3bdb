use serde::{Deserialize, Serialize};

use crate::observed::Observed;
use crate::types::{AgentHealth, BatchSeq, ChunkId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHealthCounts {
    pub healthy: u64,
    pub idle: u64,
    pub stale: u64,
    pub critical: u64,
}

impl AgentHealthCounts {
    pub fn record(&mut self, health: AgentHealth) {
        match health {
            AgentHealth::Healthy => self.healthy += 1,
            AgentHealth::Idle => self.idle += 1,
            AgentHealth::Stale => self.stale += 1,
            AgentHealth::Critical => self.critical += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.healthy + self.idle + self.stale + self.critical
    }
}

/// What the state store keeps of the last snapshot. The snapshot itself is
/// never persisted as truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub taken_unix_s: u64,
    pub agents: Observed<AgentHealthCounts>,
    pub parts_observed: u64,
    pub parts_unavailable: u64,
    pub degraded_batches: Vec<BatchSeq>,
    pub stuck_chunks: Vec<ChunkId>,
}
