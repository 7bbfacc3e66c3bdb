use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crackctl_client::{ChunkRemedy, ClientError};
use crackctl_core::types::{AgentId, ChunkId, ChunkState, PartKey};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::snapshot::ChunkObservation;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Stuck chunks younger than this are left alone.
    pub hard_intervention_age: Duration,
    /// Time a restarted agent gets before the next step.
    pub restart_grace: Duration,
    pub max_restart_attempts: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            hard_intervention_age: Duration::from_secs(45 * 60),
            restart_grace: Duration::from_secs(10 * 60),
            max_restart_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    Waited { reason: String },
    AgentRestarted { agent: AgentId, attempt: u32 },
    Aborted { reason: String },
}

#[derive(Debug, Clone, Copy)]
struct RestartHistory {
    attempts: u32,
    last_unix_s: u64,
}

/// Acts on STUCK chunks through [`ChunkRemedy`] and nothing else.
///
/// Restart history is in-memory and per chunk. The lock is never held across
/// an await.
pub struct StuckWorkResolver {
    remedy: Arc<dyn ChunkRemedy>,
    cfg: ResolverConfig,
    restarts: Mutex<HashMap<ChunkId, RestartHistory>>,
}

impl StuckWorkResolver {
    pub fn new(remedy: Arc<dyn ChunkRemedy>, cfg: ResolverConfig) -> Self {
        Self {
            remedy,
            cfg,
            restarts: Mutex::new(HashMap::new()),
        }
    }

    fn history(&self, chunk: ChunkId) -> Option<RestartHistory> {
        let map = self.restarts.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&chunk).copied()
    }

    fn record_restart(&self, chunk: ChunkId, now_unix_s: u64) -> u32 {
        let mut map = self.restarts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(chunk).or_insert(RestartHistory {
            attempts: 0,
            last_unix_s: now_unix_s,
        });
        entry.attempts += 1;
        entry.last_unix_s = now_unix_s;
        entry.attempts
    }

    fn forget(&self, chunk: ChunkId) {
        let mut map = self.restarts.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&chunk);
    }

    /// Drops restart history for every chunk not in `stuck`. A chunk that
    /// recovers and later sticks again starts over at attempt 1.
    pub fn retain_stuck(&self, stuck: &[ChunkId]) {
        let mut map = self.restarts.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|id, _| stuck.contains(id));
        let dropped = before - map.len();
        if dropped > 0 {
            debug!(dropped, "cleared restart history for recovered chunks");
        }
    }

    pub async fn resolve(
        &self,
        key: &PartKey,
        chunk: &ChunkObservation,
        now_unix_s: u64,
    ) -> Result<Resolution, ReconcileError> {
        let id = chunk.record.id;
        if !chunk.is_stuck() || chunk.record.state != ChunkState::Dispatched {
            return Err(ReconcileError::invariant(
                key.batch,
                format!("chunk {id} of {key} is not a STUCK dispatched chunk"),
            ));
        }

        if chunk.age_s < self.cfg.hard_intervention_age.as_secs() {
            return Ok(Resolution::Waited {
                reason: format!(
                    "age {}s below intervention threshold {}s",
                    chunk.age_s,
                    self.cfg.hard_intervention_age.as_secs()
                ),
            });
        }

        let history = self.history(id);
        if let Some(h) = history {
            let since = now_unix_s.saturating_sub(h.last_unix_s);
            if since < self.cfg.restart_grace.as_secs() {
                return Ok(Resolution::Waited {
                    reason: format!("agent restarted {since}s ago, within grace period"),
                });
            }
        }
        let attempts = history.map(|h| h.attempts).unwrap_or(0);

        let abort_reason = match chunk.record.agent_id {
            None => "chunk has no agent to restart".to_string(),
            Some(_) if attempts >= self.cfg.max_restart_attempts => {
                format!("{attempts} restart(s) did not unstick the chunk")
            }
            Some(agent) => match self.remedy.request_agent_restart(agent).await {
                Ok(()) => {
                    let attempt = self.record_restart(id, now_unix_s);
                    info!(
                        target: "crackctl_audit",
                        event = "agent_restart_requested",
                        batch = %key.batch,
                        part = %key.index,
                        phase = %key.phase,
                        chunk_id = %id,
                        agent_id = %agent,
                        attempt = attempt,
                        "requested agent restart for stuck chunk"
                    );
                    return Ok(Resolution::AgentRestarted { agent, attempt });
                }
                Err(err) if err.is_transient() => return Err(err.into()),
                Err(ClientError::Unsupported(why)) => format!("restart unavailable: {why}"),
                Err(err) => format!("restart rejected: {err}"),
            },
        };

        self.remedy.abort_chunk(id).await?;
        self.forget(id);
        warn!(
            target: "crackctl_audit",
            event = "chunk_aborted",
            batch = %key.batch,
            part = %key.index,
            phase = %key.phase,
            chunk_id = %id,
            reason = %abort_reason,
            "aborted stuck chunk"
        );
        Ok(Resolution::Aborted {
            reason: abort_reason,
        })
    }
}
