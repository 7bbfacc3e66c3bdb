//! Ground-truth completion and cross-part anomalies, computed from chunk
//! ranges only. The server's own progress figure is reported, never trusted.

use crackctl_core::observed::Observed;
use crackctl_core::types::{
    AttackPhase, BatchRecord, BatchSeq, ChunkRecord, ChunkState, JobId, JobRecord, KeyRange,
    PartKey,
};
use serde::Serialize;

use crate::coverage;
use crate::error::ReconcileError;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// A part is anomalous when its count sits more than `multiple` stddevs
    /// from the mean of the other parts in its group.
    pub anomaly_stddev_multiple: f64,
    pub min_anomaly_group: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            anomaly_stddev_multiple: 2.0,
            min_anomaly_group: 3,
        }
    }
}

impl EvaluatorConfig {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if !self.anomaly_stddev_multiple.is_finite() || self.anomaly_stddev_multiple <= 0.0 {
            return Err(ReconcileError::Config(format!(
                "anomaly stddev multiple must be positive, got {}",
                self.anomaly_stddev_multiple
            )));
        }
        if self.min_anomaly_group < 2 {
            return Err(ReconcileError::Config(format!(
                "anomaly groups need at least 2 parts, got {}",
                self.min_anomaly_group
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "completion", rename_all = "snake_case")]
pub enum PartCompletion {
    Complete,
    Incomplete { reason: String },
    Unknown { reason: String },
}

impl PartCompletion {
    pub fn is_complete(&self) -> bool {
        matches!(self, PartCompletion::Complete)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartStatus {
    pub key: PartKey,
    pub job_id: Option<JobId>,
    pub completion: PartCompletion,
    pub cracked: Observed<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
    Complete,
    Running,
    Anomalous,
    InsufficientInformation { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub key: PartKey,
    pub cracked: u64,
    pub peer_mean: f64,
    pub peer_stddev: f64,
    pub overridden: bool,
}

/// Server progress reads complete while local evaluation disagrees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvisoryDisagreement {
    pub key: PartKey,
    pub job_id: JobId,
    pub advisory_progress_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub batch: BatchSeq,
    pub parts: Vec<PartStatus>,
    pub status: BatchStatus,
    pub anomalies: Vec<Anomaly>,
    pub advisory_disagreements: Vec<AdvisoryDisagreement>,
}

impl Evaluation {
    pub fn part(&self, key: &PartKey) -> Option<&PartStatus> {
        self.parts.iter().find(|p| &p.key == key)
    }

    pub fn unresolved_anomalies(&self) -> impl Iterator<Item = &Anomaly> + '_ {
        self.anomalies.iter().filter(|a| !a.overridden)
    }

    /// Every part of `phase` is submitted and complete.
    pub fn is_phase_complete(&self, phase: &AttackPhase) -> bool {
        let mut any = false;
        for p in self.parts.iter().filter(|p| &p.key.phase == phase) {
            any = true;
            if !p.completion.is_complete() {
                return false;
            }
        }
        any
    }

    pub fn phase_cracked(&self, phase: &AttackPhase) -> Observed<u64> {
        self.parts
            .iter()
            .filter(|p| &p.key.phase == phase)
            .map(|p| p.cracked.clone())
            .collect::<Observed<Vec<u64>>>()
            .map(|v| v.iter().sum())
    }
}

/// Terminal-success chunks as a merged range list.
pub fn finished_ranges<'a>(chunks: impl IntoIterator<Item = &'a ChunkRecord>) -> Vec<KeyRange> {
    coverage::union(
        chunks
            .into_iter()
            .filter(|c| c.state.is_terminal_success())
            .map(|c| c.range),
    )
}

/// An ABORTED chunk is superseded once terminal-success chunks cover its range.
pub fn is_superseded(chunk: &ChunkRecord, finished: &[KeyRange]) -> bool {
    chunk.state == ChunkState::Aborted && coverage::covers(chunk.range, finished)
}

/// COMPLETE iff every chunk is terminal-success (or a superseded ABORTED one)
/// and the finished ranges cover `[0, keyspace)`.
pub fn part_completion(job: &JobRecord, chunks: &[&ChunkRecord]) -> PartCompletion {
    if job.keyspace == 0 {
        return PartCompletion::Incomplete {
            reason: "declared keyspace is zero".to_string(),
        };
    }
    if chunks.is_empty() {
        return PartCompletion::Incomplete {
            reason: "no chunks dispatched".to_string(),
        };
    }
    let finished = finished_ranges(chunks.iter().copied());
    for c in chunks {
        if c.state.is_terminal_success() || is_superseded(c, &finished) {
            continue;
        }
        return PartCompletion::Incomplete {
            reason: format!("chunk {} is {} over {}", c.id, c.state, c.range),
        };
    }
    let gaps = coverage::uncovered(KeyRange::new(0, job.keyspace), &finished);
    if let Some(first) = gaps.first() {
        return PartCompletion::Incomplete {
            reason: format!(
                "keyspace not covered: {} gap(s), first {first}",
                gaps.len()
            ),
        };
    }
    PartCompletion::Complete
}

pub fn evaluate(snapshot: &Snapshot, rec: &BatchRecord, cfg: &EvaluatorConfig) -> Evaluation {
    let mut parts = Vec::new();
    let mut advisory_disagreements = Vec::new();

    for (index, phase) in rec.expected_parts() {
        let key = PartKey {
            batch: rec.seq,
            index,
            phase: phase.clone(),
        };
        let Some(part) = rec.part(index, phase) else {
            parts.push(PartStatus {
                key,
                job_id: None,
                completion: PartCompletion::Incomplete {
                    reason: "not submitted".to_string(),
                },
                cracked: Observed::unavailable("not submitted"),
            });
            continue;
        };

        let (completion, cracked) = match snapshot.part(&key) {
            None => (
                PartCompletion::Unknown {
                    reason: "not in snapshot".to_string(),
                },
                Observed::unavailable("not in snapshot"),
            ),
            Some(obs) => {
                let cracked = obs.job.as_ref().map(|j| j.cracked);
                let completion = match (obs.job.known(), obs.chunk_records()) {
                    (Some(job), Observed::Known(chunks)) => part_completion(job, &chunks),
                    (None, _) => PartCompletion::Unknown {
                        reason: "job query unavailable".to_string(),
                    },
                    (_, Observed::Unavailable(u)) => PartCompletion::Unknown {
                        reason: format!("chunks {u}"),
                    },
                };
                if let Some(job) = obs.job.known() {
                    if let Some(pct) = job.advisory_progress_pct {
                        if pct >= 100.0 && !completion.is_complete() {
                            advisory_disagreements.push(AdvisoryDisagreement {
                                key: key.clone(),
                                job_id: part.job_id,
                                advisory_progress_pct: pct,
                            });
                        }
                    }
                }
                (completion, cracked)
            }
        };

        parts.push(PartStatus {
            key,
            job_id: Some(part.job_id),
            completion,
            cracked,
        });
    }

    let anomalies = detect_anomalies(rec, &parts, cfg);
    let status = batch_status(&parts, &anomalies);

    Evaluation {
        batch: rec.seq,
        parts,
        status,
        anomalies,
        advisory_disagreements,
    }
}

fn batch_status(parts: &[PartStatus], anomalies: &[Anomaly]) -> BatchStatus {
    if let Some(unknown) = parts.iter().find_map(|p| match &p.completion {
        PartCompletion::Unknown { reason } => Some(format!("{}: {reason}", p.key)),
        _ => None,
    }) {
        return BatchStatus::InsufficientInformation { reason: unknown };
    }
    if parts.iter().any(|p| !p.completion.is_complete()) {
        return BatchStatus::Running;
    }
    if anomalies.iter().any(|a| !a.overridden) {
        return BatchStatus::Anomalous;
    }
    BatchStatus::Complete
}

/// Groups are (batch, phase). Only fully complete groups with every crack
/// count known are judged; partial counts are not comparable.
fn detect_anomalies(rec: &BatchRecord, parts: &[PartStatus], cfg: &EvaluatorConfig) -> Vec<Anomaly> {
    let mut out = Vec::new();
    for phase in &rec.phases {
        let group: Vec<&PartStatus> = parts.iter().filter(|p| &p.key.phase == phase).collect();
        if group.len() < cfg.min_anomaly_group
            || group.iter().any(|p| !p.completion.is_complete())
        {
            continue;
        }
        let Observed::Known(counts) = group
            .iter()
            .map(|p| p.cracked.clone())
            .collect::<Observed<Vec<u64>>>()
        else {
            continue;
        };

        for outlier in outliers(&counts, cfg.anomaly_stddev_multiple) {
            let p = group[outlier.index];
            out.push(Anomaly {
                key: p.key.clone(),
                cracked: counts[outlier.index],
                peer_mean: outlier.peer_mean,
                peer_stddev: outlier.peer_stddev,
                overridden: rec.is_overridden(p.key.index, &p.key.phase),
            });
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Outlier {
    index: usize,
    peer_mean: f64,
    peer_stddev: f64,
}

/// Judges each count against the mean and stddev of the *other* counts, so an
/// outlier never inflates its own yardstick. The stddev is floored at
/// `sqrt(mean)`, the counting noise of a crack total, which keeps identical
/// peers from flagging a difference of one.
fn outliers(counts: &[u64], multiple: f64) -> Vec<Outlier> {
    let mut out = Vec::new();
    if counts.len() < 2 {
        return out;
    }
    let total: f64 = counts.iter().map(|c| *c as f64).sum();
    let total_sq: f64 = counts.iter().map(|c| (*c as f64).powi(2)).sum();
    let peers = (counts.len() - 1) as f64;

    for (index, c) in counts.iter().enumerate() {
        let x = *c as f64;
        let peer_mean = (total - x) / peers;
        let peer_var = ((total_sq - x * x) / peers - peer_mean * peer_mean).max(0.0);
        let peer_stddev = peer_var.sqrt();
        let yardstick = peer_stddev.max(peer_mean.sqrt());
        if yardstick > 0.0 && (x - peer_mean).abs() > multiple * yardstick {
            out.push(Outlier {
                index,
                peer_mean,
                peer_stddev,
            });
        }
    }
    out
}
