use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Batch sequence number. Monotonic; drives priority and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchSeq(pub u32);

impl fmt::Display for BatchSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B-{:04}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartIndex(pub u32);

impl fmt::Display for PartIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

macro_rules! external_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

external_id!(JobId);
external_id!(ChunkId);
external_id!(AgentId);
external_id!(FileId);
external_id!(HashlistId);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttackPhaseError {
    #[error("attack phase name must be non-empty")]
    Empty,
    #[error("attack phase name may only contain [a-z0-9-_], got {0:?}")]
    InvalidChar(String),
}

/// Name of one attack applied to every part of a batch, e.g. `brute-5`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttackPhase(String);

impl AttackPhase {
    pub fn parse(input: &str) -> Result<Self, AttackPhaseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AttackPhaseError::Empty);
        }
        let ok = input
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !ok {
            return Err(AttackPhaseError::InvalidChar(input.to_string()));
        }
        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AttackPhase {
    type Error = AttackPhaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AttackPhase> for String {
    fn from(value: AttackPhase) -> Self {
        value.0
    }
}

impl fmt::Display for AttackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open keyspace range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: u64,
    pub end: u64,
}

impl KeyRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Builds a range from the `skip`/`length` pair the orchestration server reports.
    pub fn from_skip_length(skip: u64, length: u64) -> Self {
        Self {
            start: skip,
            end: skip.saturating_add(length),
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Identity of one part: the idempotency triple for submission.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartKey {
    pub batch: BatchSeq,
    pub index: PartIndex,
    pub phase: AttackPhase,
}

impl fmt::Display for PartKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.batch, self.index, self.phase)
    }
}

/// Batch lifecycle state as recorded in the local state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Pending,
    Submitted,
    Running,
    Complete,
    Anomalous,
    Archived,
}

impl BatchState {
    fn rank(self) -> u8 {
        match self {
            BatchState::Pending => 0,
            BatchState::Submitted => 1,
            BatchState::Running => 2,
            BatchState::Complete | BatchState::Anomalous => 3,
            BatchState::Archived => 4,
        }
    }

    /// Forward-only transitions. `Complete` and `Anomalous` may swap with each other
    /// (an operator override resolves an anomaly); nothing leaves `Archived`, and
    /// `Archived` is reachable from `Complete` only.
    pub fn can_transition_to(self, next: BatchState) -> bool {
        if self == BatchState::Archived {
            return false;
        }
        if next == BatchState::Archived {
            return self == BatchState::Complete;
        }
        if self == next {
            return true;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Pending => "PENDING",
            BatchState::Submitted => "SUBMITTED",
            BatchState::Running => "RUNNING",
            BatchState::Complete => "COMPLETE",
            BatchState::Anomalous => "ANOMALOUS",
            BatchState::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One submitted part. Identity fields never change once recorded; only the
/// archive flags move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub index: PartIndex,
    pub phase: AttackPhase,
    pub job_id: JobId,
    pub hashlist_id: HashlistId,
    pub priority: u32,
    pub submitted_unix_ms: u64,
    #[serde(default)]
    pub archived: bool,
    /// Local archive committed, external archive/assignment cleanup not yet confirmed.
    #[serde(default)]
    pub external_archive_pending: bool,
}

impl PartRecord {
    pub fn key(&self, batch: BatchSeq) -> PartKey {
        PartKey {
            batch,
            index: self.index,
            phase: self.phase.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseApplication {
    pub phase: AttackPhase,
    pub cracked: u64,
    pub applied_unix_ms: u64,
}

/// Operator acknowledgement that a flagged crack-count deviation is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyOverride {
    pub index: PartIndex,
    pub phase: AttackPhase,
    pub operator: String,
    pub note: String,
    pub recorded_unix_ms: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchDefinitionError {
    #[error("a batch needs at least one attack phase")]
    NoPhases,
    #[error("a batch needs at least one part")]
    NoParts,
    #[error("attack phase {0} is listed twice")]
    DuplicatePhase(AttackPhase),
}

/// What an operator supplies to create a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDefinition {
    pub seq: BatchSeq,
    pub phases: Vec<AttackPhase>,
    /// One hashlist per part, in part order.
    pub part_hashlists: Vec<HashlistId>,
}

impl BatchDefinition {
    pub fn validate(&self) -> Result<(), BatchDefinitionError> {
        if self.phases.is_empty() {
            return Err(BatchDefinitionError::NoPhases);
        }
        if self.part_hashlists.is_empty() {
            return Err(BatchDefinitionError::NoParts);
        }
        for (i, phase) in self.phases.iter().enumerate() {
            if self.phases[..i].contains(phase) {
                return Err(BatchDefinitionError::DuplicatePhase(phase.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub seq: BatchSeq,
    pub phases: Vec<AttackPhase>,
    pub part_hashlists: Vec<HashlistId>,
    pub state: BatchState,
    #[serde(default)]
    pub parts: Vec<PartRecord>,
    #[serde(default)]
    pub phases_applied: Vec<PhaseApplication>,
    #[serde(default)]
    pub anomaly_overrides: Vec<AnomalyOverride>,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
}

impl BatchRecord {
    pub fn new(def: BatchDefinition, now_unix_ms: u64) -> Self {
        Self {
            seq: def.seq,
            phases: def.phases,
            part_hashlists: def.part_hashlists,
            state: BatchState::Pending,
            parts: Vec::new(),
            phases_applied: Vec::new(),
            anomaly_overrides: Vec::new(),
            created_unix_ms: now_unix_ms,
            updated_unix_ms: now_unix_ms,
        }
    }

    pub fn definition(&self) -> BatchDefinition {
        BatchDefinition {
            seq: self.seq,
            phases: self.phases.clone(),
            part_hashlists: self.part_hashlists.clone(),
        }
    }

    pub fn part_count(&self) -> u32 {
        self.part_hashlists.len() as u32
    }

    pub fn hashlist_for(&self, index: PartIndex) -> Option<HashlistId> {
        self.part_hashlists.get(index.0 as usize).copied()
    }

    pub fn part(&self, index: PartIndex, phase: &AttackPhase) -> Option<&PartRecord> {
        self.parts
            .iter()
            .find(|p| p.index == index && &p.phase == phase)
    }

    pub fn parts_for_phase<'a>(
        &'a self,
        phase: &'a AttackPhase,
    ) -> impl Iterator<Item = &'a PartRecord> + 'a {
        self.parts.iter().filter(move |p| &p.phase == phase)
    }

    /// Every (part, phase) pair the batch must eventually cover.
    pub fn expected_parts(&self) -> impl Iterator<Item = (PartIndex, &AttackPhase)> + '_ {
        self.phases
            .iter()
            .flat_map(move |phase| (0..self.part_count()).map(move |i| (PartIndex(i), phase)))
    }

    pub fn missing_parts(&self) -> Vec<PartKey> {
        self.expected_parts()
            .filter(|(index, phase)| self.part(*index, phase).is_none())
            .map(|(index, phase)| PartKey {
                batch: self.seq,
                index,
                phase: phase.clone(),
            })
            .collect()
    }

    pub fn is_phase_applied(&self, phase: &AttackPhase) -> bool {
        self.phases_applied.iter().any(|a| &a.phase == phase)
    }

    /// The earliest phase that has not been recorded as applied.
    pub fn next_phase(&self) -> Option<&AttackPhase> {
        self.phases.iter().find(|p| !self.is_phase_applied(p))
    }

    pub fn is_overridden(&self, index: PartIndex, phase: &AttackPhase) -> bool {
        self.anomaly_overrides
            .iter()
            .any(|o| o.index == index && &o.phase == phase)
    }

    pub fn pending_external_archive(&self) -> impl Iterator<Item = &PartRecord> + '_ {
        self.parts.iter().filter(|p| p.external_archive_pending)
    }
}

/// Raw agent row as reported by the orchestration server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub last_heartbeat_unix_s: Option<u64>,
    pub assigned_job: Option<JobId>,
    pub active: bool,
}

/// Raw job row. `advisory_progress_pct` is the server's derived figure and is
/// never used as a completion signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub keyspace: u64,
    pub keyspace_progress: u64,
    pub cracked: u64,
    pub priority: u32,
    pub advisory_progress_pct: Option<f64>,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkState {
    New,
    Dispatched,
    Finished,
    Aborted,
    Trimmed,
}

impl ChunkState {
    pub fn is_terminal_success(self) -> bool {
        matches!(self, ChunkState::Finished | ChunkState::Trimmed)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, ChunkState::New | ChunkState::Dispatched)
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkState::New => "NEW",
            ChunkState::Dispatched => "DISPATCHED",
            ChunkState::Finished => "FINISHED",
            ChunkState::Aborted => "ABORTED",
            ChunkState::Trimmed => "TRIMMED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub job_id: JobId,
    pub agent_id: Option<AgentId>,
    pub range: KeyRange,
    /// Checkpoint offset reported by the agent; the progress reading used for
    /// stuck detection.
    pub progress: u64,
    pub state: ChunkState,
    pub dispatched_unix_s: u64,
    pub cracked: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Healthy,
    Idle,
    Stale,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Wordlist,
    Rule,
    MaskFile,
}

/// A file a job needs on the worker side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    pub kind: DependencyKind,
    pub file_id: FileId,
    pub name: String,
}

/// Result of actually fetching a dependency the way a worker would.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DependencyProbe {
    Resolvable,
    /// The server has no metadata for the file.
    Missing { reason: String },
    /// Metadata exists but the fetch path fails.
    Unresolvable { reason: String },
}

/// Job creation request issued by the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub hashlist_id: HashlistId,
    pub attack_cmd: String,
    pub priority: u32,
    pub chunk_time_secs: u32,
    pub status_timer_secs: u32,
    pub benchmark_mode: crate::profile::BenchmarkMode,
    pub files: Vec<FileId>,
    pub max_agents: u32,
}
