//! JSON shapes of the orchestration server's user API and their conversion
//! into core records.
//!
//! Every call is a `POST` of `{"section", "request", "accessKey", ...}`; every
//! reply carries `"response": "OK" | "ERROR"` plus request-specific fields.

use crackctl_core::profile::BenchmarkMode;
use crackctl_core::types::{self as core, AgentId, ChunkId, ChunkState, JobId, KeyRange};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("{field} must be non-empty")]
    EmptyField { field: &'static str },
    #[error("{field} is required")]
    MissingField { field: &'static str },
    #[error("{field} has unknown value {value}")]
    UnknownValue { field: &'static str, value: String },
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ConvertError> {
    if value.trim().is_empty() {
        return Err(ConvertError::EmptyField { field });
    }
    Ok(())
}

fn required<T: Copy>(field: &'static str, value: Option<T>) -> Result<T, ConvertError> {
    value.ok_or(ConvertError::MissingField { field })
}

pub trait ToWire<T> {
    fn to_wire(&self) -> T;
}

pub trait ToCore<T> {
    fn to_core(&self) -> T;
}

pub trait TryToCore<T> {
    type Error;
    fn try_to_core(&self) -> Result<T, Self::Error>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub response: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentListing {
    #[serde(default)]
    pub agents: Vec<AgentRow>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRow {
    pub agent_id: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LastActivity {
    #[serde(default)]
    pub time: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetail {
    pub agent_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub last_activity: Option<LastActivity>,
    #[serde(default)]
    pub assigned_task_id: Option<u64>,
}

impl TryToCore<core::AgentRecord> for AgentDetail {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::AgentRecord, Self::Error> {
        non_empty("agent.name", &self.name)?;
        Ok(core::AgentRecord {
            id: AgentId(self.agent_id),
            name: self.name.clone(),
            last_heartbeat_unix_s: self
                .last_activity
                .as_ref()
                .and_then(|a| a.time)
                .filter(|t| *t > 0),
            assigned_job: self.assigned_task_id.filter(|t| *t > 0).map(JobId),
            active: self.is_active,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskListing {
    #[serde(default)]
    pub tasks: Vec<TaskRow>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub task_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_archived: bool,
}

impl ToCore<core::JobSummary> for TaskRow {
    fn to_core(&self) -> core::JobSummary {
        core::JobSummary {
            id: JobId(self.task_id),
            name: self.name.clone(),
            archived: self.is_archived,
        }
    }
}

/// `getTask` reply. `searched` is the server's own progress figure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetail {
    pub task_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub keyspace: Option<u64>,
    #[serde(default)]
    pub keyspace_progress: Option<u64>,
    #[serde(default)]
    pub searched: Option<u64>,
    #[serde(default)]
    pub cracked: Option<u64>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub chunk_ids: Vec<u64>,
}

impl TryToCore<core::JobRecord> for TaskDetail {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::JobRecord, Self::Error> {
        non_empty("task.name", &self.name)?;
        let keyspace = required("task.keyspace", self.keyspace)?;
        let advisory_progress_pct = match (self.searched, keyspace) {
            (Some(searched), ks) if ks > 0 => Some(searched as f64 * 100.0 / ks as f64),
            _ => None,
        };
        Ok(core::JobRecord {
            id: JobId(self.task_id),
            name: self.name.clone(),
            keyspace,
            keyspace_progress: required("task.keyspaceProgress", self.keyspace_progress)?,
            cracked: required("task.cracked", self.cracked)?,
            priority: required("task.priority", self.priority)?,
            advisory_progress_pct,
            archived: self.is_archived,
        })
    }
}

/// `getChunk` reply. `state` is the cracker's numeric status code.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDetail {
    pub chunk_id: u64,
    pub task_id: u64,
    #[serde(default)]
    pub agent_id: Option<u64>,
    pub start: u64,
    pub length: u64,
    #[serde(default)]
    pub checkpoint: u64,
    pub state: u8,
    #[serde(default)]
    pub dispatch_time: u64,
    #[serde(default)]
    pub cracked: u64,
}

/// Status codes: 0 init, 1 autotune, 2 running, 3 paused, 4 exhausted,
/// 5 cracked, 6 aborted, 7 quit, 8 bypass, 9 trimmed, 10 aborted checkpoint,
/// 11 aborted runtime.
fn chunk_state(code: u8, dispatched: bool) -> Result<ChunkState, ConvertError> {
    match code {
        0 if !dispatched => Ok(ChunkState::New),
        0..=3 => Ok(ChunkState::Dispatched),
        4 | 5 | 8 => Ok(ChunkState::Finished),
        6 | 7 | 10 | 11 => Ok(ChunkState::Aborted),
        9 => Ok(ChunkState::Trimmed),
        other => Err(ConvertError::UnknownValue {
            field: "chunk.state",
            value: other.to_string(),
        }),
    }
}

impl TryToCore<core::ChunkRecord> for ChunkDetail {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::ChunkRecord, Self::Error> {
        let agent_id = self.agent_id.filter(|a| *a > 0).map(AgentId);
        let state = chunk_state(self.state, agent_id.is_some() && self.dispatch_time > 0)?;
        Ok(core::ChunkRecord {
            id: ChunkId(self.chunk_id),
            job_id: JobId(self.task_id),
            agent_id,
            range: KeyRange::from_skip_length(self.start, self.length),
            progress: self.checkpoint,
            state,
            dispatched_unix_s: self.dispatch_time,
            cracked: self.cracked,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTask {
    pub task_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDetail {
    pub file_id: u64,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTask {
    pub name: String,
    pub hashlist_id: u64,
    pub attack_cmd: String,
    pub chunksize: u32,
    pub status_timer: u32,
    pub benchmark_type: String,
    pub is_cpu_only: bool,
    pub is_small: bool,
    pub skip: u64,
    pub cracker_version_id: u64,
    pub files: Vec<u64>,
    pub priority: u32,
    pub max_agents: u32,
    pub preprocessor_id: u64,
    pub preprocessor_command: String,
}

pub fn benchmark_type(mode: BenchmarkMode) -> &'static str {
    match mode {
        BenchmarkMode::Speed => "speed",
        BenchmarkMode::Runtime => "runtime",
    }
}

impl ToWire<CreateTask> for core::NewJob {
    fn to_wire(&self) -> CreateTask {
        CreateTask {
            name: self.name.clone(),
            hashlist_id: self.hashlist_id.0,
            attack_cmd: self.attack_cmd.clone(),
            chunksize: self.chunk_time_secs,
            status_timer: self.status_timer_secs,
            benchmark_type: benchmark_type(self.benchmark_mode).to_string(),
            is_cpu_only: false,
            is_small: false,
            skip: 0,
            cracker_version_id: 1,
            files: self.files.iter().map(|f| f.0).collect(),
            priority: self.priority,
            max_agents: self.max_agents,
            preprocessor_id: 0,
            preprocessor_command: String::new(),
        }
    }
}
