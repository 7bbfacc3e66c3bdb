#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod http;
pub mod retry;
pub mod wire;

use async_trait::async_trait;
use crackctl_core::types::{
    AgentId, AgentRecord, ChunkId, ChunkRecord, DependencyProbe, DependencyRef, JobId, JobRecord,
    JobSummary, NewJob,
};
use thiserror::Error;

pub use http::{HttpConfig, HttpOrchestrator, HttpRemedy};
pub use retry::RetryPolicy;
pub use wire::ConvertError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transient failure on {what}: {message}")]
    Transient { what: String, message: String },
    #[error("{section}/{request} rejected by server: {message}")]
    Rejected {
        section: &'static str,
        request: &'static str,
        message: String,
    },
    #[error("{what} returned http {status}")]
    Status { what: String, status: u16 },
    #[error("decode {what}: {message}")]
    Decode { what: String, message: String },
    #[error("convert: {0}")]
    Convert(#[from] ConvertError),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl ClientError {
    /// Retryable on a later tick; never a reason to assume anything about
    /// server state.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient { .. })
    }
}

/// Everything the controller reads from or writes to the orchestration server.
///
/// Writes are limited to job creation, the archive flag, assignment clearing
/// and (through [`ChunkRemedy`]) chunk abort.
#[async_trait]
pub trait Orchestrator: Send + Sync + 'static {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, ClientError>;
    async fn list_jobs(&self) -> Result<Vec<JobSummary>, ClientError>;
    async fn get_job(&self, job: JobId) -> Result<JobRecord, ClientError>;
    async fn list_chunks(&self, job: JobId) -> Result<Vec<ChunkRecord>, ClientError>;

    async fn create_job(&self, job: &NewJob) -> Result<JobId, ClientError>;
    async fn archive_job(&self, job: JobId) -> Result<(), ClientError>;
    async fn clear_agent_assignment(&self, agent: AgentId) -> Result<(), ClientError>;

    /// Fetches the dependency through the same path a worker would use.
    async fn check_dependency(&self, dep: &DependencyRef) -> Result<DependencyProbe, ClientError>;
}

/// The only two mutations allowed on wedged work.
#[async_trait]
pub trait ChunkRemedy: Send + Sync + 'static {
    /// `ClientError::Unsupported` when no lifecycle-control channel exists.
    async fn request_agent_restart(&self, agent: AgentId) -> Result<(), ClientError>;
    /// DISPATCHED → ABORTED only.
    async fn abort_chunk(&self, chunk: ChunkId) -> Result<(), ClientError>;
}
