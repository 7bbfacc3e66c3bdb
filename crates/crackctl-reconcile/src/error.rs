use crackctl_client::ClientError;
use crackctl_core::types::{BatchSeq, PartKey};
use crackctl_state::StateStoreError;
use serde::Serialize;
use thiserror::Error;

/// How an error is handled by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retried with backoff inside the call; otherwise left for the next tick.
    TransientNetwork,
    /// Never retried; the mutation it guards does not happen.
    InvariantViolation,
    /// Data needed for a decision is unavailable; treated as unknown.
    QueryDegraded,
    /// The server contradicts itself or local state; needs an operator.
    ExternalStateAnomaly,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store: {0}")]
    Store(#[from] StateStoreError),
    #[error("state store task failed: {0}")]
    StoreTask(String),
    #[error("orchestration server: {0}")]
    Client(#[from] ClientError),
    #[error("invariant violated for {batch}: {reason}")]
    Invariant { batch: BatchSeq, reason: String },
    #[error("dependency {name:?} of {key} is not resolvable: {reason}")]
    Dependency {
        key: PartKey,
        name: String,
        reason: String,
    },
    #[error("query degraded: {0}")]
    Degraded(String),
    #[error("external state anomaly: {0}")]
    ExternalAnomaly(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ReconcileError {
    pub(crate) fn invariant(batch: BatchSeq, reason: impl Into<String>) -> Self {
        ReconcileError::Invariant {
            batch,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::Store(StateStoreError::LockBusy(_)) => ErrorKind::TransientNetwork,
            ReconcileError::Store(_) | ReconcileError::StoreTask(_) => ErrorKind::InvariantViolation,
            ReconcileError::Client(err) if err.is_transient() => ErrorKind::TransientNetwork,
            ReconcileError::Client(ClientError::Decode { .. } | ClientError::Convert(_)) => {
                ErrorKind::QueryDegraded
            }
            ReconcileError::Client(ClientError::Unsupported(_)) => ErrorKind::InvariantViolation,
            ReconcileError::Client(_) => ErrorKind::ExternalStateAnomaly,
            ReconcileError::Invariant { .. }
            | ReconcileError::Dependency { .. }
            | ReconcileError::Config(_) => ErrorKind::InvariantViolation,
            ReconcileError::Degraded(_) => ErrorKind::QueryDegraded,
            ReconcileError::ExternalAnomaly(_) => ErrorKind::ExternalStateAnomaly,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }
}
