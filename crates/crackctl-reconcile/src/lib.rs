#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Reconciliation and safety layer: observe the orchestration server, decide
//! locally, and gate every mutation.
//!
//! One tick runs [`collector::SnapshotCollector::collect`], then per batch
//! [`evaluator::evaluate`], the [`archiver::SafeArchiver`] gates, the
//! [`resolver::StuckWorkResolver`] and the [`submitter::Submitter`].

pub mod archiver;
pub mod collector;
pub mod control;
pub mod coverage;
pub mod error;
pub mod evaluator;
pub mod locks;
pub mod report;
pub mod resolver;
pub mod snapshot;
pub mod store_io;
pub mod submitter;

pub use archiver::{ArchiveMode, ArchiveOutcome, Gate, GateFailure, SafeArchiver};
pub use collector::{CollectorConfig, SnapshotCollector};
pub use control::{ControlConfig, ControlLoop, LoopConfig, LoopMetrics};
pub use error::{ErrorKind, ReconcileError};
pub use evaluator::{evaluate, BatchStatus, Evaluation, EvaluatorConfig};
pub use locks::BatchLocks;
pub use report::{Health, OperatorReport};
pub use resolver::{Resolution, ResolverConfig, StuckWorkResolver};
pub use snapshot::Snapshot;
pub use submitter::{next_submissions, SubmitOutcome, Submitter, SubmitterConfig};
