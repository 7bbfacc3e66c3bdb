use std::fmt;

use thiserror::Error;

use crate::types::{AttackPhase, AttackPhaseError, BatchSeq, PartIndex, PartKey};

/// Prefix that marks a job as created by this controller.
pub const JOB_NAME_PREFIX: &str = "crackctl";

/// External job name that encodes the (batch, part, phase) triple.
///
/// Format: `crackctl/B-0042/p3/brute-5`. The submitter looks jobs up by this
/// name, so it must round-trip exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobName(PartKey);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobNameParseError {
    #[error("empty job name")]
    Empty,
    #[error("job name is not owned by this controller")]
    ForeignPrefix,
    #[error("invalid batch segment; expected 'B-<number>'")]
    InvalidBatch,
    #[error("invalid part segment; expected 'p<number>'")]
    InvalidPart,
    #[error("invalid phase segment: {0}")]
    InvalidPhase(#[from] AttackPhaseError),
    #[error("expected 4 '/'-separated segments")]
    WrongShape,
}

impl JobName {
    pub fn new(key: PartKey) -> Self {
        Self(key)
    }

    pub fn key(&self) -> &PartKey {
        &self.0
    }

    pub fn into_key(self) -> PartKey {
        self.0
    }

    pub fn parse(input: &str) -> Result<Self, JobNameParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(JobNameParseError::Empty);
        }

        let segments: Vec<&str> = input.split('/').collect();
        if segments.first() != Some(&JOB_NAME_PREFIX) {
            return Err(JobNameParseError::ForeignPrefix);
        }
        let [_, batch, part, phase] = segments.as_slice() else {
            return Err(JobNameParseError::WrongShape);
        };

        let batch = batch
            .strip_prefix("B-")
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or(JobNameParseError::InvalidBatch)?;
        let part = part
            .strip_prefix('p')
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or(JobNameParseError::InvalidPart)?;
        let phase = AttackPhase::parse(phase)?;

        Ok(Self(PartKey {
            batch: BatchSeq(batch),
            index: PartIndex(part),
            phase,
        }))
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{JOB_NAME_PREFIX}/{}", self.0)
    }
}
