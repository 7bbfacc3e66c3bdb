use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the server benchmarks an agent before handing it chunks.
///
/// This is a binary switch on job creation. It is set from configuration and
/// never derived from live job data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkMode {
    Speed,
    Runtime,
}

impl BenchmarkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BenchmarkMode::Speed => "speed",
            BenchmarkMode::Runtime => "runtime",
        }
    }
}

impl fmt::Display for BenchmarkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown benchmark mode {0:?}; expected 'speed' or 'runtime'")]
pub struct BenchmarkModeParseError(String);

impl FromStr for BenchmarkMode {
    type Err = BenchmarkModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "speed" => Ok(BenchmarkMode::Speed),
            "runtime" => Ok(BenchmarkMode::Runtime),
            other => Err(BenchmarkModeParseError(other.to_string())),
        }
    }
}

/// Versioned job-creation profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProfile {
    pub version: u32,
    pub benchmark_mode: BenchmarkMode,
}

impl JobProfile {
    /// Speed benchmarking: the mode every historical batch finished under.
    pub const V1: JobProfile = JobProfile {
        version: 1,
        benchmark_mode: BenchmarkMode::Speed,
    };
}

impl Default for JobProfile {
    fn default() -> Self {
        Self::V1
    }
}
