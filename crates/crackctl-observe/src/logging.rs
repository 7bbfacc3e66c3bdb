use std::str::FromStr;

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}; expected text|json")),
        }
    }
}

/// Initializes a `tracing_subscriber` using `CRACKCTL_LOG` first, then `RUST_LOG`, then `info`.
///
/// Log field contract:
/// - Always include `batch` on anything scoped to one batch (`B-0042`).
/// - Include `part` and `phase` on part-scoped events, `job_id` once known.
/// - Include `chunk_id` and `agent_id` on interventions.
/// - Decisions that change external or persisted state go to target `crackctl_audit`
///   with an `event` field.
pub fn init_tracing(format: LogFormat) {
    let filter = env_filter();
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("CRACKCTL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
