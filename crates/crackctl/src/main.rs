#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};

use crackctl_client::{HttpConfig, HttpOrchestrator, HttpRemedy, RetryPolicy};
use crackctl_core::catalog::PhaseCatalog;
use crackctl_core::priority::PriorityPolicy;
use crackctl_core::profile::{BenchmarkMode, JobProfile};
use crackctl_core::types::{
    AnomalyOverride, AttackPhase, BatchDefinition, BatchSeq, HashlistId, PartIndex,
};
use crackctl_observe::logging::{init_tracing, LogFormat};
use crackctl_observe::time::unix_time_ms;
use crackctl_reconcile::archiver::{ArchiveMode, ArchiveOutcome};
use crackctl_reconcile::collector::CollectorConfig;
use crackctl_reconcile::control::{ControlConfig, ControlLoop, LoopConfig, LoopMetrics};
use crackctl_reconcile::evaluator::EvaluatorConfig;
use crackctl_reconcile::resolver::ResolverConfig;
use crackctl_reconcile::submitter::SubmitterConfig;
use crackctl_state::{FsStateStore, LockOwner, StateStore};

#[derive(Debug, Parser)]
#[command(name = "crackctl", about = "Reconciliation and safety controller for cracking batches")]
struct Cli {
    /// Orchestration server user API endpoint.
    #[arg(long, env = "CRACKCTL_SERVER_URL")]
    server_url: Option<String>,

    #[arg(long, env = "CRACKCTL_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Worker file download URL; derived from the server URL when unset.
    #[arg(long, env = "CRACKCTL_FILE_FETCH_URL")]
    file_fetch_url: Option<String>,

    #[arg(long, env = "CRACKCTL_WORKER_TOKEN", hide_env_values = true)]
    worker_token: Option<String>,

    /// Agent lifecycle-control endpoint. Without it, stuck chunks can only be aborted.
    #[arg(long, env = "CRACKCTL_AGENT_CONTROL_URL")]
    agent_control_url: Option<String>,

    #[arg(long, env = "CRACKCTL_HTTP_TIMEOUT_MS", default_value_t = 10_000)]
    http_timeout_ms: u64,

    #[arg(long, env = "CRACKCTL_HTTP_RETRY_ATTEMPTS", default_value_t = 5)]
    http_retry_attempts: u32,

    /// Root directory of the local state store.
    #[arg(long, env = "CRACKCTL_STATE_ROOT", default_value = "/var/lib/crackctl")]
    state_root: PathBuf,

    /// How long a writer lock is tolerated before reaping.
    #[arg(long, env = "CRACKCTL_LOCK_STALE_MS", default_value_t = 60_000)]
    lock_stale_ms: u64,

    #[arg(long, env = "CRACKCTL_LOCK_WAIT_MS", default_value_t = 5_000)]
    lock_wait_ms: u64,

    /// JSON file extending the built-in brute-force phases.
    #[arg(long, env = "CRACKCTL_PHASE_CATALOG")]
    phase_catalog: Option<PathBuf>,

    #[arg(long, env = "CRACKCTL_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::Args)]
struct Tuning {
    #[arg(long, env = "CRACKCTL_TICK_INTERVAL_MS", default_value_t = 30_000)]
    tick_interval_ms: u64,

    /// Per-tick budget for snapshot collection.
    #[arg(long, env = "CRACKCTL_TICK_DEADLINE_MS", default_value_t = 28_000)]
    tick_deadline_ms: u64,

    #[arg(long, env = "CRACKCTL_HEARTBEAT_STALE_SECS", default_value_t = 120)]
    heartbeat_stale_secs: u64,

    #[arg(long, env = "CRACKCTL_HEARTBEAT_CRITICAL_SECS", default_value_t = 300)]
    heartbeat_critical_secs: u64,

    #[arg(long, env = "CRACKCTL_CHUNK_STALE_SECS", default_value_t = 900)]
    chunk_stale_secs: u64,

    /// Gap between the two progress readings of an old DISPATCHED chunk.
    #[arg(long, env = "CRACKCTL_SAMPLE_WINDOW_MS", default_value_t = 20_000)]
    sample_window_ms: u64,

    #[arg(long, env = "CRACKCTL_COLLECTOR_CONCURRENCY", default_value_t = 8)]
    collector_concurrency: usize,

    #[arg(long, env = "CRACKCTL_ANOMALY_STDDEV_MULTIPLE", default_value_t = 2.0)]
    anomaly_stddev_multiple: f64,

    #[arg(long, env = "CRACKCTL_ANOMALY_MIN_GROUP", default_value_t = 3)]
    anomaly_min_group: usize,

    #[arg(long, env = "CRACKCTL_HARD_INTERVENTION_SECS", default_value_t = 2_700)]
    hard_intervention_secs: u64,

    #[arg(long, env = "CRACKCTL_RESTART_GRACE_SECS", default_value_t = 600)]
    restart_grace_secs: u64,

    #[arg(long, env = "CRACKCTL_MAX_RESTART_ATTEMPTS", default_value_t = 2)]
    max_restart_attempts: u32,

    #[arg(long, env = "CRACKCTL_PRIORITY_CEILING", default_value_t = 10_000)]
    priority_ceiling: u32,

    #[arg(long, env = "CRACKCTL_PRIORITY_FLOOR", default_value_t = 1)]
    priority_floor: u32,

    /// Priority the server assigns to finished jobs.
    #[arg(long, env = "CRACKCTL_COMPLETE_SENTINEL", default_value_t = 0)]
    complete_sentinel: u32,

    #[arg(long, env = "CRACKCTL_CHUNK_TIME_SECS", default_value_t = 600)]
    chunk_time_secs: u32,

    #[arg(long, env = "CRACKCTL_STATUS_TIMER_SECS", default_value_t = 5)]
    status_timer_secs: u32,

    /// 0 means unlimited.
    #[arg(long, env = "CRACKCTL_MAX_AGENTS", default_value_t = 0)]
    max_agents: u32,

    #[arg(long, env = "CRACKCTL_JOB_PROFILE_VERSION", default_value_t = 1)]
    job_profile_version: u32,

    #[arg(long, env = "CRACKCTL_BENCHMARK_MODE", default_value = "speed")]
    benchmark_mode: BenchmarkMode,

    #[arg(long, env = "CRACKCTL_AUTO_SUBMIT", default_value_t = true, action = clap::ArgAction::Set)]
    auto_submit: bool,

    #[arg(long, env = "CRACKCTL_AUTO_ARCHIVE", default_value_t = true, action = clap::ArgAction::Set)]
    auto_archive: bool,

    #[arg(long, env = "CRACKCTL_AUTO_RESOLVE", default_value_t = true, action = clap::ArgAction::Set)]
    auto_resolve: bool,

    /// Operator report, rewritten atomically every tick.
    #[arg(long, env = "CRACKCTL_REPORT_PATH")]
    report_path: Option<PathBuf>,

    /// Optional: periodically emit a metrics snapshot to logs.
    #[arg(long, env = "CRACKCTL_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 0)]
    metrics_snapshot_interval_ms: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control loop until Ctrl-C.
    Run {
        /// Run a single tick, print the report and exit.
        #[arg(long)]
        once: bool,
    },
    /// Print a read-only operator report.
    Status,
    /// Record a new batch definition.
    CreateBatch {
        #[arg(long, value_parser = parse_batch_seq)]
        seq: BatchSeq,
        /// Attack phases in application order.
        #[arg(long = "phase", required = true, value_delimiter = ',')]
        phases: Vec<String>,
        /// One hashlist per part, in part order.
        #[arg(long = "hashlist", required = true, value_delimiter = ',')]
        hashlists: Vec<u64>,
    },
    /// Submit one part of one phase.
    Submit {
        #[arg(long, value_parser = parse_batch_seq)]
        batch: BatchSeq,
        #[arg(long)]
        part: u32,
        #[arg(long)]
        phase: String,
    },
    /// Run the archive gates for one batch, committing unless `--dry-run`.
    Archive {
        #[arg(long, value_parser = parse_batch_seq)]
        batch: BatchSeq,
        #[arg(long)]
        dry_run: bool,
    },
    /// Accept a flagged crack-count anomaly for one part.
    OverrideAnomaly {
        #[arg(long, value_parser = parse_batch_seq)]
        batch: BatchSeq,
        #[arg(long)]
        part: u32,
        #[arg(long)]
        phase: String,
        #[arg(long, env = "USER")]
        operator: String,
        #[arg(long)]
        note: String,
    },
}

/// Accepts `B-0042` or `42`.
fn parse_batch_seq(s: &str) -> Result<BatchSeq, String> {
    let digits = s.trim().strip_prefix("B-").unwrap_or(s.trim());
    digits
        .parse::<u32>()
        .map(BatchSeq)
        .map_err(|_| format!("invalid batch {s:?}; expected B-NNNN or a number"))
}

fn control_config(t: &Tuning) -> Result<ControlConfig> {
    let priority = PriorityPolicy::new(t.priority_ceiling, t.priority_floor, t.complete_sentinel)?;
    Ok(ControlConfig {
        collector: CollectorConfig {
            heartbeat_stale_after: Duration::from_secs(t.heartbeat_stale_secs),
            heartbeat_critical_after: Duration::from_secs(t.heartbeat_critical_secs),
            chunk_stale_after: Duration::from_secs(t.chunk_stale_secs),
            sample_window: Duration::from_millis(t.sample_window_ms),
            max_concurrency: t.collector_concurrency,
            tick_deadline: Duration::from_millis(t.tick_deadline_ms),
        },
        evaluator: EvaluatorConfig {
            anomaly_stddev_multiple: t.anomaly_stddev_multiple,
            min_anomaly_group: t.anomaly_min_group,
        },
        resolver: ResolverConfig {
            hard_intervention_age: Duration::from_secs(t.hard_intervention_secs),
            restart_grace: Duration::from_secs(t.restart_grace_secs),
            max_restart_attempts: t.max_restart_attempts,
        },
        submitter: SubmitterConfig {
            priority,
            profile: JobProfile {
                version: t.job_profile_version,
                benchmark_mode: t.benchmark_mode,
            },
            chunk_time_secs: t.chunk_time_secs,
            status_timer_secs: t.status_timer_secs,
            max_agents: t.max_agents,
        },
        looping: LoopConfig {
            tick_interval: Duration::from_millis(t.tick_interval_ms),
            auto_submit: t.auto_submit,
            auto_archive: t.auto_archive,
            auto_resolve: t.auto_resolve,
            report_path: t.report_path.clone(),
        },
    })
}

fn http_config(cli: &Cli) -> Result<HttpConfig> {
    let endpoint = cli
        .server_url
        .clone()
        .context("--server-url (CRACKCTL_SERVER_URL) is required")?;
    let key = cli
        .api_key
        .clone()
        .context("--api-key (CRACKCTL_API_KEY) is required")?;
    let mut cfg = HttpConfig::new(endpoint, key);
    cfg.file_fetch_url = cli.file_fetch_url.clone();
    cfg.worker_token = cli.worker_token.clone();
    cfg.agent_control_url = cli.agent_control_url.clone();
    cfg.request_timeout = Duration::from_millis(cli.http_timeout_ms);
    cfg.retry = RetryPolicy {
        max_attempts: cli.http_retry_attempts.max(1),
        ..RetryPolicy::default()
    };
    Ok(cfg)
}

fn load_catalog(path: Option<&PathBuf>) -> Result<PhaseCatalog> {
    let builtin = PhaseCatalog::builtin();
    let Some(path) = path else {
        return Ok(builtin);
    };
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading phase catalog {}", path.display()))?;
    Ok(builtin.merged(PhaseCatalog::from_json(&bytes)?))
}

fn emit_metrics_snapshot(metrics: &LoopMetrics) {
    let tick = metrics.tick_duration.snapshot();
    info!(
        target: "crackctl_metrics",
        ticks_total = metrics.ticks.total(),
        ticks = metrics.ticks.take_delta(),
        degraded_ticks = metrics.degraded_ticks.take_delta(),
        submissions = metrics.submissions.take_delta(),
        archives = metrics.archives.take_delta(),
        blocked_archives = metrics.blocked_archives.take_delta(),
        interventions = metrics.interventions.take_delta(),
        errors = metrics.errors.take_delta(),
        errors_total = metrics.errors.total(),
        monitored_batches = metrics.monitored_batches.current(),
        monitored_batches_peak = metrics.monitored_batches.peak(),
        agents_healthy = metrics.agents_healthy.current(),
        agents_idle = metrics.agents_idle.current(),
        agents_stale = metrics.agents_stale.current(),
        agents_critical = metrics.agents_critical.current(),
        agents_critical_peak = metrics.agents_critical.peak(),
        tick_avg_ms = tick.avg_ms(),
        tick_max_ms = tick.max_ms,
        tick_overruns = tick.overruns,
        "metrics"
    );
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("ctrl-c received; shutting down"),
        Err(err) => {
            warn!(error = %err, "cannot listen for ctrl-c; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct App {
    store: Arc<FsStateStore>,
    catalog: PhaseCatalog,
}

impl App {
    fn control(&self, cli: &Cli) -> Result<ControlLoop> {
        let http = http_config(cli)?;
        let orchestrator = Arc::new(HttpOrchestrator::new(&http)?);
        let remedy = Arc::new(HttpRemedy::new(&http)?);
        Ok(ControlLoop::new(
            self.store.clone(),
            orchestrator,
            remedy,
            self.catalog.clone(),
            control_config(&cli.tuning)?,
        )?)
    }

    fn phase(&self, name: &str) -> Result<AttackPhase> {
        let phase = AttackPhase::parse(name)?;
        if !self.catalog.contains(&phase) {
            anyhow::bail!("phase {phase} is not in the phase catalog");
        }
        Ok(phase)
    }
}

async fn run(cli: Cli) -> Result<()> {
    let store = FsStateStore::new(cli.state_root.clone())
        .with_lock_timing(
            Duration::from_millis(cli.lock_stale_ms),
            Duration::from_millis(cli.lock_wait_ms),
        )
        .with_owner(LockOwner {
            name: Some(format!("crackctl-{}", std::process::id())),
        });
    let app = App {
        store: Arc::new(store),
        catalog: load_catalog(cli.phase_catalog.as_ref())?,
    };

    match &cli.command {
        Command::Run { once: true } => {
            let control = app.control(&cli)?;
            let report = control.run_tick().await?;
            print_json(&report)?;
        }
        Command::Run { once: false } => {
            let control = app.control(&cli)?;
            if cli.tuning.metrics_snapshot_interval_ms > 0 {
                let metrics = control.metrics();
                let interval_ms = cli.tuning.metrics_snapshot_interval_ms;
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                    loop {
                        ticker.tick().await;
                        emit_metrics_snapshot(&metrics);
                    }
                });
            }
            control.run(shutdown_signal()).await?;
            emit_metrics_snapshot(&control.metrics());
        }
        Command::Status => {
            let control = app.control(&cli)?;
            print_json(&control.status_report().await?)?;
        }
        Command::CreateBatch {
            seq,
            phases,
            hashlists,
        } => {
            let phases = phases
                .iter()
                .map(|p| app.phase(p))
                .collect::<Result<Vec<_>>>()?;
            let def = BatchDefinition {
                seq: *seq,
                phases,
                part_hashlists: hashlists.iter().copied().map(HashlistId).collect(),
            };
            def.validate()?;
            let rec = app.store.create_batch(def)?;
            print_json(&rec)?;
        }
        Command::Submit { batch, part, phase } => {
            let phase = app.phase(phase)?;
            let control = app.control(&cli)?;
            let outcome = control
                .submitter()
                .submit(*batch, PartIndex(*part), &phase)
                .await?;
            print_json(&outcome)?;
        }
        Command::Archive { batch, dry_run } => {
            let control = app.control(&cli)?;
            let rec = app.store.read_batch(*batch)?;
            let snapshot = control.snapshot(Some(std::slice::from_ref(&rec))).await?;
            let mode = if *dry_run {
                ArchiveMode::DryRun
            } else {
                ArchiveMode::Commit
            };
            let outcome = control.archiver().archive(&snapshot, *batch, mode).await?;
            print_json(&outcome)?;
            if let ArchiveOutcome::Blocked { gate, .. } = &outcome {
                anyhow::bail!("{batch} blocked at {}: {}", gate.gate, gate.reason);
            }
        }
        Command::OverrideAnomaly {
            batch,
            part,
            phase,
            operator,
            note,
        } => {
            let phase = AttackPhase::parse(phase)?;
            let rec = app.store.record_anomaly_override(
                *batch,
                AnomalyOverride {
                    index: PartIndex(*part),
                    phase,
                    operator: operator.clone(),
                    note: note.clone(),
                    recorded_unix_ms: unix_time_ms(),
                },
            )?;
            print_json(&json!({
                "batch": rec.seq,
                "state": rec.state,
                "overrides": rec.anomaly_overrides.len(),
            }))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let span = info_span!(
        "crackctl",
        state_root = %cli.state_root.display(),
        server = cli.server_url.as_deref().unwrap_or("-")
    );
    run(cli).instrument(span).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_seq_accepts_both_spellings() {
        assert_eq!(parse_batch_seq("B-0042"), Ok(BatchSeq(42)));
        assert_eq!(parse_batch_seq("43"), Ok(BatchSeq(43)));
        assert!(parse_batch_seq("B-x").is_err());
    }

    #[test]
    fn defaults_build_a_valid_config() {
        let cli = Cli::try_parse_from(["crackctl", "status"]).unwrap();
        let cfg = control_config(&cli.tuning).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.looping.tick_interval, Duration::from_secs(30));
        assert_eq!(cfg.collector.chunk_stale_after, Duration::from_secs(15 * 60));
        assert_eq!(cfg.resolver.hard_intervention_age, Duration::from_secs(45 * 60));
        assert_eq!(cfg.submitter.profile, JobProfile::V1);
        assert_eq!(cfg.submitter.priority.for_batch(BatchSeq(44)), 9_956);
    }

    #[test]
    fn sentinel_inside_priority_range_is_rejected() {
        let cli = Cli::try_parse_from([
            "crackctl",
            "--priority-floor",
            "0",
            "status",
        ])
        .unwrap();
        assert!(control_config(&cli.tuning).is_err());
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from([
            "crackctl",
            "--benchmark-mode",
            "runtime",
            "--auto-archive",
            "false",
            "create-batch",
            "--seq",
            "B-0050",
            "--phase",
            "brute-5,brute-6",
            "--hashlist",
            "11,12,13",
        ])
        .unwrap();
        assert_eq!(cli.tuning.benchmark_mode, BenchmarkMode::Runtime);
        assert!(!cli.tuning.auto_archive);
        let Command::CreateBatch {
            seq,
            phases,
            hashlists,
        } = cli.command
        else {
            panic!("expected create-batch");
        };
        assert_eq!(seq, BatchSeq(50));
        assert_eq!(phases, vec!["brute-5", "brute-6"]);
        assert_eq!(hashlists, vec![11, 12, 13]);

        let cli = Cli::try_parse_from(["crackctl", "archive", "--batch", "42", "--dry-run"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Archive {
                batch: BatchSeq(42),
                dry_run: true
            }
        ));
    }

    #[test]
    fn server_url_is_required_to_connect() {
        let cli = Cli::try_parse_from(["crackctl", "status"]).unwrap();
        if cli.server_url.is_none() {
            assert!(http_config(&cli).is_err());
        }
    }
}
