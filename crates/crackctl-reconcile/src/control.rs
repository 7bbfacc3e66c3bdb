//! The per-tick control loop: collect, evaluate, then act per batch.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crackctl_client::{ChunkRemedy, Orchestrator};
use crackctl_core::catalog::PhaseCatalog;
use crackctl_core::types::{BatchRecord, BatchState};
use crackctl_observe::metrics::{Level, Tally, TickTimings};
use crackctl_state::StateStore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::archiver::{check_gates, ArchiveMode, ArchiveOutcome, SafeArchiver};
use crate::collector::{CollectorConfig, SnapshotCollector};
use crate::error::ReconcileError;
use crate::evaluator::{evaluate, BatchStatus, EvaluatorConfig};
use crate::locks::BatchLocks;
use crate::report::{Action, BatchReport, OperatorReport, ReportedError};
use crate::resolver::{Resolution, ResolverConfig, StuckWorkResolver};
use crate::snapshot::Snapshot;
use crate::store_io::BlockingStore;
use crate::submitter::{next_submissions, SubmitOutcome, Submitter, SubmitterConfig};

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub tick_interval: Duration,
    pub auto_submit: bool,
    /// When off, complete batches are only dry-run through the gates.
    pub auto_archive: bool,
    pub auto_resolve: bool,
    pub report_path: Option<PathBuf>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            auto_submit: true,
            auto_archive: true,
            auto_resolve: true,
            report_path: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ControlConfig {
    pub collector: CollectorConfig,
    pub evaluator: EvaluatorConfig,
    pub resolver: ResolverConfig,
    pub submitter: SubmitterConfig,
    pub looping: LoopConfig,
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        self.collector.validate()?;
        self.evaluator.validate()?;
        if self.looping.tick_interval.is_zero() {
            return Err(ReconcileError::Config("tick interval must be positive".to_string()));
        }
        if self.collector.tick_deadline > self.looping.tick_interval {
            return Err(ReconcileError::Config(format!(
                "tick deadline {:?} exceeds tick interval {:?}",
                self.collector.tick_deadline, self.looping.tick_interval
            )));
        }
        if self.resolver.hard_intervention_age < self.collector.chunk_stale_after {
            return Err(ReconcileError::Config(format!(
                "hard intervention age {:?} is below chunk staleness age {:?}",
                self.resolver.hard_intervention_age, self.collector.chunk_stale_after
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LoopMetrics {
    pub ticks: Tally,
    pub degraded_ticks: Tally,
    pub submissions: Tally,
    pub archives: Tally,
    pub blocked_archives: Tally,
    pub interventions: Tally,
    pub errors: Tally,
    pub monitored_batches: Level,
    pub agents_healthy: Level,
    pub agents_idle: Level,
    pub agents_stale: Level,
    pub agents_critical: Level,
    pub tick_duration: TickTimings,
}

struct LoopInner {
    store: BlockingStore,
    locks: Arc<BatchLocks>,
    collector: SnapshotCollector,
    evaluator: EvaluatorConfig,
    archiver: SafeArchiver,
    submitter: Submitter,
    resolver: StuckWorkResolver,
    cfg: LoopConfig,
    metrics: Arc<LoopMetrics>,
}

/// Single control loop over every batch in the state store.
#[derive(Clone)]
pub struct ControlLoop {
    inner: Arc<LoopInner>,
}

impl ControlLoop {
    pub fn new(
        store: Arc<dyn StateStore>,
        orchestrator: Arc<dyn Orchestrator>,
        remedy: Arc<dyn ChunkRemedy>,
        catalog: PhaseCatalog,
        cfg: ControlConfig,
    ) -> Result<Self, ReconcileError> {
        cfg.validate()?;
        let locks = Arc::new(BatchLocks::new());
        let inner = LoopInner {
            collector: SnapshotCollector::new(orchestrator.clone(), cfg.collector),
            archiver: SafeArchiver::new(
                store.clone(),
                orchestrator.clone(),
                locks.clone(),
                cfg.evaluator.clone(),
            ),
            submitter: Submitter::new(
                store.clone(),
                orchestrator,
                locks.clone(),
                catalog,
                cfg.submitter,
            ),
            resolver: StuckWorkResolver::new(remedy, cfg.resolver),
            evaluator: cfg.evaluator,
            store: BlockingStore::new(store),
            locks,
            cfg: cfg.looping,
            metrics: Arc::new(LoopMetrics::default()),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn metrics(&self) -> Arc<LoopMetrics> {
        self.inner.metrics.clone()
    }

    pub fn archiver(&self) -> &SafeArchiver {
        &self.inner.archiver
    }

    pub fn submitter(&self) -> &Submitter {
        &self.inner.submitter
    }

    /// Collects a snapshot of the given batches, or of every unarchived batch.
    pub async fn snapshot(&self, only: Option<&[BatchRecord]>) -> Result<Snapshot, ReconcileError> {
        match only {
            Some(records) => Ok(self.inner.collector.collect(records).await),
            None => {
                let (active, _) = self.inner.store.load_batches().await?;
                Ok(self.inner.collector.collect(&active).await)
            }
        }
    }

    /// Read-only view: evaluation and gate results, no mutation anywhere.
    pub async fn status_report(&self) -> Result<OperatorReport, ReconcileError> {
        let inner = &self.inner;
        let (active, archived) = inner.store.load_batches().await?;
        let snapshot = inner.collector.collect(&active).await;
        let mut batches = Vec::with_capacity(active.len() + archived.len());
        for rec in &active {
            let eval = evaluate(&snapshot, rec, &inner.evaluator);
            let gates = check_gates(&snapshot, rec, &eval);
            let mut report = BatchReport::new(rec);
            report.observe(&eval, &gates, snapshot.is_batch_degraded(rec.seq));
            batches.push(report);
        }
        batches.extend(
            archived
                .iter()
                .filter(|r| r.pending_external_archive().next().is_some())
                .map(BatchReport::new),
        );
        Ok(OperatorReport::new(
            snapshot.taken_unix_s,
            snapshot.summary(),
            batches,
            Vec::new(),
        ))
    }

    pub async fn run_tick(&self) -> Result<OperatorReport, ReconcileError> {
        let metrics = &self.inner.metrics;
        metrics.ticks.inc();
        metrics
            .tick_duration
            .time(self.inner.cfg.tick_interval, self.tick())
            .await
    }

    async fn tick(&self) -> Result<OperatorReport, ReconcileError> {
        let inner = &self.inner;

        let (active, archived) = inner.store.load_batches().await?;
        let mut batches = Vec::new();
        let mut errors = Vec::new();

        for rec in archived
            .iter()
            .filter(|r| r.pending_external_archive().next().is_some())
        {
            let mut report = BatchReport::new(rec);
            match inner.archiver.finish_external(rec.seq).await {
                Ok(cleanup) => {
                    report.actions.push(Action::ExternalArchive {
                        archived_jobs: cleanup.archived_jobs,
                        pending_jobs: cleanup.pending_jobs,
                    });
                }
                Err(err) => inner.note_error(&mut report, &err),
            }
            match inner.store.read_batch(rec.seq).await {
                Ok(now) => report.refresh(&now),
                Err(err) => inner.note_error(&mut report, &err),
            }
            batches.push(report);
        }

        inner.metrics.monitored_batches.set(active.len() as u64);
        let snapshot = Arc::new(
            inner
                .collector
                .collect(&active)
                .instrument(info_span!("collect", batches = active.len()))
                .await,
        );
        if snapshot.is_degraded() {
            inner.metrics.degraded_ticks.inc();
        } else {
            inner.resolver.retain_stuck(&snapshot.stuck_chunk_ids());
        }
        if let Some(counts) = snapshot.agent_health_counts().known() {
            inner.metrics.agents_healthy.set(counts.healthy);
            inner.metrics.agents_idle.set(counts.idle);
            inner.metrics.agents_stale.set(counts.stale);
            inner.metrics.agents_critical.set(counts.critical);
        }
        let summary = snapshot.summary();
        if let Err(err) = inner.store.write_snapshot_summary(summary.clone()).await {
            inner.metrics.errors.inc();
            warn!(error = %err, "writing snapshot summary failed");
            errors.push(ReportedError::new(None, &err));
        }

        let mut set = JoinSet::new();
        for rec in active {
            let inner = self.inner.clone();
            let snapshot = snapshot.clone();
            let span = info_span!("batch", batch = %rec.seq);
            set.spawn(async move { inner.tick_batch(&snapshot, rec).await }.instrument(span));
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => batches.push(report),
                Err(err) => {
                    inner.metrics.errors.inc();
                    warn!(error = %err, "batch task failed");
                    errors.push(ReportedError::internal(None, format!("batch task failed: {err}")));
                }
            }
        }

        let report = OperatorReport::new(snapshot.taken_unix_s, summary, batches, errors);
        if let Some(path) = &inner.cfg.report_path {
            if let Err(err) = report.write_to(path) {
                warn!(path = %path.display(), error = %err, "writing operator report failed");
            }
        }
        info!(
            target: "crackctl_audit",
            event = "tick",
            health = ?report.health,
            batches = report.batches.len() as u64,
            degraded = snapshot.is_degraded(),
            "tick complete"
        );
        Ok(report)
    }

    /// Ticks until `shutdown` resolves. A tick in progress at shutdown is
    /// abandoned; every store commit it already made is complete on its own.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ReconcileError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.inner.cfg.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            tick_interval_ms = self.inner.cfg.tick_interval.as_millis() as u64,
            auto_submit = self.inner.cfg.auto_submit,
            auto_archive = self.inner.cfg.auto_archive,
            auto_resolve = self.inner.cfg.auto_resolve,
            "control loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested during tick; abandoning it");
                    break;
                }
                res = self.run_tick() => match res {
                    Ok(report) => debug!(health = ?report.health, "tick finished"),
                    Err(err) => {
                        self.inner.metrics.errors.inc();
                        warn!(error = %err, kind = ?err.kind(), "tick failed");
                    }
                },
            }
        }
        info!("control loop stopped");
        Ok(())
    }
}

impl LoopInner {
    fn note_error(&self, report: &mut BatchReport, err: &ReconcileError) {
        self.metrics.errors.inc();
        warn!(batch = %report.batch, error = %err, kind = ?err.kind(), "batch step failed");
        report.push_error(err);
    }

    async fn tick_batch(&self, snapshot: &Snapshot, rec: BatchRecord) -> BatchReport {
        let seq = rec.seq;
        let mut report = BatchReport::new(&rec);
        let eval = evaluate(snapshot, &rec, &self.evaluator);
        let gates = check_gates(snapshot, &rec, &eval);
        report.observe(&eval, &gates, snapshot.is_batch_degraded(seq));

        {
            let _guard = self.locks.lock(seq).await;
            self.record_progress(&rec, &eval.status, &mut report).await;
            if let Some(phase) = rec.next_phase() {
                if eval.is_phase_complete(phase) {
                    match eval.phase_cracked(phase).known() {
                        Some(&cracked) => {
                            match self
                                .store
                                .record_attack_phase_applied(seq, phase.clone(), cracked)
                                .await
                            {
                                Ok(_) => report.actions.push(Action::PhaseApplied {
                                    phase: phase.clone(),
                                    cracked,
                                }),
                                Err(err) => self.note_error(&mut report, &err),
                            }
                        }
                        None => debug!(
                            batch = %seq,
                            phase = %phase,
                            "phase complete but crack total unknown"
                        ),
                    }
                }
            }
        }

        if eval.status == BatchStatus::Complete {
            let mode = if self.cfg.auto_archive {
                ArchiveMode::Commit
            } else {
                ArchiveMode::DryRun
            };
            match self.archiver.archive(snapshot, seq, mode).await {
                Ok(outcome) => {
                    match &outcome {
                        ArchiveOutcome::Archived { .. } => self.metrics.archives.inc(),
                        ArchiveOutcome::Blocked { .. } => self.metrics.blocked_archives.inc(),
                        ArchiveOutcome::WouldArchive { .. } | ArchiveOutcome::AlreadyArchived { .. } => {}
                    }
                    let archived = matches!(outcome, ArchiveOutcome::Archived { .. });
                    report.actions.push(Action::Archive { outcome });
                    if archived {
                        self.refresh(&mut report).await;
                        return report;
                    }
                }
                Err(err) => self.note_error(&mut report, &err),
            }
        }

        if self.cfg.auto_resolve {
            self.resolve_stuck(snapshot, &mut report).await;
        }
        if self.cfg.auto_submit {
            self.submit_next(&mut report).await;
        }
        self.refresh(&mut report).await;
        report
    }

    /// Records RUNNING / COMPLETE / ANOMALOUS. Regressions are logged and
    /// skipped; the stored state only moves forward.
    async fn record_progress(&self, rec: &BatchRecord, status: &BatchStatus, report: &mut BatchReport) {
        let next = match status {
            BatchStatus::Running => BatchState::Running,
            BatchStatus::Complete => BatchState::Complete,
            BatchStatus::Anomalous => BatchState::Anomalous,
            BatchStatus::InsufficientInformation { .. } => return,
        };
        if next == rec.state || rec.parts.is_empty() {
            return;
        }
        if !rec.state.can_transition_to(next) {
            warn!(
                batch = %rec.seq,
                from = %rec.state,
                to = %next,
                "observed state would move backwards; keeping stored state"
            );
            return;
        }
        if next == BatchState::Complete && !rec.missing_parts().is_empty() {
            return;
        }
        match self.store.record_observed_state(rec.seq, next).await {
            Ok(_) => {
                info!(
                    target: "crackctl_audit",
                    event = "observed_state",
                    batch = %rec.seq,
                    from = %rec.state,
                    to = %next,
                    "batch state recorded"
                );
                report.actions.push(Action::ObservedState {
                    from: rec.state,
                    to: next,
                });
            }
            Err(err) => self.note_error(report, &err),
        }
    }

    async fn resolve_stuck(&self, snapshot: &Snapshot, report: &mut BatchReport) {
        let seq = report.batch;
        let stuck: Vec<_> = snapshot
            .stuck_chunks()
            .into_iter()
            .filter(|(key, _)| key.batch == seq)
            .collect();
        if stuck.is_empty() {
            return;
        }
        let _guard = self.locks.lock(seq).await;
        for (key, chunk) in stuck {
            match self.resolver.resolve(key, chunk, snapshot.taken_unix_s).await {
                Ok(resolution) => {
                    if !matches!(resolution, Resolution::Waited { .. }) {
                        self.metrics.interventions.inc();
                    }
                    report.actions.push(Action::Resolve {
                        key: key.clone(),
                        chunk_id: chunk.record.id,
                        resolution,
                    });
                }
                Err(err) => self.note_error(report, &err),
            }
        }
    }

    async fn submit_next(&self, report: &mut BatchReport) {
        let seq = report.batch;
        let rec = match self.store.read_batch(seq).await {
            Ok(rec) => rec,
            Err(err) => return self.note_error(report, &err),
        };
        for (index, phase) in next_submissions(&rec) {
            match self.submitter.submit(seq, index, &phase).await {
                Ok(outcome) => {
                    if matches!(outcome, SubmitOutcome::Created { .. }) {
                        self.metrics.submissions.inc();
                    }
                    report.actions.push(Action::Submit {
                        index,
                        phase,
                        outcome,
                    });
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    self.note_error(report, &err);
                    if retryable {
                        // Remaining parts wait for the next tick.
                        break;
                    }
                }
            }
        }
    }

    async fn refresh(&self, report: &mut BatchReport) {
        match self.store.read_batch(report.batch).await {
            Ok(rec) => report.refresh(&rec),
            Err(err) => self.note_error(report, &err),
        }
    }
}
