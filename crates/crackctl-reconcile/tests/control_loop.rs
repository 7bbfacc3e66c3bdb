mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use crackctl_core::catalog::PhaseCatalog;
use crackctl_core::types::{BatchDefinition, BatchSeq, BatchState, JobId};
use crackctl_reconcile::archiver::ArchiveOutcome;
use crackctl_reconcile::control::{ControlConfig, ControlLoop};
use crackctl_reconcile::report::{Action, Health};
use crackctl_state::{FsStateStore, StateStore};

fn control(
    store: Arc<FsStateStore>,
    fake: Arc<FakeOrchestrator>,
    cfg: ControlConfig,
) -> anyhow::Result<ControlLoop> {
    Ok(ControlLoop::new(
        store,
        fake,
        FakeRemedy::new(true),
        PhaseCatalog::builtin(),
        cfg,
    )?)
}

/// Marks every job created so far as fully worked.
fn finish_created_jobs(fake: &FakeOrchestrator, cracked: u64) {
    let ids: Vec<JobId> = fake.with(|s| s.jobs.keys().copied().collect());
    for id in ids {
        let name = fake.with(|s| s.jobs[&id].name.clone());
        complete_part(fake, id, 1_000, cracked);
        fake.with(|s| {
            if let Some(j) = s.jobs.get_mut(&id) {
                j.name = name;
            }
        });
    }
}

fn submissions(actions: &[Action]) -> usize {
    actions
        .iter()
        .filter(|a| matches!(a, Action::Submit { .. }))
        .count()
}

#[tokio::test]
async fn batch_runs_through_phases_to_archive() -> anyhow::Result<()> {
    let root = temp_root("loop-e2e")?;
    let store = Arc::new(FsStateStore::new(root.join("state")));
    let fake = FakeOrchestrator::new();
    store.create_batch(BatchDefinition {
        seq: BatchSeq(80),
        phases: vec![phase("brute-5"), phase("brute-6")],
        part_hashlists: vec![hashlist(80, 0), hashlist(80, 1)],
    })?;

    let mut cfg = ControlConfig::default();
    cfg.looping.report_path = Some(root.join("report.json"));
    let control = control(store.clone(), fake.clone(), cfg)?;

    let first = control.run_tick().await?;
    let batch = first.batch(BatchSeq(80)).expect("batch reported");
    assert_eq!(submissions(&batch.actions), 2);
    assert_eq!(batch.state, BatchState::Submitted);
    assert!(root.join("report.json").exists());

    let again = control.run_tick().await?;
    let batch = again.batch(BatchSeq(80)).expect("batch reported");
    assert_eq!(submissions(&batch.actions), 0);
    assert_eq!(fake.with(|s| s.created.len()), 2);

    finish_created_jobs(&fake, 5);
    let second = control.run_tick().await?;
    let batch = second.batch(BatchSeq(80)).expect("batch reported");
    assert!(batch.actions.iter().any(|a| matches!(
        a,
        Action::PhaseApplied { phase: p, cracked: 10 } if p == &phase("brute-5")
    )));
    assert_eq!(submissions(&batch.actions), 2);
    assert_eq!(batch.state, BatchState::Running);
    assert_eq!(fake.with(|s| s.created.len()), 4);
    assert!(fake
        .with(|s| s.created.clone())
        .iter()
        .skip(2)
        .all(|j| j.name.ends_with("/brute-6")));

    finish_created_jobs(&fake, 5);
    let third = control.run_tick().await?;
    let batch = third.batch(BatchSeq(80)).expect("batch reported");
    assert!(batch
        .actions
        .iter()
        .any(|a| matches!(a, Action::Archive { outcome: ArchiveOutcome::Archived { .. } })));
    assert_eq!(batch.state, BatchState::Archived);
    assert!(batch.pending_external_archive.is_empty());
    assert_eq!(third.health, Health::Healthy);

    let rec = store.read_batch(BatchSeq(80))?;
    assert_eq!(rec.state, BatchState::Archived);
    assert_eq!(rec.phases_applied.len(), 2);
    assert_eq!(
        fake.mutations()
            .iter()
            .filter(|m| matches!(m, Mutation::ArchiveJob(_)))
            .count(),
        4
    );

    let metrics = control.metrics();
    assert_eq!(metrics.ticks.total(), 4);
    assert_eq!(metrics.submissions.total(), 4);
    assert_eq!(metrics.archives.total(), 1);
    assert_eq!(metrics.submissions.take_delta(), 4);
    assert_eq!(metrics.submissions.take_delta(), 0);
    assert_eq!(metrics.tick_duration.snapshot().count, 4);
    assert_eq!(metrics.tick_duration.snapshot().overruns, 0);
    assert_eq!(metrics.monitored_batches.peak(), 1);

    control.run_tick().await?;
    assert_eq!(metrics.monitored_batches.current(), 0);
    assert_eq!(metrics.monitored_batches.peak(), 1);
    Ok(())
}

#[tokio::test]
async fn archive_disabled_only_dry_runs() -> anyhow::Result<()> {
    let store = temp_store("loop-dry")?;
    let fake = FakeOrchestrator::new();
    submitted_batch(store.as_ref(), 81, 2, "brute-5")?;
    complete_part(&fake, job_id(81, 0), 100, 2);
    complete_part(&fake, job_id(81, 1), 100, 2);

    let mut cfg = ControlConfig::default();
    cfg.looping.auto_archive = false;
    let control = control(store.clone(), fake.clone(), cfg)?;

    let report = control.run_tick().await?;
    let batch = report.batch(BatchSeq(81)).expect("batch reported");
    assert!(batch.actions.iter().any(|a| matches!(
        a,
        Action::Archive {
            outcome: ArchiveOutcome::WouldArchive { .. }
        }
    )));
    assert_eq!(store.read_batch(BatchSeq(81))?.state, BatchState::Complete);
    assert!(fake.mutations().is_empty());
    Ok(())
}

#[tokio::test]
async fn pending_external_archive_is_finished_on_a_later_tick() -> anyhow::Result<()> {
    let store = temp_store("loop-pending")?;
    let fake = FakeOrchestrator::new();
    submitted_batch(store.as_ref(), 82, 1, "brute-5")?;
    complete_part(&fake, job_id(82, 0), 100, 2);
    fake.with(|s| {
        s.fail_archive.insert(job_id(82, 0));
    });
    let control = control(store.clone(), fake.clone(), ControlConfig::default())?;

    let first = control.run_tick().await?;
    let batch = first.batch(BatchSeq(82)).expect("batch reported");
    assert_eq!(batch.state, BatchState::Archived);
    assert_eq!(batch.pending_external_archive, vec![job_id(82, 0)]);
    assert_eq!(first.health, Health::Degraded);

    fake.with(|s| s.fail_archive.clear());
    let second = control.run_tick().await?;
    let batch = second.batch(BatchSeq(82)).expect("batch reported");
    assert!(batch.pending_external_archive.is_empty());
    assert_eq!(second.health, Health::Healthy);
    assert!(fake.mutations().contains(&Mutation::ArchiveJob(job_id(82, 0))));
    Ok(())
}

#[tokio::test]
async fn status_report_mutates_nothing() -> anyhow::Result<()> {
    let store = temp_store("loop-status")?;
    let fake = FakeOrchestrator::new();
    submitted_batch(store.as_ref(), 83, 2, "brute-5")?;
    complete_part(&fake, job_id(83, 0), 100, 2);
    complete_part(&fake, job_id(83, 1), 100, 2);
    let control = control(store.clone(), fake.clone(), ControlConfig::default())?;

    let report = control.status_report().await?;
    let batch = report.batch(BatchSeq(83)).expect("batch reported");
    assert!(batch.blocking_gate.is_none());
    assert!(batch.actions.is_empty());
    assert_eq!(store.read_batch(BatchSeq(83))?.state, BatchState::Submitted);
    assert!(fake.mutations().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn run_stops_on_shutdown() -> anyhow::Result<()> {
    let store = temp_store("loop-shutdown")?;
    let fake = FakeOrchestrator::new();
    let control = control(store, fake, ControlConfig::default())?;
    let metrics = control.metrics();

    control
        .run(tokio::time::sleep(Duration::from_secs(65)))
        .await?;
    assert!(metrics.ticks.total() >= 1);
    Ok(())
}
