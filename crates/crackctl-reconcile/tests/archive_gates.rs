mod common;

use std::sync::Arc;

use common::*;
use crackctl_core::types::{
    AnomalyOverride, BatchSeq, BatchState, ChunkState, KeyRange, PartIndex,
};
use crackctl_observe::time::unix_time_ms;
use crackctl_reconcile::archiver::{ArchiveMode, ArchiveOutcome, Gate, SafeArchiver};
use crackctl_reconcile::collector::{CollectorConfig, SnapshotCollector};
use crackctl_reconcile::evaluator::EvaluatorConfig;
use crackctl_reconcile::locks::BatchLocks;
use crackctl_state::{FsStateStore, StateStore};

struct Harness {
    store: Arc<FsStateStore>,
    fake: Arc<FakeOrchestrator>,
    archiver: SafeArchiver,
    collector: SnapshotCollector,
}

fn harness(name: &str) -> anyhow::Result<Harness> {
    let store = temp_store(name)?;
    let fake = FakeOrchestrator::new();
    let archiver = SafeArchiver::new(
        store.clone(),
        fake.clone(),
        Arc::new(BatchLocks::new()),
        EvaluatorConfig::default(),
    );
    let collector = SnapshotCollector::new(fake.clone(), CollectorConfig::default());
    Ok(Harness {
        store,
        fake,
        archiver,
        collector,
    })
}

impl Harness {
    async fn archive(&self, seq: u32, mode: ArchiveMode) -> anyhow::Result<ArchiveOutcome> {
        let rec = self.store.read_batch(BatchSeq(seq))?;
        let snapshot = self.collector.collect(&[rec]).await;
        Ok(self.archiver.archive(&snapshot, BatchSeq(seq), mode).await?)
    }

    fn batch_file(&self, seq: u32) -> anyhow::Result<Vec<u8>> {
        Ok(std::fs::read(
            self.store
                .root()
                .join("batches")
                .join(format!("{}.json", BatchSeq(seq))),
        )?)
    }
}

#[tokio::test]
async fn in_flight_chunk_blocks_at_gate_3_naming_the_part() -> anyhow::Result<()> {
    let h = harness("b0042")?;
    submitted_batch(h.store.as_ref(), 42, 3, "brute-5")?;
    complete_part(&h.fake, job_id(42, 0), 1_000, 4);
    complete_part(&h.fake, job_id(42, 2), 1_000, 5);
    let running = job_id(42, 1);
    h.fake.add_job(
        job(running, 1_000, 600, 3),
        vec![
            chunk(4_201, running, KeyRange::new(0, 600), ChunkState::Finished),
            chunk(4_202, running, KeyRange::new(600, 1_000), ChunkState::Dispatched),
        ],
    );

    let outcome = h.archive(42, ArchiveMode::Commit).await?;
    let ArchiveOutcome::Blocked { gate, others, .. } = outcome else {
        panic!("expected blocked, got {outcome:?}");
    };
    assert_eq!(gate.gate, Gate::NoInFlightChunks);
    assert_eq!(gate.gate.number(), 3);
    assert!(gate.reason.contains("B-0042/p1/brute-5"), "{}", gate.reason);
    assert!(gate.reason.contains("4202"), "{}", gate.reason);
    assert!(others.iter().any(|f| f.gate == Gate::KeyspaceCoverage));

    assert!(h.fake.mutations().is_empty());
    assert_eq!(h.store.read_batch(BatchSeq(42))?.state, BatchState::Submitted);
    Ok(())
}

#[tokio::test]
async fn unsuperseded_abort_blocks_at_gate_4_with_zero_mutation() -> anyhow::Result<()> {
    let h = harness("b0043")?;
    submitted_batch(h.store.as_ref(), 43, 3, "brute-5")?;
    complete_part(&h.fake, job_id(43, 0), 1_000, 4);
    complete_part(&h.fake, job_id(43, 1), 1_000, 4);
    let broken = job_id(43, 2);
    h.fake.add_job(
        job(broken, 1_000, 1_000, 4),
        vec![
            chunk(4_301, broken, KeyRange::new(0, 500), ChunkState::Finished),
            chunk(4_302, broken, KeyRange::new(500, 1_000), ChunkState::Aborted),
        ],
    );
    h.fake.with(|s| s.agents.push(agent(1, Some(broken), 5)));
    let before = h.batch_file(43)?;

    let outcome = h.archive(43, ArchiveMode::Commit).await?;
    let ArchiveOutcome::Blocked { gate, .. } = outcome else {
        panic!("expected blocked, got {outcome:?}");
    };
    assert_eq!(gate.gate, Gate::AbortedChunksSuperseded);
    assert!(gate.reason.contains("4302"), "{}", gate.reason);

    assert!(h.fake.mutations().is_empty());
    assert_eq!(h.batch_file(43)?, before);
    Ok(())
}

#[tokio::test]
async fn aborted_chunk_with_finished_successor_passes() -> anyhow::Result<()> {
    let h = harness("superseded")?;
    submitted_batch(h.store.as_ref(), 44, 1, "brute-5")?;
    let id = job_id(44, 0);
    h.fake.add_job(
        job(id, 1_000, 1_000, 2),
        vec![
            chunk(1, id, KeyRange::new(0, 500), ChunkState::Finished),
            chunk(2, id, KeyRange::new(500, 1_000), ChunkState::Aborted),
            chunk(3, id, KeyRange::new(500, 1_000), ChunkState::Trimmed),
        ],
    );

    let outcome = h.archive(44, ArchiveMode::Commit).await?;
    assert!(
        matches!(outcome, ArchiveOutcome::Archived { .. }),
        "{outcome:?}"
    );
    Ok(())
}

#[tokio::test]
async fn passing_batch_is_archived_atomically_then_propagated() -> anyhow::Result<()> {
    let h = harness("happy")?;
    submitted_batch(h.store.as_ref(), 50, 6, "brute-6")?;
    for i in 0..6 {
        complete_part(&h.fake, job_id(50, i), 2_000, 10 + u64::from(i));
    }
    h.fake.with(|s| {
        s.agents.push(agent(7, Some(job_id(50, 3)), 5));
        s.agents.push(agent(8, None, 5));
    });

    let outcome = h.archive(50, ArchiveMode::Commit).await?;
    let ArchiveOutcome::Archived { cleanup, .. } = outcome else {
        panic!("expected archived, got {outcome:?}");
    };
    assert_eq!(cleanup.archived_jobs.len(), 6);
    assert!(cleanup.pending_jobs.is_empty());
    assert_eq!(cleanup.cleared_agents, vec![crackctl_core::types::AgentId(7)]);

    let rec = h.store.read_batch(BatchSeq(50))?;
    assert_eq!(rec.state, BatchState::Archived);
    assert!(rec.parts.iter().all(|p| p.archived && !p.external_archive_pending));

    let mutations = h.fake.mutations();
    assert_eq!(
        mutations
            .iter()
            .filter(|m| matches!(m, Mutation::ArchiveJob(_)))
            .count(),
        6
    );
    assert!(mutations.contains(&Mutation::ClearAgent(crackctl_core::types::AgentId(7))));
    assert!(!mutations.iter().any(|m| matches!(m, Mutation::CreateJob(_))));

    let again = h.archive(50, ArchiveMode::Commit).await?;
    assert!(matches!(again, ArchiveOutcome::AlreadyArchived { .. }));
    Ok(())
}

#[tokio::test]
async fn dry_run_reports_without_committing() -> anyhow::Result<()> {
    let h = harness("dry-run")?;
    submitted_batch(h.store.as_ref(), 51, 2, "brute-5")?;
    complete_part(&h.fake, job_id(51, 0), 100, 1);
    complete_part(&h.fake, job_id(51, 1), 100, 1);
    let before = h.batch_file(51)?;

    let outcome = h.archive(51, ArchiveMode::DryRun).await?;
    assert_eq!(outcome, ArchiveOutcome::WouldArchive { batch: BatchSeq(51) });
    assert!(h.fake.mutations().is_empty());
    assert_eq!(h.batch_file(51)?, before);
    Ok(())
}

#[tokio::test]
async fn failed_external_archive_stays_pending_until_retried() -> anyhow::Result<()> {
    let h = harness("pending")?;
    submitted_batch(h.store.as_ref(), 52, 2, "brute-5")?;
    complete_part(&h.fake, job_id(52, 0), 100, 1);
    complete_part(&h.fake, job_id(52, 1), 100, 1);
    h.fake.with(|s| {
        s.fail_archive.insert(job_id(52, 1));
    });

    let outcome = h.archive(52, ArchiveMode::Commit).await?;
    let ArchiveOutcome::Archived { cleanup, .. } = outcome else {
        panic!("expected archived, got {outcome:?}");
    };
    assert_eq!(cleanup.archived_jobs, vec![job_id(52, 0)]);
    assert_eq!(cleanup.pending_jobs, vec![job_id(52, 1)]);

    let rec = h.store.read_batch(BatchSeq(52))?;
    assert_eq!(rec.state, BatchState::Archived);
    let pending: Vec<_> = rec.pending_external_archive().map(|p| p.job_id).collect();
    assert_eq!(pending, vec![job_id(52, 1)]);

    h.fake.with(|s| s.fail_archive.clear());
    let retried = h.archiver.finish_external(BatchSeq(52)).await?;
    assert_eq!(retried.archived_jobs, vec![job_id(52, 1)]);
    assert!(h
        .store
        .read_batch(BatchSeq(52))?
        .pending_external_archive()
        .next()
        .is_none());
    Ok(())
}

#[tokio::test]
async fn anomaly_blocks_at_gate_6_until_overridden() -> anyhow::Result<()> {
    let h = harness("anomaly")?;
    submitted_batch(h.store.as_ref(), 53, 6, "brute-7")?;
    for i in 0..5 {
        complete_part(&h.fake, job_id(53, i), 1_000, 10);
    }
    complete_part(&h.fake, job_id(53, 5), 1_000, 100);

    let outcome = h.archive(53, ArchiveMode::Commit).await?;
    let ArchiveOutcome::Blocked { gate, others, .. } = outcome else {
        panic!("expected blocked, got {outcome:?}");
    };
    assert_eq!(gate.gate, Gate::NoUnresolvedAnomaly);
    assert!(gate.reason.contains("B-0053/p5/brute-7"), "{}", gate.reason);
    assert!(others.is_empty());
    assert!(h.fake.mutations().is_empty());

    h.store.record_anomaly_override(
        BatchSeq(53),
        AnomalyOverride {
            index: PartIndex(5),
            phase: phase("brute-7"),
            operator: "ops".to_string(),
            note: "hashlist had a known weak cluster".to_string(),
            recorded_unix_ms: unix_time_ms(),
        },
    )?;
    let outcome = h.archive(53, ArchiveMode::Commit).await?;
    assert!(
        matches!(outcome, ArchiveOutcome::Archived { .. }),
        "{outcome:?}"
    );
    Ok(())
}

#[tokio::test]
async fn undercounted_part_blocks_a_four_part_batch() -> anyhow::Result<()> {
    let h = harness("anomaly-small")?;
    submitted_batch(h.store.as_ref(), 56, 4, "brute-6")?;
    for i in 0..3 {
        complete_part(&h.fake, job_id(56, i), 1_000, 1_000);
    }
    complete_part(&h.fake, job_id(56, 3), 1_000, 0);

    let outcome = h.archive(56, ArchiveMode::DryRun).await?;
    let ArchiveOutcome::Blocked { gate, .. } = outcome else {
        panic!("expected blocked, got {outcome:?}");
    };
    assert_eq!(gate.gate, Gate::NoUnresolvedAnomaly);
    assert!(gate.reason.contains("B-0056/p3/brute-6"), "{}", gate.reason);
    assert!(!gate.reason.contains("B-0056/p0"), "{}", gate.reason);
    assert!(h.fake.mutations().is_empty());
    Ok(())
}

#[tokio::test]
async fn unavailable_job_query_fails_closed() -> anyhow::Result<()> {
    let h = harness("degraded")?;
    submitted_batch(h.store.as_ref(), 54, 2, "brute-5")?;
    complete_part(&h.fake, job_id(54, 0), 100, 1);
    complete_part(&h.fake, job_id(54, 1), 100, 1);
    h.fake.with(|s| {
        s.fail_get_job.insert(job_id(54, 1));
    });

    let outcome = h.archive(54, ArchiveMode::Commit).await?;
    let ArchiveOutcome::Blocked { gate, others, .. } = outcome else {
        panic!("expected blocked, got {outcome:?}");
    };
    assert_eq!(gate.gate, Gate::DeclaredKeyspace);
    assert!(gate.reason.contains("B-0054/p1"), "{}", gate.reason);
    assert!(others.iter().any(|f| f.gate == Gate::MeasuredProgress));
    assert!(h.fake.mutations().is_empty());
    assert_eq!(h.store.read_batch(BatchSeq(54))?.state, BatchState::Submitted);
    Ok(())
}

#[tokio::test]
async fn missing_part_fails_gate_1() -> anyhow::Result<()> {
    let h = harness("missing-part")?;
    let store: &dyn StateStore = h.store.as_ref();
    store.create_batch(crackctl_core::types::BatchDefinition {
        seq: BatchSeq(55),
        phases: vec![phase("brute-5")],
        part_hashlists: vec![hashlist(55, 0), hashlist(55, 1)],
    })?;
    store.record_part_submitted(
        BatchSeq(55),
        crackctl_core::types::PartRecord {
            index: PartIndex(0),
            phase: phase("brute-5"),
            job_id: job_id(55, 0),
            hashlist_id: hashlist(55, 0),
            priority: 9_945,
            submitted_unix_ms: unix_time_ms(),
            archived: false,
            external_archive_pending: false,
        },
    )?;
    complete_part(&h.fake, job_id(55, 0), 100, 1);

    let outcome = h.archive(55, ArchiveMode::Commit).await?;
    let ArchiveOutcome::Blocked { gate, .. } = outcome else {
        panic!("expected blocked, got {outcome:?}");
    };
    assert_eq!(gate.gate, Gate::DeclaredKeyspace);
    assert!(gate.reason.contains("not submitted"), "{}", gate.reason);
    Ok(())
}
