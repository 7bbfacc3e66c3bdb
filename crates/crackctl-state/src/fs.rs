use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crackctl_core::summary::SnapshotSummary;
use crackctl_core::types::{
    AnomalyOverride, AttackPhase, BatchDefinition, BatchRecord, BatchSeq, BatchState, JobId,
    PartRecord,
};
use crackctl_observe::time::unix_time_ms;
use tracing::{info, warn};

use crate::transitions;
use crate::{write_atomic, StateStore, StateStoreError};

const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(60);
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// JSON-file state store.
///
/// Layout under `root`:
/// - `batches/B-0042.json`: batch, parts, phase log and overrides in one record
/// - `batches/B-0042.json.bak`: previous revision
/// - `locks/B-0042.lock`: writer lock
/// - `snapshot/last.json`: last snapshot summary
#[derive(Debug, Clone)]
pub struct FsStateStore {
    root: PathBuf,
    lock_stale_after: Duration,
    lock_wait: Duration,
    owner: LockOwner,
}

#[derive(Debug, Clone)]
pub struct LockOwner {
    pub name: Option<String>,
}

#[derive(Debug)]
pub struct WriterLockGuard {
    path: PathBuf,
}

impl Drop for WriterLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl FsStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
            lock_wait: DEFAULT_LOCK_WAIT,
            owner: LockOwner { name: None },
        }
    }

    pub fn with_lock_timing(mut self, stale_after: Duration, wait: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self.lock_wait = wait;
        self
    }

    pub fn with_owner(mut self, owner: LockOwner) -> Self {
        self.owner = owner;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn batch_path(&self, seq: BatchSeq) -> PathBuf {
        self.root.join("batches").join(format!("{seq}.json"))
    }

    fn lock_path(&self, seq: BatchSeq) -> PathBuf {
        self.root.join("locks").join(format!("{seq}.lock"))
    }

    fn summary_path(&self) -> PathBuf {
        self.root.join("snapshot").join("last.json")
    }

    pub fn try_acquire_writer_lock(
        &self,
        seq: BatchSeq,
    ) -> Result<Option<WriterLockGuard>, StateStoreError> {
        let path = self.lock_path(seq);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let now_ms = unix_time_ms();
        let content = lock_file_content(now_ms, &self.owner);

        match create_lock_file(&path, &content) {
            Ok(()) => Ok(Some(WriterLockGuard { path })),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.lock_stale_after.is_zero() {
                    return Ok(None);
                }
                if !is_lock_stale(&path, self.lock_stale_after, now_ms)? {
                    return Ok(None);
                }

                warn!(
                    target: "crackctl_audit",
                    event = "writer_lock_reaped",
                    batch = %seq,
                    path = %path.display(),
                    "reaping stale writer lock"
                );
                let _ = std::fs::remove_file(&path);
                match create_lock_file(&path, &content) {
                    Ok(()) => Ok(Some(WriterLockGuard { path })),
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
                    Err(err) => Err(StateStoreError::Io(err)),
                }
            }
            Err(err) => Err(StateStoreError::Io(err)),
        }
    }

    fn acquire_writer_lock(&self, seq: BatchSeq) -> Result<WriterLockGuard, StateStoreError> {
        let start = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire_writer_lock(seq)? {
                return Ok(guard);
            }
            if start.elapsed() >= self.lock_wait {
                return Err(StateStoreError::LockBusy(seq));
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn load(&self, seq: BatchSeq) -> Result<BatchRecord, StateStoreError> {
        let path = self.batch_path(seq);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateStoreError::NotFound(seq))
            }
            Err(err) => return Err(StateStoreError::Io(err)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StateStoreError::Corrupt {
            path: path.display().to_string(),
            source,
        })
    }

    fn commit(&self, rec: &BatchRecord) -> Result<(), StateStoreError> {
        let path = self.batch_path(rec.seq);
        if path.exists() {
            let mut bak = path.clone().into_os_string();
            bak.push(".bak");
            std::fs::copy(&path, PathBuf::from(bak))?;
        }
        let bytes = serde_json::to_vec_pretty(rec)?;
        write_atomic(&path, &bytes)?;
        Ok(())
    }

    /// Read-modify-write under the batch writer lock. Nothing is written when
    /// `f` fails or leaves the record unchanged.
    fn update<F>(&self, seq: BatchSeq, f: F) -> Result<BatchRecord, StateStoreError>
    where
        F: FnOnce(&mut BatchRecord) -> Result<(), StateStoreError>,
    {
        let _guard = self.acquire_writer_lock(seq)?;
        let current = self.load(seq)?;
        let mut next = current.clone();
        f(&mut next)?;
        if next == current {
            return Ok(current);
        }
        next.updated_unix_ms = unix_time_ms();
        self.commit(&next)?;
        Ok(next)
    }
}

impl StateStore for FsStateStore {
    fn create_batch(&self, def: BatchDefinition) -> Result<BatchRecord, StateStoreError> {
        def.validate()?;
        let seq = def.seq;
        let _guard = self.acquire_writer_lock(seq)?;

        match self.load(seq) {
            Ok(existing) if existing.definition() == def => return Ok(existing),
            Ok(_) => return Err(StateStoreError::BatchConflict(seq)),
            Err(StateStoreError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let rec = BatchRecord::new(def, unix_time_ms());
        self.commit(&rec)?;
        info!(
            target: "crackctl_audit",
            event = "batch_created",
            batch = %seq,
            parts = rec.part_count(),
            phases = rec.phases.len() as u64,
            "batch created"
        );
        Ok(rec)
    }

    fn read_batch(&self, seq: BatchSeq) -> Result<BatchRecord, StateStoreError> {
        self.load(seq)
    }

    fn list_batches(&self) -> Result<Vec<BatchSeq>, StateStoreError> {
        let dir = self.root.join("batches");
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StateStoreError::Io(err)),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(seq) = parse_batch_file_name(name) {
                out.push(seq);
            }
        }
        out.sort();
        Ok(out)
    }

    fn record_part_submitted(
        &self,
        seq: BatchSeq,
        part: PartRecord,
    ) -> Result<BatchRecord, StateStoreError> {
        let job_id = part.job_id;
        let key = part.key(seq);
        let rec = self.update(seq, |rec| transitions::apply_part_submitted(rec, part))?;
        info!(
            target: "crackctl_audit",
            event = "part_recorded",
            batch = %seq,
            part = %key.index,
            phase = %key.phase,
            job_id = %job_id,
            state = %rec.state,
            "part submission recorded"
        );
        Ok(rec)
    }

    fn record_attack_phase_applied(
        &self,
        seq: BatchSeq,
        phase: &AttackPhase,
        cracked: u64,
    ) -> Result<BatchRecord, StateStoreError> {
        let rec = self.update(seq, |rec| {
            transitions::apply_phase_applied(rec, phase, cracked, unix_time_ms())
        })?;
        info!(
            target: "crackctl_audit",
            event = "phase_applied",
            batch = %seq,
            phase = %phase,
            cracked = cracked,
            "attack phase recorded as applied"
        );
        Ok(rec)
    }

    fn record_observed_state(
        &self,
        seq: BatchSeq,
        state: BatchState,
    ) -> Result<BatchRecord, StateStoreError> {
        self.update(seq, |rec| transitions::apply_observed_state(rec, state))
    }

    fn record_anomaly_override(
        &self,
        seq: BatchSeq,
        ov: AnomalyOverride,
    ) -> Result<BatchRecord, StateStoreError> {
        let index = ov.index;
        let phase = ov.phase.clone();
        let operator = ov.operator.clone();
        let rec = self.update(seq, |rec| {
            transitions::apply_anomaly_override(rec, ov).map(|_| ())
        })?;
        info!(
            target: "crackctl_audit",
            event = "anomaly_override",
            batch = %seq,
            part = %index,
            phase = %phase,
            operator = %operator,
            "anomaly override recorded"
        );
        Ok(rec)
    }

    fn mark_batch_archived(&self, seq: BatchSeq) -> Result<BatchRecord, StateStoreError> {
        let rec = self.update(seq, transitions::apply_archived)?;
        info!(
            target: "crackctl_audit",
            event = "batch_archived_local",
            batch = %seq,
            parts = rec.parts.len() as u64,
            "batch and parts marked ARCHIVED"
        );
        Ok(rec)
    }

    fn confirm_external_archive(
        &self,
        seq: BatchSeq,
        jobs: &[JobId],
    ) -> Result<BatchRecord, StateStoreError> {
        self.update(seq, |rec| transitions::apply_external_confirmed(rec, jobs))
    }

    fn write_snapshot_summary(&self, summary: &SnapshotSummary) -> Result<(), StateStoreError> {
        let bytes = serde_json::to_vec_pretty(summary)?;
        write_atomic(&self.summary_path(), &bytes)?;
        Ok(())
    }

    fn read_snapshot_summary(&self) -> Result<Option<SnapshotSummary>, StateStoreError> {
        let path = self.summary_path();
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StateStoreError::Corrupt {
                    path: path.display().to_string(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StateStoreError::Io(err)),
        }
    }
}

fn parse_batch_file_name(name: &str) -> Option<BatchSeq> {
    name.strip_suffix(".json")?
        .strip_prefix("B-")?
        .parse::<u32>()
        .ok()
        .map(BatchSeq)
}

fn create_lock_file(path: &Path, content: &str) -> Result<(), std::io::Error> {
    use std::io::Write;

    let mut f = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)?;
    f.write_all(content.as_bytes())?;
    f.sync_all()?;
    Ok(())
}

fn lock_file_content(unix_time_ms: u64, owner: &LockOwner) -> String {
    let name = owner.name.as_deref().unwrap_or("");
    format!(
        "unix_time_ms={unix_time_ms}\npid={}\nowner={name}\n",
        std::process::id()
    )
}

fn is_lock_stale(path: &Path, stale_after: Duration, now_ms: u64) -> Result<bool, StateStoreError> {
    let content = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(StateStoreError::Io(err)),
    };

    let text = String::from_utf8_lossy(&content);
    let lock_ms = text.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        if k.trim() == "unix_time_ms" {
            v.trim().parse::<u64>().ok()
        } else {
            None
        }
    });

    let Some(lock_ms) = lock_ms else {
        return Ok(false);
    };

    let age_ms = now_ms.saturating_sub(lock_ms);
    Ok(age_ms >= stale_after.as_millis().min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crackctl_core::types::{HashlistId, PartIndex};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn temp_root(test_name: &str) -> anyhow::Result<PathBuf> {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "crackctl-state-{}-{}-{}",
            test_name,
            std::process::id(),
            unix_time_ms()
        ));
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }

    fn phase(name: &str) -> AttackPhase {
        AttackPhase::parse(name).unwrap()
    }

    fn definition(seq: u32, parts: u64) -> BatchDefinition {
        BatchDefinition {
            seq: BatchSeq(seq),
            phases: vec![phase("brute-5")],
            part_hashlists: (0..parts).map(|i| HashlistId(500 + i)).collect(),
        }
    }

    fn part(index: u32, job: u64) -> PartRecord {
        PartRecord {
            index: PartIndex(index),
            phase: phase("brute-5"),
            job_id: JobId(job),
            hashlist_id: HashlistId(500 + u64::from(index)),
            priority: 9_958,
            submitted_unix_ms: unix_time_ms(),
            archived: false,
            external_archive_pending: false,
        }
    }

    #[test]
    fn create_batch_is_idempotent_for_identical_definition() -> anyhow::Result<()> {
        let store = FsStateStore::new(temp_root("create-idempotent")?);
        let first = store.create_batch(definition(42, 8))?;
        let second = store.create_batch(definition(42, 8))?;
        assert_eq!(first, second);

        let err = store.create_batch(definition(42, 7)).unwrap_err();
        match err {
            StateStoreError::BatchConflict(seq) => assert_eq!(seq, BatchSeq(42)),
            other => panic!("expected BatchConflict, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn read_missing_batch_is_not_found() -> anyhow::Result<()> {
        let store = FsStateStore::new(temp_root("missing")?);
        match store.read_batch(BatchSeq(1)).unwrap_err() {
            StateStoreError::NotFound(seq) => assert_eq!(seq, BatchSeq(1)),
            other => panic!("expected NotFound, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn list_batches_is_sorted_and_ignores_backups() -> anyhow::Result<()> {
        let store = FsStateStore::new(temp_root("list")?);
        store.create_batch(definition(44, 1))?;
        store.create_batch(definition(3, 1))?;
        store.record_part_submitted(BatchSeq(3), part(0, 1))?;
        assert!(store.root().join("batches").join("B-0003.json.bak").exists());
        assert_eq!(store.list_batches()?, vec![BatchSeq(3), BatchSeq(44)]);
        Ok(())
    }

    #[test]
    fn resubmission_is_rejected_and_not_persisted() -> anyhow::Result<()> {
        let store = FsStateStore::new(temp_root("resubmit")?);
        store.create_batch(definition(42, 2))?;
        store.record_part_submitted(BatchSeq(42), part(0, 10))?;

        let err = store
            .record_part_submitted(BatchSeq(42), part(0, 11))
            .unwrap_err();
        assert!(err.is_invalid_transition(), "{err}");

        let rec = store.read_batch(BatchSeq(42))?;
        assert_eq!(rec.parts.len(), 1);
        assert_eq!(rec.parts[0].job_id, JobId(10));
        Ok(())
    }

    #[test]
    fn archive_before_complete_is_rejected() -> anyhow::Result<()> {
        let store = FsStateStore::new(temp_root("archive-early")?);
        store.create_batch(definition(42, 1))?;
        store.record_part_submitted(BatchSeq(42), part(0, 10))?;

        let err = store.mark_batch_archived(BatchSeq(42)).unwrap_err();
        assert!(err.is_invalid_transition(), "{err}");
        assert_eq!(store.read_batch(BatchSeq(42))?.state, BatchState::Submitted);

        store.record_observed_state(BatchSeq(42), BatchState::Complete)?;
        let rec = store.mark_batch_archived(BatchSeq(42))?;
        assert_eq!(rec.state, BatchState::Archived);
        assert!(rec.parts.iter().all(|p| p.archived));

        let rec = store.confirm_external_archive(BatchSeq(42), &[JobId(10)])?;
        assert_eq!(rec.pending_external_archive().count(), 0);
        Ok(())
    }

    #[test]
    fn busy_writer_lock_times_out() -> anyhow::Result<()> {
        let store = FsStateStore::new(temp_root("lock-busy")?)
            .with_lock_timing(Duration::from_secs(60), Duration::from_millis(50));
        store.create_batch(definition(9, 1))?;

        let _held = store
            .try_acquire_writer_lock(BatchSeq(9))?
            .expect("first acquisition wins");
        match store.record_part_submitted(BatchSeq(9), part(0, 1)).unwrap_err() {
            StateStoreError::LockBusy(seq) => assert_eq!(seq, BatchSeq(9)),
            other => panic!("expected LockBusy, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn writer_lock_allows_single_winner() -> anyhow::Result<()> {
        let store = Arc::new(FsStateStore::new(temp_root("lock-single-winner")?));

        let threads = 12;
        let barrier = Arc::new(Barrier::new(threads));
        let winners = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..threads {
            let store = store.clone();
            let barrier = barrier.clone();
            let winners = winners.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                let guard = store
                    .try_acquire_writer_lock(BatchSeq(1))
                    .expect("lock acquisition should not error");
                if guard.is_some() {
                    winners.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                }
            }));
        }

        for h in handles {
            h.join().expect("thread join");
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn stale_writer_lock_is_reaped() -> anyhow::Result<()> {
        let store = FsStateStore::new(temp_root("lock-stale-reap")?)
            .with_lock_timing(Duration::from_millis(1), Duration::from_millis(10));

        let lock_path = store.lock_path(BatchSeq(2));
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&lock_path, lock_file_content(0, &LockOwner { name: None }))?;

        let guard = store.try_acquire_writer_lock(BatchSeq(2))?;
        assert!(guard.is_some(), "expected to reap stale lock");
        Ok(())
    }

    #[test]
    fn snapshot_summary_is_absent_until_written() -> anyhow::Result<()> {
        use crackctl_core::observed::Observed;
        use crackctl_core::summary::AgentHealthCounts;

        let store = FsStateStore::new(temp_root("summary")?);
        assert_eq!(store.read_snapshot_summary()?, None);

        let summary = SnapshotSummary {
            taken_unix_s: 1_700_000_000,
            agents: Observed::Known(AgentHealthCounts {
                healthy: 3,
                idle: 1,
                stale: 0,
                critical: 0,
            }),
            parts_observed: 8,
            parts_unavailable: 0,
            degraded_batches: Vec::new(),
            stuck_chunks: Vec::new(),
        };
        store.write_snapshot_summary(&summary)?;
        assert_eq!(store.read_snapshot_summary()?, Some(summary));
        Ok(())
    }

    #[test]
    fn batch_file_names_parse() {
        assert_eq!(parse_batch_file_name("B-0042.json"), Some(BatchSeq(42)));
        assert_eq!(parse_batch_file_name("B-0042.json.bak"), None);
        assert_eq!(parse_batch_file_name("notes.json"), None);
    }
}
