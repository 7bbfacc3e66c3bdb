#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crackctl_client::{ChunkRemedy, ClientError, Orchestrator};
use crackctl_core::types::{
    AgentId, AgentRecord, AttackPhase, BatchDefinition, BatchRecord, BatchSeq, ChunkId,
    ChunkRecord, ChunkState, DependencyProbe, DependencyRef, FileId, HashlistId, JobId, JobRecord,
    JobSummary, KeyRange, NewJob, PartIndex, PartRecord,
};
use crackctl_observe::time::{unix_time_ms, unix_time_secs};
use crackctl_state::{FsStateStore, StateStore};

/// Every write the controller issued against the fake server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateJob(String),
    ArchiveJob(JobId),
    ClearAgent(AgentId),
    RestartAgent(AgentId),
    AbortChunk(ChunkId),
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub agents: Vec<AgentRecord>,
    pub jobs: BTreeMap<JobId, JobRecord>,
    /// Successive `list_chunks` readings per job; the last one repeats.
    pub chunk_readings: HashMap<JobId, VecDeque<Vec<ChunkRecord>>>,
    pub probes: HashMap<FileId, DependencyProbe>,
    pub created: Vec<NewJob>,
    pub mutations: Vec<Mutation>,
    pub next_job_id: u64,
    pub list_chunk_calls: u64,

    /// Latency of every `get_job`, unless `slow_jobs` names the job.
    pub query_delay: Option<Duration>,
    pub slow_jobs: HashMap<JobId, Duration>,
    /// `get_job` calls currently sleeping; cancelled calls stay counted.
    pub in_flight: u64,
    pub peak_in_flight: u64,

    pub fail_list_agents: bool,
    pub fail_list_jobs: bool,
    pub fail_get_job: HashSet<JobId>,
    pub fail_archive: HashSet<JobId>,
    pub fail_clear: HashSet<AgentId>,
}

/// In-memory orchestration server with scripted reads.
#[derive(Debug, Default)]
pub struct FakeOrchestrator {
    state: Mutex<FakeState>,
}

fn transient(what: &str) -> ClientError {
    ClientError::Transient {
        what: what.to_string(),
        message: "scripted failure".to_string(),
    }
}

impl FakeOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.with(|s| s.mutations.clone())
    }

    pub fn add_job(&self, job: JobRecord, chunks: Vec<ChunkRecord>) {
        self.with(|s| {
            s.chunk_readings.insert(job.id, VecDeque::from([chunks]));
            s.jobs.insert(job.id, job);
        });
    }

    pub fn script_chunks(&self, job: JobId, readings: Vec<Vec<ChunkRecord>>) {
        self.with(|s| {
            s.chunk_readings.insert(job, readings.into());
        });
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, ClientError> {
        self.with(|s| {
            if s.fail_list_agents {
                return Err(transient("listAgents"));
            }
            Ok(s.agents.clone())
        })
    }

    async fn list_jobs(&self) -> Result<Vec<JobSummary>, ClientError> {
        self.with(|s| {
            if s.fail_list_jobs {
                return Err(transient("listTasks"));
            }
            Ok(s.jobs
                .values()
                .map(|j| JobSummary {
                    id: j.id,
                    name: j.name.clone(),
                    archived: j.archived,
                })
                .collect())
        })
    }

    async fn get_job(&self, job: JobId) -> Result<JobRecord, ClientError> {
        let delay = self.with(|s| {
            s.in_flight += 1;
            s.peak_in_flight = s.peak_in_flight.max(s.in_flight);
            s.slow_jobs.get(&job).copied().or(s.query_delay)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            s.in_flight -= 1;
            if s.fail_get_job.contains(&job) {
                return Err(transient("getTask"));
            }
            s.jobs.get(&job).cloned().ok_or_else(|| ClientError::Rejected {
                section: "task",
                request: "getTask",
                message: format!("no task {job}"),
            })
        })
    }

    async fn list_chunks(&self, job: JobId) -> Result<Vec<ChunkRecord>, ClientError> {
        self.with(|s| {
            s.list_chunk_calls += 1;
            let readings = s.chunk_readings.entry(job).or_default();
            let reading = if readings.len() > 1 {
                readings.pop_front()
            } else {
                readings.front().cloned()
            };
            Ok(reading.unwrap_or_default())
        })
    }

    async fn create_job(&self, job: &NewJob) -> Result<JobId, ClientError> {
        self.with(|s| {
            s.next_job_id += 1;
            let id = JobId(9_000 + s.next_job_id);
            s.jobs.insert(
                id,
                JobRecord {
                    id,
                    name: job.name.clone(),
                    keyspace: 0,
                    keyspace_progress: 0,
                    cracked: 0,
                    priority: job.priority,
                    advisory_progress_pct: None,
                    archived: false,
                },
            );
            s.created.push(job.clone());
            s.mutations.push(Mutation::CreateJob(job.name.clone()));
            Ok(id)
        })
    }

    async fn archive_job(&self, job: JobId) -> Result<(), ClientError> {
        self.with(|s| {
            if s.fail_archive.contains(&job) {
                return Err(transient("archiveTask"));
            }
            if let Some(j) = s.jobs.get_mut(&job) {
                j.archived = true;
            }
            s.mutations.push(Mutation::ArchiveJob(job));
            Ok(())
        })
    }

    async fn clear_agent_assignment(&self, agent: AgentId) -> Result<(), ClientError> {
        self.with(|s| {
            if s.fail_clear.contains(&agent) {
                return Err(transient("taskUnassignAgent"));
            }
            if let Some(a) = s.agents.iter_mut().find(|a| a.id == agent) {
                a.assigned_job = None;
            }
            s.mutations.push(Mutation::ClearAgent(agent));
            Ok(())
        })
    }

    async fn check_dependency(&self, dep: &DependencyRef) -> Result<DependencyProbe, ClientError> {
        self.with(|s| {
            Ok(s.probes
                .get(&dep.file_id)
                .cloned()
                .unwrap_or(DependencyProbe::Resolvable))
        })
    }
}

#[derive(Debug)]
pub struct FakeRemedy {
    pub restart_supported: bool,
    pub log: Mutex<Vec<Mutation>>,
}

impl FakeRemedy {
    pub fn new(restart_supported: bool) -> Arc<Self> {
        Arc::new(Self {
            restart_supported,
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Mutation> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkRemedy for FakeRemedy {
    async fn request_agent_restart(&self, agent: AgentId) -> Result<(), ClientError> {
        if !self.restart_supported {
            return Err(ClientError::Unsupported("no agent control channel"));
        }
        self.log.lock().unwrap().push(Mutation::RestartAgent(agent));
        Ok(())
    }

    async fn abort_chunk(&self, chunk: ChunkId) -> Result<(), ClientError> {
        self.log.lock().unwrap().push(Mutation::AbortChunk(chunk));
        Ok(())
    }
}

pub fn temp_root(test_name: &str) -> anyhow::Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "crackctl-reconcile-{}-{}-{}",
        test_name,
        std::process::id(),
        unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

pub fn temp_store(test_name: &str) -> anyhow::Result<Arc<FsStateStore>> {
    Ok(Arc::new(FsStateStore::new(temp_root(test_name)?)))
}

pub fn phase(name: &str) -> AttackPhase {
    AttackPhase::parse(name).unwrap()
}

pub fn hashlist(seq: u32, index: u32) -> HashlistId {
    HashlistId(u64::from(seq) * 100 + u64::from(index))
}

pub fn job_id(seq: u32, index: u32) -> JobId {
    JobId(u64::from(seq) * 100 + u64::from(index))
}

/// Creates `parts` parts of one phase and records each as submitted with
/// job id `seq * 100 + index`.
pub fn submitted_batch(
    store: &dyn StateStore,
    seq: u32,
    parts: u32,
    phase_name: &str,
) -> anyhow::Result<BatchRecord> {
    let def = BatchDefinition {
        seq: BatchSeq(seq),
        phases: vec![phase(phase_name)],
        part_hashlists: (0..parts).map(|i| hashlist(seq, i)).collect(),
    };
    store.create_batch(def)?;
    let mut rec = store.read_batch(BatchSeq(seq))?;
    for i in 0..parts {
        rec = store.record_part_submitted(
            BatchSeq(seq),
            PartRecord {
                index: PartIndex(i),
                phase: phase(phase_name),
                job_id: job_id(seq, i),
                hashlist_id: hashlist(seq, i),
                priority: 10_000 - seq,
                submitted_unix_ms: unix_time_ms(),
                archived: false,
                external_archive_pending: false,
            },
        )?;
    }
    Ok(rec)
}

pub fn job(id: JobId, keyspace: u64, progress: u64, cracked: u64) -> JobRecord {
    JobRecord {
        id,
        name: format!("job-{id}"),
        keyspace,
        keyspace_progress: progress,
        cracked,
        priority: 1,
        advisory_progress_pct: Some(progress as f64 * 100.0 / keyspace.max(1) as f64),
        archived: false,
    }
}

pub fn chunk(id: u64, job: JobId, range: KeyRange, state: ChunkState) -> ChunkRecord {
    ChunkRecord {
        id: ChunkId(id),
        job_id: job,
        agent_id: Some(AgentId(1)),
        range,
        progress: if state.is_terminal_success() {
            range.end
        } else {
            range.start
        },
        state,
        dispatched_unix_s: unix_time_secs(),
        cracked: 0,
    }
}

/// A part whose two FINISHED chunks cover `[0, keyspace)`.
pub fn complete_part(fake: &FakeOrchestrator, id: JobId, keyspace: u64, cracked: u64) {
    let half = keyspace / 2;
    fake.add_job(
        job(id, keyspace, keyspace, cracked),
        vec![
            chunk(id.0 * 10, id, KeyRange::new(0, half), ChunkState::Finished),
            chunk(id.0 * 10 + 1, id, KeyRange::new(half, keyspace), ChunkState::Finished),
        ],
    );
}

pub fn agent(id: u64, assigned: Option<JobId>, heartbeat_age_s: u64) -> AgentRecord {
    AgentRecord {
        id: AgentId(id),
        name: format!("agent-{id}"),
        last_heartbeat_unix_s: Some(unix_time_secs().saturating_sub(heartbeat_age_s)),
        assigned_job: assigned,
        active: true,
    }
}
