use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crackctl_core::types::{
    AgentId, AgentRecord, ChunkId, ChunkRecord, DependencyProbe, DependencyRef, JobId, JobRecord,
    JobSummary, NewJob,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::retry::{is_transient_error, is_transient_status, send_with_retry, RetryPolicy};
use crate::wire::{
    AgentDetail, AgentListing, ChunkDetail, ConvertError, CreatedTask, Envelope, FileDetail,
    TaskDetail, TaskListing, ToCore, ToWire, TryToCore,
};
use crate::{ChunkRemedy, ClientError, Orchestrator};

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// User API endpoint, e.g. `https://orchestrator.example/api/user.php`.
    pub endpoint: String,
    pub access_key: String,
    /// Worker download path; derived from `endpoint` when unset.
    pub file_fetch_url: Option<String>,
    pub worker_token: Option<String>,
    /// Lifecycle-control channel for agent restarts. Restart is unsupported
    /// without it.
    pub agent_control_url: Option<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl HttpConfig {
    pub fn new(endpoint: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_key: access_key.into(),
            file_fetch_url: None,
            worker_token: None,
            agent_control_url: None,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }

    fn resolved_file_fetch_url(&self) -> String {
        if let Some(url) = &self.file_fetch_url {
            return url.clone();
        }
        match self.endpoint.strip_suffix("/api/user.php") {
            Some(base) => format!("{base}/getFile.php"),
            None => format!("{}/getFile.php", self.endpoint.trim_end_matches('/')),
        }
    }
}

#[derive(Debug, Clone)]
struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
    access_key: String,
    retry: RetryPolicy,
    salt: Arc<AtomicU64>,
}

fn transport_error(what: &str, err: reqwest::Error) -> ClientError {
    if err.is_decode() && !is_transient_error(&err) {
        return ClientError::Decode {
            what: what.to_string(),
            message: err.to_string(),
        };
    }
    ClientError::Transient {
        what: what.to_string(),
        message: err.to_string(),
    }
}

fn status_error(what: &str, status: reqwest::StatusCode) -> ClientError {
    if is_transient_status(status) {
        ClientError::Transient {
            what: what.to_string(),
            message: format!("http {status}"),
        }
    } else {
        ClientError::Status {
            what: what.to_string(),
            status: status.as_u16(),
        }
    }
}

impl ApiClient {
    fn new(cfg: &HttpConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| ClientError::Decode {
                what: "http client".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            access_key: cfg.access_key.clone(),
            retry: cfg.retry,
            salt: Arc::new(AtomicU64::new(0)),
        })
    }

    fn next_salt(&self) -> u64 {
        self.salt.fetch_add(1, Ordering::Relaxed)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        section: &'static str,
        request: &'static str,
        params: Value,
    ) -> Result<T, ClientError> {
        let what = format!("{section}/{request}");
        let decode = |message: String| ClientError::Decode {
            what: what.clone(),
            message,
        };

        let mut body = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(decode(format!("params must be an object, got {other}"))),
        };
        body.insert("section".to_string(), Value::from(section));
        body.insert("request".to_string(), Value::from(request));
        body.insert(
            "accessKey".to_string(),
            Value::from(self.access_key.clone()),
        );
        let body = Value::Object(body);

        let resp = send_with_retry(&self.retry, &what, self.next_salt(), || {
            self.http.post(&self.endpoint).json(&body).send()
        })
        .await
        .map_err(|e| transport_error(&what, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(&what, status));
        }
        let bytes = resp.bytes().await.map_err(|e| transport_error(&what, e))?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| decode(e.to_string()))?;
        let envelope: Envelope =
            serde_json::from_value(value.clone()).map_err(|e| decode(e.to_string()))?;
        if envelope.response != "OK" {
            return Err(ClientError::Rejected {
                section,
                request,
                message: envelope.message.unwrap_or(envelope.response),
            });
        }
        serde_json::from_value(value).map_err(|e| decode(e.to_string()))
    }
}

/// [`Orchestrator`] over the server's JSON user API.
#[derive(Debug, Clone)]
pub struct HttpOrchestrator {
    api: ApiClient,
    file_fetch_url: String,
    worker_token: Option<String>,
}

impl HttpOrchestrator {
    pub fn new(cfg: &HttpConfig) -> Result<Self, ClientError> {
        Ok(Self {
            api: ApiClient::new(cfg)?,
            file_fetch_url: cfg.resolved_file_fetch_url(),
            worker_token: cfg.worker_token.clone(),
        })
    }

    async fn task_detail(&self, job: JobId) -> Result<TaskDetail, ClientError> {
        self.api
            .call("task", "getTask", json!({ "taskId": job.0 }))
            .await
    }

    async fn fetch_as_worker(&self, dep: &DependencyRef) -> Result<DependencyProbe, ClientError> {
        let what = format!("fetch {}", dep.name);
        let file = dep.file_id.0.to_string();
        let mut query = vec![("file", file.as_str())];
        if let Some(token) = &self.worker_token {
            query.push(("token", token.as_str()));
        }

        let resp = send_with_retry(&self.api.retry, &what, self.api.next_salt(), || {
            self.api
                .http
                .get(&self.file_fetch_url)
                .query(&query)
                .header(reqwest::header::RANGE, "bytes=0-0")
                .send()
        })
        .await
        .map_err(|e| transport_error(&what, e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::PARTIAL_CONTENT || status == reqwest::StatusCode::OK {
            return Ok(DependencyProbe::Resolvable);
        }
        if is_transient_status(status) {
            return Err(status_error(&what, status));
        }
        Ok(DependencyProbe::Unresolvable {
            reason: format!("worker fetch returned http {status}"),
        })
    }
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, ClientError> {
        let listing: AgentListing = self.api.call("agent", "listAgents", Value::Null).await?;
        let mut out = Vec::with_capacity(listing.agents.len());
        for row in listing.agents {
            let detail: AgentDetail = self
                .api
                .call("agent", "get", json!({ "agentId": row.agent_id }))
                .await?;
            out.push(detail.try_to_core()?);
        }
        Ok(out)
    }

    async fn list_jobs(&self) -> Result<Vec<JobSummary>, ClientError> {
        let listing: TaskListing = self.api.call("task", "listTasks", Value::Null).await?;
        Ok(listing.tasks.iter().map(|t| t.to_core()).collect())
    }

    async fn get_job(&self, job: JobId) -> Result<JobRecord, ClientError> {
        Ok(self.task_detail(job).await?.try_to_core()?)
    }

    async fn list_chunks(&self, job: JobId) -> Result<Vec<ChunkRecord>, ClientError> {
        let task = self.task_detail(job).await?;
        let mut out = Vec::with_capacity(task.chunk_ids.len());
        for chunk_id in task.chunk_ids {
            let detail: ChunkDetail = self
                .api
                .call("task", "getChunk", json!({ "chunkId": chunk_id }))
                .await?;
            if detail.task_id != job.0 {
                return Err(ConvertError::UnknownValue {
                    field: "chunk.taskId",
                    value: detail.task_id.to_string(),
                }
                .into());
            }
            out.push(detail.try_to_core()?);
        }
        Ok(out)
    }

    async fn create_job(&self, job: &NewJob) -> Result<JobId, ClientError> {
        let params = serde_json::to_value(job.to_wire()).map_err(|e| ClientError::Decode {
            what: "task/createTask".to_string(),
            message: e.to_string(),
        })?;
        let created: CreatedTask = self.api.call("task", "createTask", params).await?;
        Ok(JobId(created.task_id))
    }

    async fn archive_job(&self, job: JobId) -> Result<(), ClientError> {
        let _: Envelope = self
            .api
            .call("task", "archiveTask", json!({ "taskId": job.0 }))
            .await?;
        Ok(())
    }

    async fn clear_agent_assignment(&self, agent: AgentId) -> Result<(), ClientError> {
        let _: Envelope = self
            .api
            .call("task", "taskUnassignAgent", json!({ "agentId": agent.0 }))
            .await?;
        Ok(())
    }

    async fn check_dependency(&self, dep: &DependencyRef) -> Result<DependencyProbe, ClientError> {
        let meta: Result<FileDetail, ClientError> = self
            .api
            .call("file", "getFile", json!({ "fileId": dep.file_id.0 }))
            .await;
        let meta = match meta {
            Ok(meta) => meta,
            Err(ClientError::Rejected { message, .. }) => {
                return Ok(DependencyProbe::Missing { reason: message })
            }
            Err(err) => return Err(err),
        };
        if meta.filename != dep.name {
            return Ok(DependencyProbe::Missing {
                reason: format!(
                    "file {} is named {:?} on the server, expected {:?}",
                    meta.file_id, meta.filename, dep.name
                ),
            });
        }
        if meta.size == Some(0) {
            return Ok(DependencyProbe::Unresolvable {
                reason: format!("file {} is empty", meta.file_id),
            });
        }
        let probe = self.fetch_as_worker(dep).await?;
        debug!(file = %dep.file_id, name = %dep.name, ?probe, "dependency probed");
        Ok(probe)
    }
}

/// [`ChunkRemedy`] over the user API plus an optional agent-control channel.
#[derive(Debug, Clone)]
pub struct HttpRemedy {
    api: ApiClient,
    agent_control_url: Option<String>,
}

impl HttpRemedy {
    pub fn new(cfg: &HttpConfig) -> Result<Self, ClientError> {
        Ok(Self {
            api: ApiClient::new(cfg)?,
            agent_control_url: cfg.agent_control_url.clone(),
        })
    }
}

#[async_trait]
impl ChunkRemedy for HttpRemedy {
    async fn request_agent_restart(&self, agent: AgentId) -> Result<(), ClientError> {
        let Some(base) = &self.agent_control_url else {
            return Err(ClientError::Unsupported("no agent-control channel configured"));
        };
        let what = format!("restart agent {agent}");
        let url = format!("{}/agents/{agent}/restart", base.trim_end_matches('/'));
        let resp = send_with_retry(&self.api.retry, &what, self.api.next_salt(), || {
            self.api
                .http
                .post(&url)
                .bearer_auth(&self.api.access_key)
                .send()
        })
        .await
        .map_err(|e| transport_error(&what, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(&what, status));
        }
        Ok(())
    }

    async fn abort_chunk(&self, chunk: ChunkId) -> Result<(), ClientError> {
        let _: Envelope = self
            .api
            .call("task", "abortChunk", json!({ "chunkId": chunk.0 }))
            .await?;
        Ok(())
    }
}
