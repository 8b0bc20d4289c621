//! Persistent job records, documents and queue task messages.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CrawlConfig;
use crate::error::JobError;
use crate::jobs::state::JobStatus;

/// Well-known job and task type names.
pub mod task_types {
    /// Parent job of a crawl.
    pub const CRAWL: &str = "crawl";
    /// One page of a crawl.
    pub const CRAWL_URL: &str = "crawl_url";
    /// Inline HTML-to-document transform.
    pub const TRANSFORM: &str = "transform";
}

/// Progress counters of a parent job.
///
/// `pending` counts every registered task that has not finished yet, so it
/// includes the `running` ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub running: u64,
    pub cancelled: u64,
}

impl JobProgress {
    /// Tasks waiting in the queue (registered, not yet started).
    pub fn queued(&self) -> u64 {
        self.pending.saturating_sub(self.running)
    }

    /// Human readable summary, e.g. `"3 pending, 1 running, 40 completed, 0 failed"`.
    pub fn summary(&self) -> String {
        format!(
            "{} pending, {} running, {} completed, {} failed",
            self.queued(),
            self.running,
            self.completed,
            self.failed
        )
    }

    /// Share of finished tasks in `0.0..=1.0`.
    pub fn fraction_done(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed + self.failed + self.cancelled) as f64 / self.total as f64
    }
}

/// Workload-specific job configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobConfig {
    Crawl(CrawlConfig),
    Transform,
}

/// Free-form job metadata with a few well-known fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMetadata {
    /// Documents saved under this parent.
    pub document_count: u64,
    /// Where the work came from (seed, external reference).
    pub source_ref: Option<String>,
    /// URL handled by a child task.
    pub url: Option<String>,
    /// Page that discovered this child.
    pub spawned_from: Option<String>,
    /// Non-fatal issues attached by the orchestrator.
    pub warnings: Vec<String>,
}

/// A parent job or one of its child tasks.
///
/// Roots reference themselves through `parent_id`; every descendant carries
/// the root id verbatim regardless of how deep it was discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub parent_id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub depth: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    pub completion_candidate_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub result_count: u64,
    pub failed_count: u64,
    /// Execution attempts of a child task.
    pub attempts: u32,
    /// Short error for failed or cancelled jobs.
    pub error: Option<String>,
    pub config: Option<JobConfig>,
    pub metadata: JobMetadata,
}

impl Job {
    /// New root job in `running` status.
    pub fn new_parent(job_type: impl Into<String>, config: JobConfig, metadata: JobMetadata) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            parent_id: id,
            job_type: job_type.into(),
            status: JobStatus::Running,
            depth: 0,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            last_heartbeat: now,
            completion_candidate_at: None,
            progress: JobProgress::default(),
            result_count: 0,
            failed_count: 0,
            attempts: 0,
            error: None,
            config: Some(config),
            metadata,
        }
    }

    /// New pending child under `parent_id`.
    pub fn new_child(
        parent_id: Uuid,
        job_type: impl Into<String>,
        depth: u32,
        metadata: JobMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            parent_id,
            job_type: job_type.into(),
            status: JobStatus::Pending,
            depth,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_heartbeat: now,
            completion_candidate_at: None,
            progress: JobProgress::default(),
            result_count: 0,
            failed_count: 0,
            attempts: 0,
            error: None,
            config: None,
            metadata,
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == self.parent_id
    }

    pub fn crawl_config(&self) -> Option<&CrawlConfig> {
        match &self.config {
            Some(JobConfig::Crawl(config)) => Some(config),
            _ => None,
        }
    }
}

/// Result of one finished child task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
}

impl TaskOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed => JobStatus::Completed,
            Self::Failed => JobStatus::Failed,
        }
    }
}

/// A unit of work on the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Child job this task executes.
    pub job_id: Uuid,
    /// Root job the child belongs to.
    pub parent_id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: serde_json::Value,
    pub depth: u32,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl TaskMessage {
    /// Build a crawl task for one URL.
    pub fn crawl(
        job_id: Uuid,
        parent_id: Uuid,
        depth: u32,
        task: &CrawlTask,
        config: &CrawlConfig,
    ) -> Result<Self, JobError> {
        Ok(Self {
            job_id,
            parent_id,
            task_type: task_types::CRAWL_URL.to_string(),
            payload: serde_json::to_value(task)
                .map_err(|e| JobError::Validation(format!("crawl payload: {e}")))?,
            depth,
            config: serde_json::to_value(config)
                .map_err(|e| JobError::Validation(format!("crawl config: {e}")))?,
        })
    }

    /// Decode the payload into the worker's typed task.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            JobError::Validation(format!("{} payload for job {}: {e}", self.task_type, self.job_id))
        })
    }

    /// Decode the workload configuration carried with the task.
    pub fn decode_config<T: DeserializeOwned + Default>(&self) -> Result<T, JobError> {
        if self.config.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.config.clone()).map_err(|e| {
            JobError::Validation(format!("{} config for job {}: {e}", self.task_type, self.job_id))
        })
    }
}

/// Payload of a `crawl_url` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlTask {
    pub url: String,
    #[serde(default)]
    pub source_ref: Option<String>,
    /// Page that linked here; `None` for seeds.
    #[serde(default)]
    pub spawned_from: Option<String>,
}

/// Request of the inline transform workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub html: String,
    pub source_ref: String,
}

/// A processed unit of content. Written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub job_id: Uuid,
    pub parent_job_id: Uuid,
    pub source_ref: String,
    pub title: String,
    pub raw_content: String,
    pub converted_content: String,
    pub size: u64,
    pub process_time_ms: u64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
