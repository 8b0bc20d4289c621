//! `JobStore` trait: single async interface for job and document persistence.
//!
//! The store is the only source of truth for job progress and status. Every
//! counter mutation is one atomic statement so that many workers can update
//! the same parent concurrently without a long-held lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{Document, Job, JobStatus, TaskOutcome};

/// Child task counts of a parent, grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Backend-agnostic job store.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job row.
    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Root jobs, optionally filtered by status, newest first.
    async fn list_parent_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, DatabaseError>;

    /// Child rows of a parent in creation order.
    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<Job>, DatabaseError>;

    /// Aggregate child statuses of a parent.
    async fn child_stats(&self, parent_id: Uuid) -> Result<ChildStats, DatabaseError>;

    // ── Progress ────────────────────────────────────────────────────

    /// Refresh the heartbeat of a running job.
    async fn heartbeat(&self, job_id: Uuid) -> Result<(), DatabaseError>;

    /// Register up to `requested` new children: total/pending += n and any
    /// completion candidacy is cleared. `max_pages` (0 = unlimited) caps the
    /// parent's total. Returns how many were granted.
    async fn reserve_children(
        &self,
        parent_id: Uuid,
        requested: u64,
        max_pages: u64,
    ) -> Result<u64, DatabaseError>;

    /// Undo reservations whose tasks could not be enqueued.
    async fn release_children(&self, parent_id: Uuid, count: u64) -> Result<(), DatabaseError>;

    /// Move a child from pending to running. Returns false when the child
    /// is already running or finished.
    async fn start_child(&self, child_id: Uuid, parent_id: Uuid) -> Result<bool, DatabaseError>;

    /// Record the outcome of a child exactly once and update the parent's
    /// counters. Returns false when the child had already finished.
    async fn finish_child(
        &self,
        child_id: Uuid,
        parent_id: Uuid,
        outcome: TaskOutcome,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    // ── Completion ──────────────────────────────────────────────────

    /// Begin completion candidacy if the job is running, idle and not
    /// already a candidate.
    async fn mark_completion_candidate(
        &self,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Drop completion candidacy.
    async fn clear_completion_candidate(&self, job_id: Uuid) -> Result<bool, DatabaseError>;

    /// Complete the job if it is still idle under the candidacy that started
    /// at `candidate_at` and no heartbeat arrived since. Syncs
    /// result/failed counts from the live progress.
    async fn complete_job(
        &self,
        job_id: Uuid,
        candidate_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Fail or cancel a job, cancel its non-terminal children and sync the
    /// result/failed counts. Returns false if it was already terminal.
    async fn terminate_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        reason: &str,
    ) -> Result<bool, DatabaseError>;

    /// Clear candidacy on every running job. Used on startup recovery.
    async fn reset_completion_candidates(&self) -> Result<u64, DatabaseError>;

    // ── Documents ───────────────────────────────────────────────────

    /// Persist a document.
    async fn save_document(&self, doc: &Document) -> Result<(), DatabaseError>;

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, DatabaseError>;

    /// The document already saved by a child task, if any.
    async fn document_for_job(&self, job_id: Uuid) -> Result<Option<Document>, DatabaseError>;

    /// Documents saved under a parent job, oldest first.
    async fn list_documents(&self, parent_job_id: Uuid) -> Result<Vec<Document>, DatabaseError>;

    /// Bump `metadata.document_count` of a job.
    async fn increment_document_count(&self, job_id: Uuid) -> Result<(), DatabaseError>;

    // ── Bookkeeping ─────────────────────────────────────────────────

    /// Remember a URL under a parent. Returns false if it was seen before.
    async fn mark_url_seen(&self, parent_id: Uuid, url: &str) -> Result<bool, DatabaseError>;

    async fn is_url_seen(&self, parent_id: Uuid, url: &str) -> Result<bool, DatabaseError>;

    /// Undo `mark_url_seen` for a URL that never got a task.
    async fn forget_url(&self, parent_id: Uuid, url: &str) -> Result<(), DatabaseError>;

    /// Append to the bounded recent-error list of a job.
    async fn record_error(&self, job_id: Uuid, message: &str) -> Result<(), DatabaseError>;

    /// Most recent errors, newest first.
    async fn recent_errors(&self, job_id: Uuid, limit: usize) -> Result<Vec<String>, DatabaseError>;

    /// Attach a warning to the job metadata unless already present.
    async fn add_warning(&self, job_id: Uuid, warning: &str) -> Result<bool, DatabaseError>;
}
