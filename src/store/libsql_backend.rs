//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! RFC 3339 with fixed microsecond precision so that text comparison inside
//! SQL predicates orders them correctly.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{Document, Job, JobMetadata, JobProgress, JobStatus, TaskOutcome};
use crate::store::migrations;
use crate::store::retry::{RetryPolicy, with_retry};
use crate::store::traits::{ChildStats, JobStore};

/// Stored recent errors per job.
const MAX_STORED_ERRORS: i64 = 50;

/// Compare-and-set attempts for optimistic updates before giving up.
const MAX_CAS_ATTEMPTS: usize = 8;

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    /// Held so the database outlives every clone of `conn`.
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
    retry: RetryPolicy,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            _db: Arc::new(db),
            conn,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the contention backoff.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shared handle to the underlying connection (used by the task queue).
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Execute a write with contention retry. Returns rows affected.
    async fn execute(
        &self,
        name: &'static str,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<u64, DatabaseError> {
        let conn = &self.conn;
        with_retry(self.retry, name, move || {
            let params = params.clone();
            async move {
                conn.execute(sql, params)
                    .await
                    .map_err(|e| DatabaseError::from_libsql(name, e))
            }
        })
        .await
    }

    /// Run a query and map every row.
    async fn query_map<T, F>(
        &self,
        name: &'static str,
        sql: &str,
        params: Vec<Value>,
        map: F,
    ) -> Result<Vec<T>, DatabaseError>
    where
        T: Send,
        F: Fn(&libsql::Row) -> Result<T, DatabaseError> + Sync,
    {
        let conn = &self.conn;
        let map = &map;
        with_retry(self.retry, name, move || {
            let params = params.clone();
            async move {
                let mut rows = conn
                    .query(sql, params)
                    .await
                    .map_err(|e| DatabaseError::from_libsql(name, e))?;
                let mut out = Vec::new();
                while let Some(row) = rows
                    .next()
                    .await
                    .map_err(|e| DatabaseError::from_libsql(name, e))?
                {
                    out.push(map(&row)?);
                }
                Ok(out)
            }
        })
        .await
    }

    async fn read_progress_total(
        &self,
        parent_id: Uuid,
    ) -> Result<Option<(JobStatus, u64)>, DatabaseError> {
        let rows = self
            .query_map(
                "read_progress_total",
                "SELECT status, progress_total FROM jobs WHERE id = ?1",
                vec![uuid_value(parent_id)],
                |row| {
                    let status: String = row.get(0).map_err(row_err)?;
                    let total: i64 = row.get(1).map_err(row_err)?;
                    Ok((parse_status(&status), total.max(0) as u64))
                },
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn read_metadata(&self, job_id: Uuid) -> Result<Option<String>, DatabaseError> {
        let rows = self
            .query_map(
                "read_metadata",
                "SELECT metadata FROM jobs WHERE id = ?1",
                vec![uuid_value(job_id)],
                |row| Ok(row.get::<String>(0).unwrap_or_else(|_| "{}".to_string())),
            )
            .await?;
        Ok(rows.into_iter().next())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp text.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_status(s: &str) -> JobStatus {
    s.parse().unwrap_or(JobStatus::Failed)
}

fn uuid_value(id: Uuid) -> Value {
    Value::Text(id.to_string())
}

fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

fn int(n: u64) -> Value {
    Value::Integer(n.min(i64::MAX as u64) as i64)
}

fn time_value(dt: &DateTime<Utc>) -> Value {
    Value::Text(ts(dt))
}

fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn opt_time(dt: &Option<DateTime<Utc>>) -> Value {
    match dt {
        Some(dt) => time_value(dt),
        None => Value::Null,
    }
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row decode: {e}"))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn count(row: &libsql::Row, idx: i32) -> u64 {
    row.get::<i64>(idx).unwrap_or(0).max(0) as u64
}

const JOB_COLUMNS: &str = "id, parent_id, job_type, status, depth, created_at, started_at, completed_at, last_heartbeat, completion_candidate_at, progress_total, progress_completed, progress_failed, progress_pending, progress_running, progress_cancelled, result_count, failed_count, attempts, error, config, metadata";

const DOCUMENT_COLUMNS: &str = "id, job_id, parent_job_id, source_ref, title, raw_content, converted_content, size, process_time_ms, metadata, created_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let parent_id: String = row.get(1).map_err(row_err)?;
    let status: String = row.get(3).map_err(row_err)?;
    let created: String = row.get(5).map_err(row_err)?;
    let started: Option<String> = row.get(6).ok();
    let completed: Option<String> = row.get(7).ok();
    let heartbeat: String = row.get(8).map_err(row_err)?;
    let candidate: Option<String> = row.get(9).ok();
    let config: Option<String> = row.get(20).ok();
    let metadata: String = row.get(21).unwrap_or_else(|_| "{}".to_string());

    Ok(Job {
        id: parse_uuid(&id)?,
        parent_id: parse_uuid(&parent_id)?,
        job_type: row.get(2).map_err(row_err)?,
        status: parse_status(&status),
        depth: count(row, 4) as u32,
        created_at: parse_datetime(&created),
        started_at: parse_optional_datetime(&started),
        completed_at: parse_optional_datetime(&completed),
        last_heartbeat: parse_datetime(&heartbeat),
        completion_candidate_at: parse_optional_datetime(&candidate),
        progress: JobProgress {
            total: count(row, 10),
            completed: count(row, 11),
            failed: count(row, 12),
            pending: count(row, 13),
            running: count(row, 14),
            cancelled: count(row, 15),
        },
        result_count: count(row, 16),
        failed_count: count(row, 17),
        attempts: count(row, 18) as u32,
        error: row.get(19).ok(),
        config: config.and_then(|c| serde_json::from_str(&c).ok()),
        metadata: serde_json::from_str::<JobMetadata>(&metadata).unwrap_or_default(),
    })
}

fn row_to_document(row: &libsql::Row) -> Result<Document, DatabaseError> {
    let id: String = row.get(0).map_err(row_err)?;
    let job_id: String = row.get(1).map_err(row_err)?;
    let parent_job_id: String = row.get(2).map_err(row_err)?;
    let metadata: String = row.get(9).unwrap_or_else(|_| "{}".to_string());
    let created: String = row.get(10).map_err(row_err)?;

    Ok(Document {
        id: parse_uuid(&id)?,
        job_id: parse_uuid(&job_id)?,
        parent_job_id: parse_uuid(&parent_job_id)?,
        source_ref: row.get(3).map_err(row_err)?,
        title: row.get(4).map_err(row_err)?,
        raw_content: row.get(5).map_err(row_err)?,
        converted_content: row.get(6).map_err(row_err)?,
        size: count(row, 7),
        process_time_ms: count(row, 8),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created),
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlStore {
    // ── Jobs ────────────────────────────────────────────────────────

    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let config = match &job.config {
            Some(config) => Value::Text(to_json(config)?),
            None => Value::Null,
        };
        self.execute(
            "create_job",
            "INSERT INTO jobs (id, parent_id, job_type, status, depth, created_at, started_at, completed_at, last_heartbeat, completion_candidate_at, progress_total, progress_completed, progress_failed, progress_pending, progress_running, progress_cancelled, result_count, failed_count, attempts, error, config, metadata) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            vec![
                uuid_value(job.id),
                uuid_value(job.parent_id),
                text(job.job_type.as_str()),
                text(job.status.as_str()),
                int(job.depth as u64),
                time_value(&job.created_at),
                opt_time(&job.started_at),
                opt_time(&job.completed_at),
                time_value(&job.last_heartbeat),
                opt_time(&job.completion_candidate_at),
                int(job.progress.total),
                int(job.progress.completed),
                int(job.progress.failed),
                int(job.progress.pending),
                int(job.progress.running),
                int(job.progress.cancelled),
                int(job.result_count),
                int(job.failed_count),
                int(job.attempts as u64),
                opt_text(job.error.as_deref()),
                config,
                text(to_json(&job.metadata)?),
            ],
        )
        .await?;
        debug!(job_id = %job.id, parent_id = %job.parent_id, job_type = %job.job_type, "Job created");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let jobs = self
            .query_map("get_job", &sql, vec![uuid_value(id)], row_to_job)
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn list_parent_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, DatabaseError> {
        match status {
            Some(status) => {
                self.query_map(
                    "list_parent_jobs",
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = parent_id AND status = ?1 ORDER BY created_at DESC"),
                    vec![text(status.as_str())],
                    row_to_job,
                )
                .await
            }
            None => {
                self.query_map(
                    "list_parent_jobs",
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = parent_id ORDER BY created_at DESC"),
                    vec![],
                    row_to_job,
                )
                .await
            }
        }
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<Job>, DatabaseError> {
        self.query_map(
            "list_children",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE parent_id = ?1 AND id != ?1 ORDER BY created_at ASC"),
            vec![uuid_value(parent_id)],
            row_to_job,
        )
        .await
    }

    async fn child_stats(&self, parent_id: Uuid) -> Result<ChildStats, DatabaseError> {
        let groups = self
            .query_map(
                "child_stats",
                "SELECT status, COUNT(*) FROM jobs WHERE parent_id = ?1 AND id != ?1 GROUP BY status",
                vec![uuid_value(parent_id)],
                |row| {
                    let status: String = row.get(0).map_err(row_err)?;
                    Ok((parse_status(&status), count(row, 1)))
                },
            )
            .await?;

        let mut stats = ChildStats::default();
        for (status, n) in groups {
            stats.total += n;
            match status {
                JobStatus::Pending => stats.pending += n,
                JobStatus::Running => stats.running += n,
                JobStatus::Completed => stats.completed += n,
                JobStatus::Failed => stats.failed += n,
                JobStatus::Cancelled => stats.cancelled += n,
            }
        }
        Ok(stats)
    }

    // ── Progress ────────────────────────────────────────────────────

    async fn heartbeat(&self, job_id: Uuid) -> Result<(), DatabaseError> {
        self.execute(
            "heartbeat",
            "UPDATE jobs SET last_heartbeat = ?2 WHERE id = ?1 AND status = 'running'",
            vec![uuid_value(job_id), time_value(&Utc::now())],
        )
        .await?;
        Ok(())
    }

    async fn reserve_children(
        &self,
        parent_id: Uuid,
        requested: u64,
        max_pages: u64,
    ) -> Result<u64, DatabaseError> {
        if requested == 0 {
            return Ok(0);
        }

        if max_pages == 0 {
            let n = self
                .execute(
                    "reserve_children",
                    "UPDATE jobs SET progress_total = progress_total + ?2, progress_pending = progress_pending + ?2, completion_candidate_at = NULL WHERE id = ?1 AND status = 'running'",
                    vec![uuid_value(parent_id), int(requested)],
                )
                .await?;
            return Ok(if n == 1 { requested } else { 0 });
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((status, total)) = self.read_progress_total(parent_id).await? else {
                return Err(DatabaseError::NotFound {
                    entity: "job".into(),
                    id: parent_id.to_string(),
                });
            };
            if status != JobStatus::Running {
                return Ok(0);
            }
            let granted = requested.min(max_pages.saturating_sub(total));
            if granted == 0 {
                return Ok(0);
            }

            let n = self
                .execute(
                    "reserve_children",
                    "UPDATE jobs SET progress_total = progress_total + ?2, progress_pending = progress_pending + ?2, completion_candidate_at = NULL WHERE id = ?1 AND status = 'running' AND progress_total = ?3",
                    vec![uuid_value(parent_id), int(granted), int(total)],
                )
                .await?;
            if n == 1 {
                return Ok(granted);
            }
        }

        Err(DatabaseError::Busy(format!(
            "reserve_children: progress of {parent_id} kept changing"
        )))
    }

    async fn release_children(&self, parent_id: Uuid, count: u64) -> Result<(), DatabaseError> {
        if count == 0 {
            return Ok(());
        }
        self.execute(
            "release_children",
            "UPDATE jobs SET progress_total = MAX(progress_total - ?2, 0), progress_pending = MAX(progress_pending - ?2, 0) WHERE id = ?1 AND status = 'running'",
            vec![uuid_value(parent_id), int(count)],
        )
        .await?;
        Ok(())
    }

    async fn start_child(&self, child_id: Uuid, parent_id: Uuid) -> Result<bool, DatabaseError> {
        let started = self
            .execute(
                "start_child",
                "UPDATE jobs SET status = 'running', started_at = ?2, last_heartbeat = ?2 WHERE id = ?1 AND status = 'pending'",
                vec![uuid_value(child_id), time_value(&Utc::now())],
            )
            .await?;
        if started == 0 {
            return Ok(false);
        }
        self.execute(
            "start_child_parent",
            "UPDATE jobs SET progress_running = progress_running + 1 WHERE id = ?1 AND status = 'running'",
            vec![uuid_value(parent_id)],
        )
        .await?;
        Ok(true)
    }

    async fn finish_child(
        &self,
        child_id: Uuid,
        parent_id: Uuid,
        outcome: TaskOutcome,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let child_params = vec![
            uuid_value(child_id),
            text(outcome.status().as_str()),
            time_value(&now),
            int(attempts as u64),
            opt_text(error),
        ];

        // The status CAS is the exactly-once gate for the parent counters.
        let mut was_running = 1;
        let mut updated = self
            .execute(
                "finish_child",
                "UPDATE jobs SET status = ?2, completed_at = ?3, attempts = ?4, error = ?5 WHERE id = ?1 AND status = 'running'",
                child_params.clone(),
            )
            .await?;
        if updated == 0 {
            was_running = 0;
            updated = self
                .execute(
                    "finish_child",
                    "UPDATE jobs SET status = ?2, completed_at = ?3, attempts = ?4, error = ?5 WHERE id = ?1 AND status = 'pending'",
                    child_params,
                )
                .await?;
        }
        if updated == 0 {
            debug!(child_id = %child_id, "Child already finished, counters untouched");
            return Ok(false);
        }

        let (completed, failed) = match outcome {
            TaskOutcome::Completed => (1, 0),
            TaskOutcome::Failed => (0, 1),
        };
        self.execute(
            "finish_child_parent",
            "UPDATE jobs SET progress_completed = progress_completed + ?2, progress_failed = progress_failed + ?3, progress_pending = MAX(progress_pending - 1, 0), progress_running = MAX(progress_running - ?4, 0) WHERE id = ?1 AND status = 'running'",
            vec![
                uuid_value(parent_id),
                int(completed),
                int(failed),
                int(was_running),
            ],
        )
        .await?;
        Ok(true)
    }

    // ── Completion ──────────────────────────────────────────────────

    async fn mark_completion_candidate(
        &self,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let n = self
            .execute(
                "mark_completion_candidate",
                "UPDATE jobs SET completion_candidate_at = ?2 WHERE id = ?1 AND status = 'running' AND completion_candidate_at IS NULL AND progress_pending = 0 AND progress_total > 0",
                vec![uuid_value(job_id), time_value(&at)],
            )
            .await?;
        Ok(n == 1)
    }

    async fn clear_completion_candidate(&self, job_id: Uuid) -> Result<bool, DatabaseError> {
        let n = self
            .execute(
                "clear_completion_candidate",
                "UPDATE jobs SET completion_candidate_at = NULL WHERE id = ?1 AND completion_candidate_at IS NOT NULL",
                vec![uuid_value(job_id)],
            )
            .await?;
        Ok(n == 1)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        candidate_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let n = self
            .execute(
                "complete_job",
                "UPDATE jobs SET status = 'completed', completed_at = ?3, completion_candidate_at = NULL, result_count = progress_completed, failed_count = progress_failed, progress_running = 0 WHERE id = ?1 AND status = 'running' AND progress_pending = 0 AND progress_total > 0 AND completion_candidate_at = ?2 AND last_heartbeat <= ?2",
                vec![
                    uuid_value(job_id),
                    time_value(&candidate_at),
                    time_value(&Utc::now()),
                ],
            )
            .await?;
        if n == 1 {
            info!(job_id = %job_id, "Job completed");
        }
        Ok(n == 1)
    }

    async fn terminate_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        reason: &str,
    ) -> Result<bool, DatabaseError> {
        if !matches!(status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(DatabaseError::Query(format!(
                "terminate_job: {status} is not a failure status"
            )));
        }
        let now = Utc::now();

        let n = self
            .execute(
                "terminate_job",
                "UPDATE jobs SET status = ?2, completed_at = ?3, error = ?4, completion_candidate_at = NULL WHERE id = ?1 AND status IN ('pending', 'running')",
                vec![
                    uuid_value(job_id),
                    text(status.as_str()),
                    time_value(&now),
                    text(reason),
                ],
            )
            .await?;
        if n == 0 {
            return Ok(false);
        }

        let cancelled = self
            .execute(
                "terminate_job_children",
                "UPDATE jobs SET status = 'cancelled', completed_at = ?2, error = ?3 WHERE parent_id = ?1 AND id != ?1 AND status IN ('pending', 'running')",
                vec![uuid_value(job_id), time_value(&now), text(reason)],
            )
            .await?;

        // Counters are frozen once the parent left `running`, so this
        // snapshot is final.
        self.execute(
            "terminate_job_sync",
            "UPDATE jobs SET progress_cancelled = progress_cancelled + ?2, progress_pending = 0, progress_running = 0, result_count = progress_completed, failed_count = progress_failed WHERE id = ?1",
            vec![uuid_value(job_id), int(cancelled)],
        )
        .await?;

        info!(job_id = %job_id, status = %status, cancelled_children = cancelled, reason, "Job terminated");
        Ok(true)
    }

    async fn reset_completion_candidates(&self) -> Result<u64, DatabaseError> {
        self.execute(
            "reset_completion_candidates",
            "UPDATE jobs SET completion_candidate_at = NULL WHERE status = 'running' AND completion_candidate_at IS NOT NULL",
            vec![],
        )
        .await
    }

    // ── Documents ───────────────────────────────────────────────────

    async fn save_document(&self, doc: &Document) -> Result<(), DatabaseError> {
        self.execute(
            "save_document",
            "INSERT INTO documents (id, job_id, parent_job_id, source_ref, title, raw_content, converted_content, size, process_time_ms, metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            vec![
                uuid_value(doc.id),
                uuid_value(doc.job_id),
                uuid_value(doc.parent_job_id),
                text(doc.source_ref.as_str()),
                text(doc.title.as_str()),
                text(doc.raw_content.as_str()),
                text(doc.converted_content.as_str()),
                int(doc.size),
                int(doc.process_time_ms),
                text(to_json(&doc.metadata)?),
                time_value(&doc.created_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, DatabaseError> {
        let docs = self
            .query_map(
                "get_document",
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
                vec![uuid_value(id)],
                row_to_document,
            )
            .await?;
        Ok(docs.into_iter().next())
    }

    async fn document_for_job(&self, job_id: Uuid) -> Result<Option<Document>, DatabaseError> {
        let docs = self
            .query_map(
                "document_for_job",
                &format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE job_id = ?1 ORDER BY created_at ASC LIMIT 1"
                ),
                vec![uuid_value(job_id)],
                row_to_document,
            )
            .await?;
        Ok(docs.into_iter().next())
    }

    async fn list_documents(&self, parent_job_id: Uuid) -> Result<Vec<Document>, DatabaseError> {
        self.query_map(
            "list_documents",
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE parent_job_id = ?1 ORDER BY created_at ASC"),
            vec![uuid_value(parent_job_id)],
            row_to_document,
        )
        .await
    }

    async fn increment_document_count(&self, job_id: Uuid) -> Result<(), DatabaseError> {
        self.execute(
            "increment_document_count",
            "UPDATE jobs SET metadata = json_set(COALESCE(metadata, '{}'), '$.document_count', COALESCE(json_extract(metadata, '$.document_count'), 0) + 1) WHERE id = ?1",
            vec![uuid_value(job_id)],
        )
        .await?;
        Ok(())
    }

    // ── Bookkeeping ─────────────────────────────────────────────────

    async fn mark_url_seen(&self, parent_id: Uuid, url: &str) -> Result<bool, DatabaseError> {
        let n = self
            .execute(
                "mark_url_seen",
                "INSERT OR IGNORE INTO job_seen_urls (parent_id, url, seen_at) VALUES (?1, ?2, ?3)",
                vec![uuid_value(parent_id), text(url), time_value(&Utc::now())],
            )
            .await?;
        Ok(n == 1)
    }

    async fn is_url_seen(&self, parent_id: Uuid, url: &str) -> Result<bool, DatabaseError> {
        let rows = self
            .query_map(
                "is_url_seen",
                "SELECT 1 FROM job_seen_urls WHERE parent_id = ?1 AND url = ?2",
                vec![uuid_value(parent_id), text(url)],
                |_| Ok(()),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn forget_url(&self, parent_id: Uuid, url: &str) -> Result<(), DatabaseError> {
        self.execute(
            "forget_url",
            "DELETE FROM job_seen_urls WHERE parent_id = ?1 AND url = ?2",
            vec![uuid_value(parent_id), text(url)],
        )
        .await?;
        Ok(())
    }

    async fn record_error(&self, job_id: Uuid, message: &str) -> Result<(), DatabaseError> {
        self.execute(
            "record_error",
            "INSERT INTO job_errors (job_id, message, created_at) VALUES (?1, ?2, ?3)",
            vec![uuid_value(job_id), text(message), time_value(&Utc::now())],
        )
        .await?;
        self.execute(
            "prune_errors",
            "DELETE FROM job_errors WHERE job_id = ?1 AND id NOT IN (SELECT id FROM job_errors WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2)",
            vec![uuid_value(job_id), Value::Integer(MAX_STORED_ERRORS)],
        )
        .await?;
        Ok(())
    }

    async fn recent_errors(&self, job_id: Uuid, limit: usize) -> Result<Vec<String>, DatabaseError> {
        self.query_map(
            "recent_errors",
            "SELECT message FROM job_errors WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
            vec![uuid_value(job_id), int(limit as u64)],
            |row| row.get::<String>(0).map_err(row_err),
        )
        .await
    }

    async fn add_warning(&self, job_id: Uuid, warning: &str) -> Result<bool, DatabaseError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(raw) = self.read_metadata(job_id).await? else {
                return Err(DatabaseError::NotFound {
                    entity: "job".into(),
                    id: job_id.to_string(),
                });
            };
            let mut metadata: JobMetadata = serde_json::from_str(&raw).unwrap_or_default();
            if metadata.warnings.iter().any(|w| w == warning) {
                return Ok(false);
            }
            metadata.warnings.push(warning.to_string());

            let n = self
                .execute(
                    "add_warning",
                    "UPDATE jobs SET metadata = ?2 WHERE id = ?1 AND metadata = ?3",
                    vec![uuid_value(job_id), text(to_json(&metadata)?), text(raw)],
                )
                .await?;
            if n == 1 {
                return Ok(true);
            }
        }
        Err(DatabaseError::Busy(format!(
            "add_warning: metadata of {job_id} kept changing"
        )))
    }
}
