//! Crawl worker: fetches one page, stores it and spawns its links.
//!
//! Per task:
//! 1. Skip if the child is already settled or the parent stopped running
//! 2. Check out a renderer (bounded wait; exhaustion → queue redelivery)
//! 3. Render under the operation timeout, retrying transient errors
//! 4. Process content, save the document, refresh the parent heartbeat
//! 5. Reserve, create and enqueue children for links within depth
//! 6. Record the child outcome, then run the completion check
//!
//! The renderer guard returns the handle on every exit path. A parent that
//! is cancelled or failed while its page renders gets nothing saved or
//! spawned. A redelivered task whose page is already stored reuses it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{CrawlConfig, PoolConfig, WorkerConfig};
use crate::error::{Error, JobError, RenderError};
use crate::events::JobEvent;
use crate::jobs::{
    CrawlTask, Document, Job, JobMetadata, JobStatus, TaskMessage, TaskOutcome, task_types,
};
use crate::pipeline::{LinkFilter, ProcessedContent, process_content};
use crate::pool::{PooledRenderer, RenderedPage};
use crate::queue::TaskQueue;
use crate::store::JobStore;
use crate::worker::{TaskContext, Worker, WorkerDeps};

/// Upper bound of one backoff sleep between render attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How a sequence of render attempts ended.
enum RenderOutcome {
    Page(RenderedPage),
    Failed(RenderError),
    /// The parent job stopped while the page was rendering.
    Abandoned,
}

/// Worker for `crawl_url` tasks.
pub struct CrawlWorker {
    deps: WorkerDeps,
    acquire_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl CrawlWorker {
    pub fn new(deps: WorkerDeps, worker: &WorkerConfig, pool: &PoolConfig) -> Self {
        Self {
            deps,
            acquire_timeout: pool.acquire_timeout,
            max_retries: worker.max_retries,
            retry_backoff: worker.retry_backoff,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Render with in-worker retries of transient failures. Returns the
    /// number of attempts made alongside the outcome.
    ///
    /// `job` aborts the render when the parent stops. `ctx.cancel` only
    /// interrupts the backoff, so a shutdown hands the task back to the queue.
    async fn render_with_retry(
        &self,
        renderer: &PooledRenderer,
        url: &str,
        timeout: Duration,
        ctx: &TaskContext,
        job: &CancellationToken,
    ) -> crate::Result<(RenderOutcome, u32)> {
        let mut attempt = 1;
        loop {
            let rendered = tokio::select! {
                biased;
                _ = job.cancelled() => return Ok((RenderOutcome::Abandoned, attempt)),
                rendered = renderer.render(url, timeout) => rendered,
            };
            match rendered {
                Ok(page) => return Ok((RenderOutcome::Page(page), attempt)),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(
                        url,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient render failure, retrying"
                    );
                    tokio::select! {
                        _ = job.cancelled() => return Ok((RenderOutcome::Abandoned, attempt)),
                        _ = ctx.cancel.cancelled() => return Err(Error::Render(e)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Ok((RenderOutcome::Failed(e), attempt)),
            }
        }
    }

    async fn parent_running(&self, parent_id: Uuid) -> crate::Result<bool> {
        Ok(self
            .deps
            .store
            .get_job(parent_id)
            .await?
            .is_some_and(|p| p.status == JobStatus::Running))
    }

    async fn save_document(
        &self,
        task: &TaskMessage,
        crawl: &CrawlTask,
        page: &RenderedPage,
        processed: &ProcessedContent,
        attempts: u32,
    ) -> crate::Result<Document> {
        let doc = Document {
            id: Uuid::new_v4(),
            job_id: task.job_id,
            parent_job_id: task.parent_id,
            source_ref: crawl.url.clone(),
            title: processed.title.clone(),
            raw_content: page.html.clone(),
            converted_content: processed.converted_content.clone(),
            size: processed.size as u64,
            process_time_ms: processed.duration.as_millis() as u64,
            metadata: json!({
                "final_url": page.url,
                "status": page.status,
                "partial": page.partial,
                "depth": task.depth,
                "attempts": attempts,
                "spawned_from": crawl.spawned_from,
                "source_ref": crawl.source_ref,
                "fallback": processed.fallback,
                "fallback_reason": processed.fallback_reason,
                "links_found": processed.links.len(),
                "content": processed.metadata,
            }),
            created_at: Utc::now(),
        };
        self.deps.store.save_document(&doc).await?;
        Ok(doc)
    }

    /// Filter discovered links and spawn the survivors one level deeper.
    async fn spawn_children(
        &self,
        task: &TaskMessage,
        crawl: &CrawlTask,
        config: &CrawlConfig,
        links: &[String],
    ) -> crate::Result<u64> {
        let filter = LinkFilter::new(&config.include_patterns, &config.exclude_patterns)?;
        let result = filter.filter(links);
        for reason in &result.reasons {
            debug!(job_id = %task.job_id, reason = %reason, "Link skipped");
        }

        let origin = SpawnContext {
            parent_id: task.parent_id,
            depth: task.depth + 1,
            spawned_from: Some(&crawl.url),
            source_ref: crawl.source_ref.as_deref(),
        };
        spawn_crawl_tasks(
            self.deps.store.as_ref(),
            self.deps.queue.as_ref(),
            &origin,
            result.filtered,
            config,
        )
        .await
    }

    /// Spawn links of a stored page, then settle the child as completed.
    async fn settle(
        &self,
        task: &TaskMessage,
        crawl: &CrawlTask,
        config: &CrawlConfig,
        processed: &ProcessedContent,
        attempts: u32,
        ctx: &TaskContext,
    ) -> crate::Result<()> {
        let store = &self.deps.store;
        let spawned = if config.follow_links && task.depth < config.max_depth {
            self.spawn_children(task, crawl, config, &processed.links)
                .await?
        } else {
            0
        };

        let recorded = store
            .finish_child(
                task.job_id,
                task.parent_id,
                TaskOutcome::Completed,
                attempts,
                None,
            )
            .await?;
        if recorded {
            info!(
                job_id = %task.job_id,
                url = %crawl.url,
                depth = task.depth,
                attempts,
                receive_count = ctx.receive_count,
                spawned,
                title = %processed.title,
                "Page crawled"
            );
        } else {
            debug!(job_id = %task.job_id, "Child settled elsewhere, counters untouched");
        }

        self.deps.orchestrator.child_finished(task.parent_id).await;
        Ok(())
    }

    async fn record_failure(
        &self,
        task: &TaskMessage,
        url: &str,
        attempts: u32,
        error: &RenderError,
    ) -> crate::Result<()> {
        let store = &self.deps.store;
        warn!(job_id = %task.job_id, url, attempts, error = %error, "Page failed");
        store
            .record_error(task.parent_id, &format!("{url}: {error}"))
            .await?;
        store
            .finish_child(
                task.job_id,
                task.parent_id,
                TaskOutcome::Failed,
                attempts,
                Some(&error.to_string()),
            )
            .await?;
        self.deps.orchestrator.child_finished(task.parent_id).await;
        Ok(())
    }
}

#[async_trait]
impl Worker for CrawlWorker {
    fn worker_type(&self) -> &str {
        task_types::CRAWL_URL
    }

    fn validate(&self, task: &TaskMessage) -> Result<(), JobError> {
        if task.task_type != task_types::CRAWL_URL {
            return Err(JobError::Validation(format!(
                "expected {} task, got {}",
                task_types::CRAWL_URL,
                task.task_type
            )));
        }
        let crawl: CrawlTask = task.decode_payload()?;
        let url = Url::parse(&crawl.url)
            .map_err(|e| JobError::Validation(format!("invalid url {}: {e}", crawl.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(JobError::Validation(format!(
                "unsupported scheme {} in {}",
                url.scheme(),
                crawl.url
            )));
        }
        let config: CrawlConfig = task.decode_config()?;
        if task.depth > config.max_depth {
            return Err(JobError::Validation(format!(
                "depth {} exceeds max_depth {}",
                task.depth, config.max_depth
            )));
        }
        Ok(())
    }

    async fn execute(&self, task: &TaskMessage, ctx: &TaskContext) -> crate::Result<()> {
        let crawl: CrawlTask = task.decode_payload()?;
        let config: CrawlConfig = task.decode_config()?;
        let store = &self.deps.store;

        let Some(child) = store.get_job(task.job_id).await? else {
            warn!(job_id = %task.job_id, "Task has no job row, dropping");
            return Ok(());
        };
        if child.status.is_terminal() {
            debug!(job_id = %task.job_id, status = %child.status, "Task already settled, skipping");
            return Ok(());
        }
        let Some(parent) = store.get_job(task.parent_id).await? else {
            warn!(job_id = %task.job_id, parent_id = %task.parent_id, "Parent job missing, dropping task");
            return Ok(());
        };
        if parent.status != JobStatus::Running {
            debug!(job_id = %task.job_id, parent_status = %parent.status, "Parent not running, skipping");
            return Ok(());
        }

        if let Some(doc) = store.document_for_job(task.job_id).await? {
            // An earlier delivery stored the page but stopped before settling.
            let base = doc.metadata["final_url"].as_str().unwrap_or(&crawl.url);
            let processed = process_content(&doc.raw_content, Some(base));
            let attempts = doc.metadata["attempts"].as_u64().unwrap_or(1) as u32;
            debug!(job_id = %task.job_id, document_id = %doc.id, "Page already stored, resuming");
            return self
                .settle(task, &crawl, &config, &processed, attempts, ctx)
                .await;
        }

        let job_cancel = self.deps.orchestrator.job_token(task.parent_id).await;

        if !config.request_delay().is_zero() {
            tokio::select! {
                _ = job_cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(config.request_delay()) => {}
            }
        }

        // Exhaustion fails before the child is marked running.
        let renderer = self.deps.pool.acquire(self.acquire_timeout).await?;
        store.start_child(task.job_id, task.parent_id).await?;
        let (outcome, attempts) = self
            .render_with_retry(
                &renderer,
                &crawl.url,
                config.operation_timeout(),
                ctx,
                &job_cancel,
            )
            .await?;
        drop(renderer);

        let page = match outcome {
            RenderOutcome::Page(page) => page,
            RenderOutcome::Failed(e) => {
                return self.record_failure(task, &crawl.url, attempts, &e).await;
            }
            RenderOutcome::Abandoned => {
                debug!(job_id = %task.job_id, url = %crawl.url, "Parent stopped mid-render, page dropped");
                return Ok(());
            }
        };
        // Terminal states set outside the orchestrator never fire the token.
        if !self.parent_running(task.parent_id).await? {
            debug!(job_id = %task.job_id, url = %crawl.url, "Parent stopped mid-render, page dropped");
            return Ok(());
        }
        if page.partial {
            info!(job_id = %task.job_id, url = %crawl.url, "Operation timed out, continuing with partial content");
        }

        let processed = process_content(&page.html, Some(&page.url));
        let doc = self
            .save_document(task, &crawl, &page, &processed, attempts)
            .await?;
        self.deps
            .events
            .publish(JobEvent::document_saved(&parent, doc.id));
        store.heartbeat(task.parent_id).await?;

        self.settle(task, &crawl, &config, &processed, attempts, ctx)
            .await
    }
}

/// Where a batch of spawned tasks comes from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpawnContext<'a> {
    pub parent_id: Uuid,
    /// Depth of the spawned tasks.
    pub depth: u32,
    pub spawned_from: Option<&'a str>,
    pub source_ref: Option<&'a str>,
}

/// Slots of one reservation that ended up accounted for.
#[derive(Default)]
struct SpawnTally {
    enqueued: u64,
    /// Registered children that were failed on the spot.
    settled: u64,
}

impl SpawnTally {
    fn used(&self) -> u64 {
        self.enqueued + self.settled
    }
}

/// Register, create and enqueue one `crawl_url` task per unseen URL.
///
/// Children are reserved on the parent before anything is enqueued, so the
/// parent never shows zero pending while they are on their way. A URL is
/// only marked seen once it holds a reserved slot, and slots that end up
/// without a task are released on every exit path, errors included.
/// `max_pages` caps the total. Returns how many tasks were enqueued.
pub(crate) async fn spawn_crawl_tasks(
    store: &dyn JobStore,
    queue: &dyn TaskQueue,
    origin: &SpawnContext<'_>,
    urls: Vec<String>,
    config: &CrawlConfig,
) -> crate::Result<u64> {
    let parent_id = origin.parent_id;
    let mut candidates = Vec::new();
    for url in urls {
        if !store.is_url_seen(parent_id, &url).await? {
            candidates.push(url);
        }
    }
    if candidates.is_empty() {
        return Ok(0);
    }

    let requested = candidates.len() as u64;
    let granted = store
        .reserve_children(parent_id, requested, config.max_pages)
        .await?;
    if granted < requested {
        info!(
            parent_id = %parent_id,
            requested,
            granted,
            max_pages = config.max_pages,
            "Page limit reached, dropping links"
        );
    }
    if granted == 0 {
        return Ok(0);
    }

    let mut tally = SpawnTally::default();
    let result = enqueue_reserved(store, queue, origin, candidates, granted, config, &mut tally).await;

    let unused = granted - tally.used();
    if unused > 0
        && let Err(e) = store.release_children(parent_id, unused).await
    {
        warn!(parent_id = %parent_id, unused, error = %e, "Could not release reserved children");
        result?;
        return Err(e.into());
    }
    result?;

    debug!(parent_id = %parent_id, depth = origin.depth, enqueued = tally.enqueued, released = unused, "Crawl tasks spawned");
    Ok(tally.enqueued)
}

/// Fill up to `granted` reserved slots from `candidates`.
async fn enqueue_reserved(
    store: &dyn JobStore,
    queue: &dyn TaskQueue,
    origin: &SpawnContext<'_>,
    candidates: Vec<String>,
    granted: u64,
    config: &CrawlConfig,
    tally: &mut SpawnTally,
) -> crate::Result<()> {
    let parent_id = origin.parent_id;
    for url in candidates {
        if tally.used() >= granted {
            break;
        }
        if !store.mark_url_seen(parent_id, &url).await? {
            // Claimed by a concurrent worker since the read above.
            continue;
        }

        let child = Job::new_child(
            parent_id,
            task_types::CRAWL_URL,
            origin.depth,
            JobMetadata {
                url: Some(url.clone()),
                spawned_from: origin.spawned_from.map(String::from),
                source_ref: origin.source_ref.map(String::from),
                ..JobMetadata::default()
            },
        );
        let message = match TaskMessage::crawl(
            child.id,
            parent_id,
            origin.depth,
            &CrawlTask {
                url: url.clone(),
                source_ref: origin.source_ref.map(String::from),
                spawned_from: origin.spawned_from.map(String::from),
            },
            config,
        ) {
            Ok(message) => message,
            Err(e) => {
                warn!(parent_id = %parent_id, error = %e, "Could not build child task");
                store.forget_url(parent_id, &url).await?;
                continue;
            }
        };

        if let Err(e) = store.create_job(&child).await {
            warn!(parent_id = %parent_id, url = %url, error = %e, "Could not create child job");
            store.forget_url(parent_id, &url).await?;
            continue;
        }
        match queue.enqueue(&message).await {
            Ok(_) => tally.enqueued += 1,
            Err(e) => {
                // The row exists, so account for it as a failed child.
                warn!(parent_id = %parent_id, child_id = %child.id, error = %e, "Could not enqueue child");
                let reason = format!("enqueue failed: {e}");
                store
                    .finish_child(child.id, parent_id, TaskOutcome::Failed, 0, Some(&reason))
                    .await?;
                tally.settled += 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::error::{DatabaseError, PoolError, QueueError};
    use crate::events::{EventBus, EventType};
    use crate::jobs::JobConfig;
    use crate::orchestrator::Orchestrator;
    use crate::pool::{PageRenderer, RendererFactory, RendererPool};
    use crate::queue::{LibSqlQueue, QueueMessage, QueueStats};
    use crate::store::{ChildStats, LibSqlStore};
    use chrono::DateTime;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex, OnceLock};
    use tokio::sync::Notify;

    /// Serves canned pages; `flaky` URLs fail transiently N times first.
    struct FakeSite {
        pages: HashMap<String, String>,
        flaky: Mutex<HashMap<String, u32>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PageRenderer for FakeSite {
        async fn render(&self, url: &str, _timeout: Duration) -> Result<RenderedPage, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut flaky) = self.flaky.lock()
                && let Some(left) = flaky.get_mut(url)
                && *left > 0
            {
                *left -= 1;
                return Err(RenderError::Network("connection reset".into()));
            }
            match self.pages.get(url) {
                Some(html) => Ok(RenderedPage {
                    url: url.to_string(),
                    status: 200,
                    html: html.clone(),
                    partial: false,
                }),
                None => Err(RenderError::Status {
                    url: url.to_string(),
                    status: 404,
                }),
            }
        }
    }

    /// Never finishes a render; signals when one has begun.
    #[derive(Default)]
    struct StalledRenderer {
        entered: Notify,
    }

    #[async_trait]
    impl PageRenderer for StalledRenderer {
        async fn render(&self, _url: &str, _timeout: Duration) -> Result<RenderedPage, RenderError> {
            self.entered.notify_one();
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(RenderError::Network("stalled".into()))
        }
    }

    /// Cancels the parent straight in the store, then serves the page.
    #[derive(Default)]
    struct CancellingRenderer {
        target: OnceLock<(Arc<LibSqlStore>, Uuid)>,
    }

    #[async_trait]
    impl PageRenderer for CancellingRenderer {
        async fn render(&self, url: &str, _timeout: Duration) -> Result<RenderedPage, RenderError> {
            if let Some((store, parent)) = self.target.get() {
                store
                    .terminate_job(*parent, JobStatus::Cancelled, "cancelled mid-render")
                    .await
                    .unwrap();
            }
            Ok(RenderedPage {
                url: url.to_string(),
                status: 200,
                html: SEED_HTML.to_string(),
                partial: false,
            })
        }
    }

    struct FixedFactory(Arc<dyn PageRenderer>);

    #[async_trait]
    impl RendererFactory for FixedFactory {
        async fn create(&self) -> Result<Arc<dyn PageRenderer>, PoolError> {
            Ok(self.0.clone())
        }
    }

    fn injected() -> DatabaseError {
        DatabaseError::Busy("database is locked".into())
    }

    /// Store that fails selected calls and delegates everything else.
    struct FaultyStore {
        inner: Arc<LibSqlStore>,
        fail_reserve: AtomicU32,
        fail_create_url: Mutex<Option<String>>,
        fail_settle_failed: AtomicBool,
    }

    #[async_trait]
    impl JobStore for FaultyStore {
        async fn create_job(&self, job: &Job) -> Result<(), DatabaseError> {
            let url = self.fail_create_url.lock().unwrap().clone();
            if url.is_some() && job.metadata.url == url {
                return Err(injected());
            }
            self.inner.create_job(job).await
        }
        async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
            self.inner.get_job(id).await
        }
        async fn list_parent_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, DatabaseError> {
            self.inner.list_parent_jobs(status).await
        }
        async fn list_children(&self, parent_id: Uuid) -> Result<Vec<Job>, DatabaseError> {
            self.inner.list_children(parent_id).await
        }
        async fn child_stats(&self, parent_id: Uuid) -> Result<ChildStats, DatabaseError> {
            self.inner.child_stats(parent_id).await
        }
        async fn heartbeat(&self, job_id: Uuid) -> Result<(), DatabaseError> {
            self.inner.heartbeat(job_id).await
        }
        async fn reserve_children(
            &self,
            parent_id: Uuid,
            requested: u64,
            max_pages: u64,
        ) -> Result<u64, DatabaseError> {
            let left = self.fail_reserve.load(Ordering::SeqCst);
            if left > 0 {
                self.fail_reserve.store(left - 1, Ordering::SeqCst);
                return Err(injected());
            }
            self.inner.reserve_children(parent_id, requested, max_pages).await
        }
        async fn release_children(&self, parent_id: Uuid, count: u64) -> Result<(), DatabaseError> {
            self.inner.release_children(parent_id, count).await
        }
        async fn start_child(&self, child_id: Uuid, parent_id: Uuid) -> Result<bool, DatabaseError> {
            self.inner.start_child(child_id, parent_id).await
        }
        async fn finish_child(
            &self,
            child_id: Uuid,
            parent_id: Uuid,
            outcome: TaskOutcome,
            attempts: u32,
            error: Option<&str>,
        ) -> Result<bool, DatabaseError> {
            if outcome == TaskOutcome::Failed && self.fail_settle_failed.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner
                .finish_child(child_id, parent_id, outcome, attempts, error)
                .await
        }
        async fn mark_completion_candidate(
            &self,
            job_id: Uuid,
            at: DateTime<Utc>,
        ) -> Result<bool, DatabaseError> {
            self.inner.mark_completion_candidate(job_id, at).await
        }
        async fn clear_completion_candidate(&self, job_id: Uuid) -> Result<bool, DatabaseError> {
            self.inner.clear_completion_candidate(job_id).await
        }
        async fn complete_job(
            &self,
            job_id: Uuid,
            candidate_at: DateTime<Utc>,
        ) -> Result<bool, DatabaseError> {
            self.inner.complete_job(job_id, candidate_at).await
        }
        async fn terminate_job(
            &self,
            job_id: Uuid,
            status: JobStatus,
            reason: &str,
        ) -> Result<bool, DatabaseError> {
            self.inner.terminate_job(job_id, status, reason).await
        }
        async fn reset_completion_candidates(&self) -> Result<u64, DatabaseError> {
            self.inner.reset_completion_candidates().await
        }
        async fn save_document(&self, doc: &Document) -> Result<(), DatabaseError> {
            self.inner.save_document(doc).await
        }
        async fn get_document(&self, id: Uuid) -> Result<Option<Document>, DatabaseError> {
            self.inner.get_document(id).await
        }
        async fn document_for_job(&self, job_id: Uuid) -> Result<Option<Document>, DatabaseError> {
            self.inner.document_for_job(job_id).await
        }
        async fn list_documents(&self, parent_job_id: Uuid) -> Result<Vec<Document>, DatabaseError> {
            self.inner.list_documents(parent_job_id).await
        }
        async fn increment_document_count(&self, job_id: Uuid) -> Result<(), DatabaseError> {
            self.inner.increment_document_count(job_id).await
        }
        async fn mark_url_seen(&self, parent_id: Uuid, url: &str) -> Result<bool, DatabaseError> {
            self.inner.mark_url_seen(parent_id, url).await
        }
        async fn is_url_seen(&self, parent_id: Uuid, url: &str) -> Result<bool, DatabaseError> {
            self.inner.is_url_seen(parent_id, url).await
        }
        async fn forget_url(&self, parent_id: Uuid, url: &str) -> Result<(), DatabaseError> {
            self.inner.forget_url(parent_id, url).await
        }
        async fn record_error(&self, job_id: Uuid, message: &str) -> Result<(), DatabaseError> {
            self.inner.record_error(job_id, message).await
        }
        async fn recent_errors(&self, job_id: Uuid, limit: usize) -> Result<Vec<String>, DatabaseError> {
            self.inner.recent_errors(job_id, limit).await
        }
        async fn add_warning(&self, job_id: Uuid, warning: &str) -> Result<bool, DatabaseError> {
            self.inner.add_warning(job_id, warning).await
        }
    }

    /// Queue that accepts `accept` messages, then refuses the rest.
    struct FaultyQueue {
        inner: Arc<LibSqlQueue>,
        accept: AtomicU32,
    }

    #[async_trait]
    impl TaskQueue for FaultyQueue {
        async fn enqueue(&self, task: &TaskMessage) -> Result<String, QueueError> {
            let left = self.accept.load(Ordering::SeqCst);
            if left == 0 {
                return Err(QueueError::Database(injected()));
            }
            self.accept.store(left - 1, Ordering::SeqCst);
            self.inner.enqueue(task).await
        }
        async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
            self.inner.dequeue(visibility_timeout).await
        }
        async fn ack(&self, id: &str) -> Result<(), QueueError> {
            self.inner.ack(id).await
        }
        async fn stats(&self) -> Result<QueueStats, QueueError> {
            self.inner.stats().await
        }
    }

    struct Harness {
        store: Arc<LibSqlStore>,
        queue: Arc<LibSqlQueue>,
        faulty_store: Arc<FaultyStore>,
        faulty_queue: Arc<FaultyQueue>,
        worker: CrawlWorker,
        site: Arc<FakeSite>,
        pool: Arc<RendererPool>,
        events: EventBus,
        orchestrator: Arc<Orchestrator>,
    }

    async fn harness(pages: &[(&str, &str)], flaky: &[(&str, u32)]) -> Harness {
        build(pages, flaky, None).await
    }

    /// The worker talks to the store and queue through fault injectors that
    /// pass everything through until told otherwise.
    async fn build(
        pages: &[(&str, &str)],
        flaky: &[(&str, u32)],
        renderer: Option<Arc<dyn PageRenderer>>,
    ) -> Harness {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let queue = Arc::new(LibSqlQueue::new(store.connection(), store.retry_policy()));
        let faulty_store = Arc::new(FaultyStore {
            inner: store.clone(),
            fail_reserve: AtomicU32::new(0),
            fail_create_url: Mutex::new(None),
            fail_settle_failed: AtomicBool::new(false),
        });
        let faulty_queue = Arc::new(FaultyQueue {
            inner: queue.clone(),
            accept: AtomicU32::new(u32::MAX),
        });
        let site = Arc::new(FakeSite {
            pages: pages.iter().map(|(u, h)| (u.to_string(), h.to_string())).collect(),
            flaky: Mutex::new(flaky.iter().map(|(u, n)| (u.to_string(), *n)).collect()),
            calls: AtomicU32::new(0),
        });
        let renderer = renderer.unwrap_or_else(|| site.clone() as Arc<dyn PageRenderer>);
        let pool = RendererPool::start(Arc::new(FixedFactory(renderer)), &PoolConfig::default())
            .await
            .unwrap();
        let events = EventBus::new();
        let orchestrator = Orchestrator::new(store.clone(), events.clone(), MonitorConfig::default());
        let deps = WorkerDeps {
            store: faulty_store.clone(),
            queue: faulty_queue.clone(),
            pool: pool.clone(),
            events: events.clone(),
            orchestrator: orchestrator.clone(),
        };
        let worker_config = WorkerConfig {
            retry_backoff: Duration::from_millis(1),
            ..WorkerConfig::default()
        };
        Harness {
            worker: CrawlWorker::new(deps, &worker_config, &PoolConfig::default()),
            store,
            queue,
            faulty_store,
            faulty_queue,
            site,
            pool,
            events,
            orchestrator,
        }
    }

    fn saw_document_event(rx: &mut tokio::sync::broadcast::Receiver<JobEvent>) -> bool {
        let mut saw = false;
        while let Ok(event) = rx.try_recv() {
            saw |= event.event_type == EventType::DocumentSaved;
        }
        saw
    }

    async fn seed(h: &Harness, url: &str, config: CrawlConfig) -> (Uuid, TaskMessage) {
        let parent = Job::new_parent(task_types::CRAWL, JobConfig::Crawl(config.clone()), JobMetadata::default());
        h.store.create_job(&parent).await.unwrap();
        h.store.reserve_children(parent.id, 1, 0).await.unwrap();
        h.store.mark_url_seen(parent.id, url).await.unwrap();
        let child = Job::new_child(parent.id, task_types::CRAWL_URL, 0, JobMetadata::default());
        h.store.create_job(&child).await.unwrap();
        let task = TaskMessage::crawl(
            child.id,
            parent.id,
            0,
            &CrawlTask {
                url: url.into(),
                source_ref: None,
                spawned_from: None,
            },
            &config,
        )
        .unwrap();
        (parent.id, task)
    }

    fn ctx() -> TaskContext {
        TaskContext {
            receive_count: 1,
            cancel: CancellationToken::new(),
        }
    }

    const SEED: &str = "https://site.test/";
    const SEED_HTML: &str = r#"<html><head><title>Home</title></head><body><main>
        <p>Welcome home</p>
        <a href="/docs/a">A</a><a href="/docs/b">B</a><a href="/blog/c">C</a>
        <a href="/">self</a>
    </main></body></html>"#;

    #[tokio::test]
    async fn crawls_page_and_spawns_matching_links() {
        let h = harness(&[(SEED, SEED_HTML)], &[]).await;
        let config = CrawlConfig {
            max_depth: 1,
            include_patterns: vec!["/docs/".into()],
            ..CrawlConfig::default()
        };
        let (parent, task) = seed(&h, SEED, config).await;

        h.worker.validate(&task).unwrap();
        h.worker.execute(&task, &ctx()).await.unwrap();

        let job = h.store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.progress.total, 3);
        assert_eq!(job.progress.completed, 1);
        assert_eq!(job.progress.pending, 2);
        assert_eq!(h.queue.stats().await.unwrap().pending, 2);

        let docs = h.store.list_documents(parent).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].title, "Home");
        assert!(docs[0].converted_content.contains("Welcome home"));

        let children = h.store.list_children(parent).await.unwrap();
        let spawned: Vec<_> = children.iter().filter(|c| c.depth == 1).collect();
        assert_eq!(spawned.len(), 2);
        assert!(spawned.iter().all(|c| c.metadata.spawned_from.as_deref() == Some(SEED)));
    }

    #[tokio::test]
    async fn does_not_spawn_beyond_max_depth() {
        let h = harness(&[(SEED, SEED_HTML)], &[]).await;
        let config = CrawlConfig {
            max_depth: 0,
            ..CrawlConfig::default()
        };
        let (parent, task) = seed(&h, SEED, config).await;
        h.worker.execute(&task, &ctx()).await.unwrap();

        let job = h.store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.progress.total, 1);
        assert_eq!(job.progress.pending, 0);
        assert_eq!(h.queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn max_pages_caps_spawned_children() {
        let h = harness(&[(SEED, SEED_HTML)], &[]).await;
        let config = CrawlConfig {
            max_depth: 1,
            max_pages: 2,
            ..CrawlConfig::default()
        };
        let (parent, task) = seed(&h, SEED, config).await;
        h.worker.execute(&task, &ctx()).await.unwrap();

        let job = h.store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.progress.total, 2);
        assert_eq!(h.queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_in_worker() {
        let h = harness(&[(SEED, SEED_HTML)], &[(SEED, 3)]).await;
        let config = CrawlConfig {
            max_depth: 0,
            ..CrawlConfig::default()
        };
        let (parent, task) = seed(&h, SEED, config).await;
        h.worker.execute(&task, &ctx()).await.unwrap();

        assert_eq!(h.site.calls.load(Ordering::SeqCst), 4);
        let child = h.store.get_job(task.job_id).await.unwrap().unwrap();
        assert_eq!(child.status, JobStatus::Completed);
        assert_eq!(child.attempts, 4);
        let job = h.store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.progress.completed, 1);
        assert_eq!(job.progress.failed, 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_recorded_not_raised() {
        let h = harness(&[], &[]).await;
        let (parent, task) = seed(&h, "https://site.test/missing", CrawlConfig::default()).await;
        h.worker.execute(&task, &ctx()).await.unwrap();

        let job = h.store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.progress.failed, 1);
        assert_eq!(job.progress.pending, 0);
        let errors = h.store.recent_errors(parent, 10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("404"));
    }

    #[tokio::test]
    async fn redelivered_settled_task_is_skipped() {
        let h = harness(&[(SEED, SEED_HTML)], &[]).await;
        let config = CrawlConfig {
            max_depth: 0,
            ..CrawlConfig::default()
        };
        let (parent, task) = seed(&h, SEED, config).await;
        h.worker.execute(&task, &ctx()).await.unwrap();
        h.worker.execute(&task, &ctx()).await.unwrap();

        assert_eq!(h.site.calls.load(Ordering::SeqCst), 1);
        let job = h.store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.progress.completed, 1);
        assert_eq!(h.store.list_documents(parent).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn validation_rejects_bad_tasks() {
        let h = harness(&[], &[]).await;
        let (_, mut task) = seed(&h, SEED, CrawlConfig::default()).await;

        let mut wrong_type = task.clone();
        wrong_type.task_type = "transform".into();
        assert!(h.worker.validate(&wrong_type).is_err());

        let mut bad_scheme = task.clone();
        bad_scheme.payload = json!({ "url": "ftp://site.test/file" });
        assert!(h.worker.validate(&bad_scheme).is_err());

        task.depth = 99;
        assert!(h.worker.validate(&task).is_err());
    }

    fn docs_only() -> CrawlConfig {
        CrawlConfig {
            max_depth: 1,
            include_patterns: vec!["/docs/".into()],
            ..CrawlConfig::default()
        }
    }

    #[tokio::test]
    async fn cancel_during_render_drops_the_page() {
        let stalled = Arc::new(StalledRenderer::default());
        let h = Arc::new(build(&[], &[], Some(stalled.clone() as Arc<dyn PageRenderer>)).await);
        let (parent, task) = seed(&h, SEED, docs_only()).await;
        let mut rx = h.events.subscribe_raw();

        let run = {
            let h = h.clone();
            let task = task.clone();
            tokio::spawn(async move { h.worker.execute(&task, &ctx()).await })
        };
        stalled.entered.notified().await;
        assert!(h.orchestrator.cancel_job(parent, "user request").await.unwrap());

        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("render was not aborted")
            .unwrap()
            .unwrap();

        assert_eq!(h.pool.in_use(), 0);
        assert!(h.store.list_documents(parent).await.unwrap().is_empty());
        assert!(!saw_document_event(&mut rx));
        let child = h.store.get_job(task.job_id).await.unwrap().unwrap();
        assert_eq!(child.status, JobStatus::Cancelled);
        assert_eq!(h.queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn parent_stopped_mid_render_saves_and_spawns_nothing() {
        let renderer = Arc::new(CancellingRenderer::default());
        let h = build(&[], &[], Some(renderer.clone() as Arc<dyn PageRenderer>)).await;
        let (parent, task) = seed(&h, SEED, docs_only()).await;
        assert!(renderer.target.set((h.store.clone(), parent)).is_ok());
        let mut rx = h.events.subscribe_raw();

        h.worker.execute(&task, &ctx()).await.unwrap();

        assert_eq!(h.pool.in_use(), 0);
        assert!(h.store.list_documents(parent).await.unwrap().is_empty());
        assert!(!saw_document_event(&mut rx));
        assert_eq!(h.store.list_children(parent).await.unwrap().len(), 1);
        assert_eq!(h.queue.stats().await.unwrap().pending, 0);
        let job = h.store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.progress.total, 1);
    }

    #[tokio::test]
    async fn failed_reservation_keeps_links_for_redelivery() {
        let h = harness(&[(SEED, SEED_HTML)], &[]).await;
        let (parent, task) = seed(&h, SEED, docs_only()).await;
        h.faulty_store.fail_reserve.store(1, Ordering::SeqCst);

        assert!(h.worker.execute(&task, &ctx()).await.is_err());
        assert!(!h.store.is_url_seen(parent, "https://site.test/docs/a").await.unwrap());
        assert_eq!(h.store.list_documents(parent).await.unwrap().len(), 1);

        // Redelivery reuses the stored page instead of rendering it again.
        h.worker.execute(&task, &ctx()).await.unwrap();
        assert_eq!(h.site.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.list_documents(parent).await.unwrap().len(), 1);

        let job = h.store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.progress.total, 3);
        assert_eq!(job.progress.completed, 1);
        assert_eq!(job.progress.pending, 2);
        assert_eq!(h.queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn refused_enqueue_is_counted_as_failed_child() {
        let h = harness(&[(SEED, SEED_HTML)], &[]).await;
        let (parent, task) = seed(&h, SEED, docs_only()).await;
        h.faulty_queue.accept.store(1, Ordering::SeqCst);

        h.worker.execute(&task, &ctx()).await.unwrap();

        let job = h.store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.progress.total, 3);
        assert_eq!(job.progress.completed, 1);
        assert_eq!(job.progress.failed, 1);
        assert_eq!(job.progress.pending, 1);
        assert_eq!(h.queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn failed_child_creation_frees_slot_and_url() {
        let h = harness(&[(SEED, SEED_HTML)], &[]).await;
        let (parent, task) = seed(&h, SEED, docs_only()).await;
        *h.faulty_store.fail_create_url.lock().unwrap() = Some("https://site.test/docs/b".into());

        h.worker.execute(&task, &ctx()).await.unwrap();

        let job = h.store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.progress.total, 2);
        assert_eq!(job.progress.pending, 1);
        assert_eq!(h.queue.stats().await.unwrap().pending, 1);
        assert!(h.store.is_url_seen(parent, "https://site.test/docs/a").await.unwrap());
        assert!(!h.store.is_url_seen(parent, "https://site.test/docs/b").await.unwrap());
    }

    #[tokio::test]
    async fn error_while_spawning_releases_unused_slots() {
        let h = harness(&[(SEED, SEED_HTML)], &[]).await;
        let (parent, task) = seed(&h, SEED, docs_only()).await;
        h.faulty_queue.accept.store(0, Ordering::SeqCst);
        h.faulty_store.fail_settle_failed.store(true, Ordering::SeqCst);

        assert!(h.worker.execute(&task, &ctx()).await.is_err());

        // Only the seed, still running, is left counted.
        let job = h.store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.progress.total, 1);
        assert_eq!(job.progress.pending, 1);
        assert_eq!(h.queue.stats().await.unwrap().pending, 0);
    }
}
