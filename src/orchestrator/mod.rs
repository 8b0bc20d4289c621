//! Orchestrator: one lightweight monitor per parent job.
//!
//! A monitor wakes on its interval, on a child-status notification from a
//! worker, or when a completion candidacy becomes confirmable. Each wake it
//! re-reads the parent, applies stale and failure-tolerance checks, runs the
//! completion protocol and publishes a progress event. Monitors end
//! themselves once the parent is terminal or their cancellation token fires;
//! the registry only ever holds live monitors.

pub mod completion;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{FailureAction, MonitorConfig};
use crate::error::{Error, JobError};
use crate::events::{EventBus, EventHandler, EventType, JobEvent};
use crate::jobs::{Job, JobStatus};
use crate::store::JobStore;

pub use completion::{CompletionCheck, CompletionDetector, CompletionState, CompletionStep, Observation};

/// Registry entry of a running monitor.
struct TrackedMonitor {
    token: CancellationToken,
    notify: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// What a monitor should do after one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Keep monitoring; re-check no later than `recheck_in` if set.
    Active { recheck_in: Option<Duration> },
    /// The parent is terminal.
    Finished(JobStatus),
}

/// Watches parent jobs and decides when they are done.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    events: EventBus,
    config: MonitorConfig,
    detector: CompletionDetector,
    monitors: Arc<RwLock<HashMap<Uuid, TrackedMonitor>>>,
    /// Fired when a running job is cancelled or failed.
    job_tokens: RwLock<HashMap<Uuid, CancellationToken>>,
    /// Parent of every monitor token.
    shutdown: CancellationToken,
    document_counter: JoinHandle<()>,
}

impl Orchestrator {
    /// Create the orchestrator and subscribe it to `document_saved` events.
    pub fn new(store: Arc<dyn JobStore>, events: EventBus, config: MonitorConfig) -> Arc<Self> {
        let detector = CompletionDetector::new(store.clone(), config.grace_period);
        let document_counter = events.subscribe(
            EventType::DocumentSaved,
            Arc::new(DocumentCounter {
                store: store.clone(),
            }),
        );

        Arc::new(Self {
            store,
            events,
            config,
            detector,
            monitors: Arc::new(RwLock::new(HashMap::new())),
            job_tokens: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            document_counter,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ── Monitor lifecycle ───────────────────────────────────────────

    /// Start monitoring `job_id`. No-op if a monitor is already running.
    pub async fn start_monitoring(self: &Arc<Self>, job_id: Uuid) {
        // The write lock is held across the spawn so a monitor that finishes
        // immediately cannot try to deregister before it was registered.
        let mut monitors = self.monitors.write().await;
        if monitors.contains_key(&job_id) {
            debug!(job_id = %job_id, "Monitor already running");
            return;
        }

        let token = self.shutdown.child_token();
        let notify = Arc::new(Notify::new());
        let handle = tokio::spawn({
            let this = Arc::clone(self);
            let token = token.clone();
            let notify = notify.clone();
            async move { this.monitor_loop(job_id, token, notify).await }
        });

        monitors.insert(
            job_id,
            TrackedMonitor {
                token,
                notify,
                handle,
            },
        );
        info!(job_id = %job_id, "Monitoring started");
    }

    /// Stop the monitor of `job_id` without touching the job.
    pub async fn stop_monitoring(&self, job_id: Uuid) -> bool {
        let monitors = self.monitors.read().await;
        match monitors.get(&job_id) {
            Some(tracked) => {
                tracked.token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_monitoring(&self, job_id: Uuid) -> bool {
        self.monitors.read().await.contains_key(&job_id)
    }

    pub async fn active_monitors(&self) -> usize {
        self.monitors.read().await.len()
    }

    /// Wake the monitor of `parent_id` for an immediate evaluation.
    pub async fn notify(&self, parent_id: Uuid) {
        if let Some(tracked) = self.monitors.read().await.get(&parent_id) {
            tracked.notify.notify_one();
        }
    }

    async fn monitor_loop(self: Arc<Self>, job_id: Uuid, token: CancellationToken, notify: Arc<Notify>) {
        let timeout_at = match self.store.get_job(job_id).await {
            Ok(Some(job)) => {
                let started = job.started_at.unwrap_or(job.created_at);
                let elapsed = (Utc::now() - started).to_std().unwrap_or(Duration::ZERO);
                Instant::now() + self.config.job_timeout.saturating_sub(elapsed)
            }
            Ok(None) => {
                warn!(job_id = %job_id, "Monitored job does not exist");
                self.deregister(job_id).await;
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Could not load job, using full timeout");
                Instant::now() + self.config.job_timeout
            }
        };

        let mut next_check = Instant::now() + self.config.interval;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(job_id = %job_id, "Monitor cancelled");
                    break;
                }
                _ = tokio::time::sleep_until(timeout_at) => {
                    let reason = format!("job timed out after {}s", self.config.job_timeout.as_secs());
                    if let Err(e) = self.cancel_job(job_id, &reason).await {
                        error!(job_id = %job_id, error = %e, "Failed to cancel timed out job");
                    }
                    break;
                }
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(next_check) => {}
            }

            match self.evaluate(job_id).await {
                Ok(Evaluation::Finished(status)) => {
                    debug!(job_id = %job_id, status = %status, "Monitor finished");
                    break;
                }
                Ok(Evaluation::Active { recheck_in }) => {
                    let wait = recheck_in.map_or(self.config.interval, |r| r.min(self.config.interval));
                    next_check = Instant::now() + wait;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Evaluation failed, retrying next tick");
                    next_check = Instant::now() + self.config.interval;
                }
            }
        }

        self.deregister(job_id).await;
    }

    async fn deregister(&self, job_id: Uuid) {
        self.monitors.write().await.remove(&job_id);
        self.job_tokens.write().await.remove(&job_id);
    }

    /// Token that fires once `job_id` is cancelled or failed. Workers race
    /// their page work against it.
    pub async fn job_token(&self, job_id: Uuid) -> CancellationToken {
        self.job_tokens
            .write()
            .await
            .entry(job_id)
            .or_default()
            .clone()
    }

    // ── Evaluation ──────────────────────────────────────────────────

    async fn load(&self, job_id: Uuid) -> crate::Result<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(Error::Job(JobError::NotFound { id: job_id }))
    }

    /// One monitor pass over a parent job.
    pub async fn evaluate(&self, job_id: Uuid) -> crate::Result<Evaluation> {
        let job = self.load(job_id).await?;
        if job.status.is_terminal() {
            return Ok(Evaluation::Finished(job.status));
        }
        let progress = job.progress;

        // Pending work but nobody has made progress in a long time.
        let idle_for = (Utc::now() - job.last_heartbeat).to_std().unwrap_or(Duration::ZERO);
        if progress.pending > 0 && idle_for >= self.config.stale_threshold {
            let reason = format!("no progress for {}s", idle_for.as_secs());
            self.terminate(job_id, JobStatus::Failed, &reason).await?;
            return Ok(Evaluation::Finished(JobStatus::Failed));
        }

        let tolerance = &self.config.tolerance;
        if tolerance.is_exceeded(progress.failed, progress.total) {
            let reason = format!(
                "child failures exceeded tolerance: {} of {} failed",
                progress.failed, progress.total
            );
            match tolerance.failure_action {
                FailureAction::StopAll => {
                    self.terminate(job_id, JobStatus::Failed, &reason).await?;
                    return Ok(Evaluation::Finished(JobStatus::Failed));
                }
                FailureAction::MarkWarning => {
                    if self.store.add_warning(job_id, &reason).await? {
                        warn!(job_id = %job_id, failed = progress.failed, total = progress.total, "Failure tolerance exceeded, job marked");
                    }
                }
                FailureAction::Continue => {
                    debug!(job_id = %job_id, failed = progress.failed, total = progress.total, "Failure tolerance exceeded, continuing");
                }
            }
        }

        let recheck_in = match self.check_completion(job_id).await? {
            CompletionCheck::Completed => return Ok(Evaluation::Finished(JobStatus::Completed)),
            CompletionCheck::Terminal(status) => return Ok(Evaluation::Finished(status)),
            CompletionCheck::CandidacyStarted => Some(self.config.grace_period),
            CompletionCheck::Waiting { remaining } => Some(remaining),
            CompletionCheck::Busy | CompletionCheck::Reset => None,
        };

        let job = self.load(job_id).await?;
        let stats = self.store.child_stats(job_id).await?;
        if stats.completed != job.progress.completed || stats.failed != job.progress.failed {
            // Transient while a child update is half applied.
            debug!(
                job_id = %job_id,
                rows_completed = stats.completed,
                rows_failed = stats.failed,
                counted_completed = job.progress.completed,
                counted_failed = job.progress.failed,
                "Child rows and counters differ"
            );
        }
        debug!(job_id = %job_id, progress = %job.progress.summary(), children = stats.total, "Job progress");
        self.events.publish(JobEvent::from_job(EventType::Progress, &job));

        Ok(Evaluation::Active { recheck_in })
    }

    /// Run the completion protocol once and announce a completion this call
    /// caused. Workers call this after every finished child.
    pub async fn check_completion(&self, job_id: Uuid) -> crate::Result<CompletionCheck> {
        let check = self.detector.check(job_id).await?;
        if check == CompletionCheck::Completed {
            self.job_tokens.write().await.remove(&job_id);
            let job = self.load(job_id).await?;
            self.events.publish(JobEvent::from_job(EventType::Completed, &job));
        }
        Ok(check)
    }

    /// Worker hook: a child of `parent_id` finished.
    pub async fn child_finished(&self, parent_id: Uuid) {
        if let Err(e) = self.check_completion(parent_id).await {
            warn!(parent_id = %parent_id, error = %e, "Completion check failed");
        }
        self.notify(parent_id).await;
    }

    async fn terminate(&self, job_id: Uuid, status: JobStatus, reason: &str) -> crate::Result<bool> {
        if !self.store.terminate_job(job_id, status, reason).await? {
            return Ok(false);
        }
        if let Some(token) = self.job_tokens.write().await.remove(&job_id) {
            token.cancel();
        }
        let job = self.load(job_id).await?;
        if let Some(event_type) = EventType::for_terminal(status) {
            self.events.publish(JobEvent::from_job(event_type, &job));
        }
        match status {
            JobStatus::Failed => warn!(job_id = %job_id, reason, "Job failed"),
            _ => info!(job_id = %job_id, status = %status, reason, "Job terminated"),
        }
        Ok(true)
    }

    /// Cancel a parent and every non-terminal child. Returns false if the
    /// job was already terminal.
    pub async fn cancel_job(&self, job_id: Uuid, reason: &str) -> crate::Result<bool> {
        let job = self.load(job_id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        if !job.status.can_transition_to(JobStatus::Cancelled) {
            return Err(Error::Job(JobError::InvalidTransition {
                id: job_id,
                state: job.status.to_string(),
                target: JobStatus::Cancelled.to_string(),
            }));
        }
        let cancelled = self.terminate(job_id, JobStatus::Cancelled, reason).await?;
        self.notify(job_id).await;
        Ok(cancelled)
    }

    /// Fail a parent before any work was spawned.
    pub async fn fail_job(&self, job_id: Uuid, reason: &str) -> crate::Result<bool> {
        self.terminate(job_id, JobStatus::Failed, reason).await
    }

    // ── Process lifecycle ───────────────────────────────────────────

    /// Resume monitoring of running parents after a restart.
    ///
    /// Completion candidacy does not survive a restart: every window starts
    /// over, so no job completes on the strength of pre-crash observations.
    pub async fn recover(self: &Arc<Self>) -> crate::Result<usize> {
        let reset = self.store.reset_completion_candidates().await?;
        let running = self.store.list_parent_jobs(Some(JobStatus::Running)).await?;
        for job in &running {
            self.start_monitoring(job.id).await;
        }
        info!(resumed = running.len(), candidacies_reset = reset, "Orchestrator recovered");
        Ok(running.len())
    }

    /// Stop every monitor and wait for them to exit. Jobs stay as they are.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut monitors = self.monitors.write().await;
            monitors.drain().map(|(_, tracked)| tracked.handle).collect()
        };
        let count = handles.len();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Monitor task panicked");
            }
        }
        self.document_counter.abort();
        info!(stopped = count, "Orchestrator shut down");
    }
}

/// Keeps `metadata.document_count` of parents in step with saved documents.
struct DocumentCounter {
    store: Arc<dyn JobStore>,
}

#[async_trait]
impl EventHandler for DocumentCounter {
    async fn handle(&self, event: &JobEvent) -> crate::Result<()> {
        self.store.increment_document_count(event.job_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CrawlConfig, ErrorTolerance};
    use crate::jobs::{JobConfig, JobMetadata, TaskOutcome, task_types};
    use crate::store::LibSqlStore;

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            grace_period: Duration::from_millis(40),
            interval: Duration::from_millis(20),
            ..MonitorConfig::default()
        }
    }

    async fn setup(config: MonitorConfig) -> (Arc<LibSqlStore>, Arc<Orchestrator>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let orchestrator = Orchestrator::new(store.clone(), EventBus::new(), config);
        (store, orchestrator)
    }

    async fn parent_with_children(store: &LibSqlStore, n: u64) -> (Uuid, Vec<Uuid>) {
        let parent = Job::new_parent(
            task_types::CRAWL,
            JobConfig::Crawl(CrawlConfig::default()),
            JobMetadata::default(),
        );
        store.create_job(&parent).await.unwrap();
        store.reserve_children(parent.id, n, 0).await.unwrap();
        let mut children = Vec::new();
        for _ in 0..n {
            let child = Job::new_child(parent.id, task_types::CRAWL_URL, 0, JobMetadata::default());
            store.create_job(&child).await.unwrap();
            children.push(child.id);
        }
        (parent.id, children)
    }

    async fn finish(store: &LibSqlStore, parent: Uuid, child: Uuid, outcome: TaskOutcome) {
        store.start_child(child, parent).await.unwrap();
        if outcome == TaskOutcome::Completed {
            store.heartbeat(parent).await.unwrap();
        }
        store.finish_child(child, parent, outcome, 1, None).await.unwrap();
    }

    async fn wait_for_terminal(
        mut rx: tokio::sync::broadcast::Receiver<JobEvent>,
        job_id: Uuid,
    ) -> JobEvent {
        tokio::time::timeout(Duration::from_secs(2), async move {
            loop {
                if let Ok(event) = rx.recv().await {
                    if event.job_id == job_id && event.event_type.is_terminal() {
                        return event;
                    }
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn monitor_completes_idle_job_and_deregisters() {
        let (store, orchestrator) = setup(fast_config()).await;
        let (parent, children) = parent_with_children(&store, 2).await;
        let waiter = tokio::spawn(wait_for_terminal(orchestrator.events().subscribe_raw(), parent));

        orchestrator.start_monitoring(parent).await;
        orchestrator.start_monitoring(parent).await;
        assert_eq!(orchestrator.active_monitors().await, 1);

        for child in children {
            finish(&store, parent, child, TaskOutcome::Completed).await;
            orchestrator.child_finished(parent).await;
        }

        let event = waiter.await.unwrap();
        assert_eq!(event.event_type, EventType::Completed);
        assert_eq!(event.counts.completed, 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!orchestrator.is_monitoring(parent).await);
        let job = store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_count, 2);
    }

    #[tokio::test]
    async fn cancel_propagates_and_syncs_counts() {
        let (store, orchestrator) = setup(fast_config()).await;
        let (parent, children) = parent_with_children(&store, 3).await;
        finish(&store, parent, children[0], TaskOutcome::Completed).await;
        store.start_child(children[1], parent).await.unwrap();

        orchestrator.start_monitoring(parent).await;
        assert!(orchestrator.cancel_job(parent, "user request").await.unwrap());
        assert!(!orchestrator.cancel_job(parent, "again").await.unwrap());

        let job = store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.progress.cancelled, 2);
        assert_eq!(job.progress.pending, 0);
        assert_eq!(job.result_count, job.progress.completed);
        assert_eq!(job.failed_count, job.progress.failed);

        for child in store.list_children(parent).await.unwrap() {
            assert!(child.status.is_terminal());
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!orchestrator.is_monitoring(parent).await);
    }

    #[tokio::test]
    async fn job_token_fires_on_cancel_only() {
        let (store, orchestrator) = setup(fast_config()).await;
        let (cancelled, _) = parent_with_children(&store, 1).await;
        let (completed, children) = parent_with_children(&store, 1).await;

        let token = orchestrator.job_token(cancelled).await;
        assert!(!token.is_cancelled());
        orchestrator.cancel_job(cancelled, "user request").await.unwrap();
        assert!(token.is_cancelled());

        let token = orchestrator.job_token(completed).await;
        finish(&store, completed, children[0], TaskOutcome::Completed).await;
        assert_eq!(
            orchestrator.check_completion(completed).await.unwrap(),
            CompletionCheck::CandidacyStarted
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            orchestrator.check_completion(completed).await.unwrap(),
            CompletionCheck::Completed
        );
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn failure_tolerance_fails_the_parent() {
        let config = MonitorConfig {
            tolerance: ErrorTolerance {
                max_child_failures: 2,
                max_failure_ratio: 1.0,
                failure_action: FailureAction::StopAll,
            },
            ..fast_config()
        };
        let (store, orchestrator) = setup(config).await;
        let (parent, children) = parent_with_children(&store, 4).await;
        finish(&store, parent, children[0], TaskOutcome::Failed).await;
        assert!(matches!(
            orchestrator.evaluate(parent).await.unwrap(),
            Evaluation::Active { .. }
        ));

        finish(&store, parent, children[1], TaskOutcome::Failed).await;
        assert_eq!(
            orchestrator.evaluate(parent).await.unwrap(),
            Evaluation::Finished(JobStatus::Failed)
        );
        let job = store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.failed_count, 2);
        assert_eq!(job.progress.cancelled, 2);
    }

    #[tokio::test]
    async fn mark_warning_keeps_the_job_running() {
        let config = MonitorConfig {
            tolerance: ErrorTolerance {
                max_child_failures: 1,
                max_failure_ratio: 1.0,
                failure_action: FailureAction::MarkWarning,
            },
            ..fast_config()
        };
        let (store, orchestrator) = setup(config).await;
        let (parent, children) = parent_with_children(&store, 3).await;
        finish(&store, parent, children[0], TaskOutcome::Failed).await;

        orchestrator.evaluate(parent).await.unwrap();
        orchestrator.evaluate(parent).await.unwrap();

        let job = store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.metadata.warnings.len(), 1);
    }

    #[tokio::test]
    async fn job_timeout_cancels_the_job() {
        let config = MonitorConfig {
            job_timeout: Duration::from_millis(30),
            interval: Duration::from_secs(10),
            ..fast_config()
        };
        let (store, orchestrator) = setup(config).await;
        let (parent, _children) = parent_with_children(&store, 1).await;

        orchestrator.start_monitoring(parent).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let job = store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error.unwrap_or_default().contains("timed out"));
        assert!(!orchestrator.is_monitoring(parent).await);
    }

    #[tokio::test]
    async fn shutdown_stops_monitors_without_touching_jobs() {
        let (store, orchestrator) = setup(fast_config()).await;
        let (parent, _children) = parent_with_children(&store, 1).await;
        orchestrator.start_monitoring(parent).await;

        orchestrator.shutdown().await;
        assert_eq!(orchestrator.active_monitors().await, 0);
        let job = store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn recover_resets_candidacy_and_resumes() {
        let (store, orchestrator) = setup(fast_config()).await;
        let (parent, children) = parent_with_children(&store, 1).await;
        finish(&store, parent, children[0], TaskOutcome::Completed).await;
        store.mark_completion_candidate(parent, Utc::now()).await.unwrap();

        assert_eq!(orchestrator.recover().await.unwrap(), 1);
        assert!(orchestrator.is_monitoring(parent).await);
        let job = store.get_job(parent).await.unwrap().unwrap();
        assert!(job.completion_candidate_at.is_none() || job.status == JobStatus::Completed);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn document_saved_events_bump_document_count() {
        let (store, orchestrator) = setup(fast_config()).await;
        let (parent, _children) = parent_with_children(&store, 1).await;
        let job = store.get_job(parent).await.unwrap().unwrap();

        orchestrator.events().publish(JobEvent::document_saved(&job, Uuid::new_v4()));
        orchestrator.events().publish(JobEvent::document_saved(&job, Uuid::new_v4()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let job = store.get_job(parent).await.unwrap().unwrap();
        assert_eq!(job.metadata.document_count, 2);
    }
}
