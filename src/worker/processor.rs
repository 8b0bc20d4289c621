//! Job processor: fixed pool of loops pulling tasks from the queue.
//!
//! Each loop dequeues one message, routes it to the worker registered for
//! its type and settles the message:
//! - success → ack
//! - validation failure, unknown type, malformed body → ack (never retried)
//! - retryable error → leave leased; the queue redelivers after the
//!   visibility timeout until `max_receive` deliveries
//! - anything else, or retries exhausted → record the child failed, ack

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::jobs::{TaskMessage, TaskOutcome};
use crate::orchestrator::Orchestrator;
use crate::queue::{QueueMessage, TaskQueue};
use crate::store::JobStore;
use crate::worker::{TaskContext, WorkerRegistry};

/// How a dequeued message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    /// Recorded as a failed child and acked.
    Failed,
    /// Left on the queue for redelivery.
    Retry,
    /// Acked without running (unknown type, malformed, invalid).
    Dropped,
}

/// Pool of worker loops.
pub struct JobProcessor {
    queue: Arc<dyn TaskQueue>,
    workers: Arc<WorkerRegistry>,
    store: Arc<dyn JobStore>,
    orchestrator: Arc<Orchestrator>,
    config: WorkerConfig,
    token: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl JobProcessor {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        workers: Arc<WorkerRegistry>,
        store: Arc<dyn JobStore>,
        orchestrator: Arc<Orchestrator>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            workers,
            store,
            orchestrator,
            config,
            token: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Spawn `concurrency` loops. Start times are staggered across one poll
    /// interval so idle loops do not poll in lockstep.
    pub async fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            warn!("Job processor already started");
            return;
        }

        let concurrency = self.config.concurrency.max(1);
        let step = self.config.poll_interval / concurrency as u32;
        for index in 0..concurrency {
            let this = Arc::clone(self);
            let stagger = step * index as u32;
            loops.push(tokio::spawn(async move { this.run_loop(index, stagger).await }));
        }
        info!(concurrency, "Job processor started");
    }

    /// Stop polling and wait for in-flight tasks to finish.
    pub async fn stop(&self) {
        self.token.cancel();
        let handles: Vec<_> = self.loops.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker loop panicked");
            }
        }
        info!("Job processor stopped");
    }

    async fn run_loop(self: Arc<Self>, index: usize, stagger: Duration) {
        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = tokio::time::sleep(stagger) => {}
        }
        debug!(worker = index, "Worker loop running");

        while !self.token.is_cancelled() {
            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    warn!(worker = index, error = %e, "Queue poll failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        debug!(worker = index, "Worker loop stopped");
    }

    /// Dequeue and settle one message. `Ok(None)` when the queue is empty.
    pub async fn process_next(&self) -> Result<Option<Disposition>, QueueError> {
        let message = match self.queue.dequeue(self.config.visibility_timeout).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(None),
            Err(QueueError::Malformed { id, reason }) => {
                warn!(message_id = %id, reason = %reason, "Dropping malformed queue message");
                self.queue.ack(&id).await?;
                return Ok(Some(Disposition::Dropped));
            }
            Err(e) => return Err(e),
        };
        self.handle(message).await.map(Some)
    }

    async fn handle(&self, message: QueueMessage) -> Result<Disposition, QueueError> {
        let task = &message.task;

        let Some(worker) = self.workers.get(&task.task_type).await else {
            warn!(
                message_id = %message.id,
                task_type = %task.task_type,
                job_id = %task.job_id,
                "No worker for task type, dropping"
            );
            self.queue.ack(&message.id).await?;
            return Ok(Disposition::Dropped);
        };

        if let Err(e) = worker.validate(task) {
            warn!(job_id = %task.job_id, error = %e, "Task failed validation");
            self.fail_task(task, message.receive_count, &e.to_string()).await;
            self.queue.ack(&message.id).await?;
            return Ok(Disposition::Dropped);
        }

        let ctx = TaskContext {
            receive_count: message.receive_count,
            cancel: self.token.child_token(),
        };
        match worker.execute(task, &ctx).await {
            Ok(()) => {
                self.queue.ack(&message.id).await?;
                Ok(Disposition::Completed)
            }
            Err(e) if e.is_retryable() && message.receive_count < self.config.max_receive => {
                info!(
                    job_id = %task.job_id,
                    receive_count = message.receive_count,
                    max_receive = self.config.max_receive,
                    error = %e,
                    "Task left for redelivery"
                );
                Ok(Disposition::Retry)
            }
            Err(e) => {
                error!(
                    job_id = %task.job_id,
                    receive_count = message.receive_count,
                    error = %e,
                    "Task failed"
                );
                self.fail_task(task, message.receive_count, &e.to_string()).await;
                self.queue.ack(&message.id).await?;
                Ok(Disposition::Failed)
            }
        }
    }

    /// Record a child as failed. Store errors are logged; the message is
    /// acked regardless so a poisoned task cannot loop forever.
    async fn fail_task(&self, task: &TaskMessage, attempts: u32, reason: &str) {
        if let Err(e) = self.store.record_error(task.parent_id, reason).await {
            warn!(job_id = %task.job_id, error = %e, "Could not record task error");
        }
        match self
            .store
            .finish_child(task.job_id, task.parent_id, TaskOutcome::Failed, attempts, Some(reason))
            .await
        {
            Ok(true) => self.orchestrator.child_finished(task.parent_id).await,
            Ok(false) => debug!(job_id = %task.job_id, "Child already settled"),
            Err(e) => warn!(job_id = %task.job_id, error = %e, "Could not record task failure"),
        }
    }
}
