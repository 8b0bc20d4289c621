//! Worker system: executes one queued task at a time.
//!
//! Core components:
//! - `Worker`: per-task-type executor (validate, then execute)
//! - `WorkerRegistry`: task type → worker lookup
//! - `crawl`: `CrawlWorker`, one page per task
//! - `processor`: `JobProcessor`, the pool of loops pulling from the queue

pub mod crawl;
pub mod processor;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::events::EventBus;
use crate::jobs::TaskMessage;
use crate::orchestrator::Orchestrator;
use crate::pool::RendererPool;
use crate::queue::TaskQueue;
use crate::store::JobStore;

pub use crawl::CrawlWorker;
pub use processor::JobProcessor;

/// Shared dependencies handed to workers at construction.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub pool: Arc<RendererPool>,
    pub events: EventBus,
    pub orchestrator: Arc<Orchestrator>,
}

/// Per-delivery execution context.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// How often the queue has delivered this message, including now.
    pub receive_count: u32,
    /// Fires when the processor shuts down.
    pub cancel: CancellationToken,
}

/// Executor for one task type.
///
/// `execute` returning `Ok` means the task is settled (succeeded or its
/// failure recorded) and the message can be acked. A retryable error leaves
/// the message on the queue for redelivery.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Task type handled by this worker.
    fn worker_type(&self) -> &str;

    /// Schema checks before execution. Failures are never retried.
    fn validate(&self, task: &TaskMessage) -> Result<(), JobError>;

    /// Run the task. Must be safe to run again on redelivery.
    async fn execute(&self, task: &TaskMessage, ctx: &TaskContext) -> crate::Result<()>;
}

/// Registry of workers keyed by task type.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<dyn Worker>>>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a worker, replacing any previous one for the same type.
    pub async fn register(&self, worker: Arc<dyn Worker>) {
        let name = worker.worker_type().to_string();
        if self.workers.write().await.insert(name.clone(), worker).is_some() {
            tracing::warn!(task_type = %name, "Replaced existing worker registration");
        } else {
            tracing::debug!(task_type = %name, "Registered worker");
        }
    }

    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn Worker>> {
        self.workers.read().await.get(task_type).cloned()
    }

    /// Registered task types.
    pub async fn list(&self) -> Vec<String> {
        self.workers.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.workers.read().await.len()
    }
}
