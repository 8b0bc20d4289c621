//! In-process event bus: fan-out of job lifecycle events to subscribers.
//!
//! Publishing never blocks: events go into a broadcast channel and each
//! subscriber drains it on its own task. A slow subscriber lags and skips
//! events instead of slowing down workers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jobs::{Job, JobStatus};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Kinds of events published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Started,
    Completed,
    Failed,
    Cancelled,
    Progress,
    DocumentSaved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Progress => "progress",
            Self::DocumentSaved => "document_saved",
        }
    }

    /// Event announcing that a job reached `status`, if it is terminal.
    pub fn for_terminal(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Completed => Some(Self::Completed),
            JobStatus::Failed => Some(Self::Failed),
            JobStatus::Cancelled => Some(Self::Cancelled),
            JobStatus::Pending | JobStatus::Running => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter snapshot carried by every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub document_count: u64,
}

/// Payload delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub event_type: EventType,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub workload_type: String,
    pub counts: EventCounts,
    /// Human readable progress summary.
    pub progress_text: Option<String>,
    pub error: Option<String>,
    /// Set on `document_saved`.
    pub document_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    /// Snapshot of `job` as an event of the given type.
    pub fn from_job(event_type: EventType, job: &Job) -> Self {
        let p = job.progress;
        Self {
            event_type,
            job_id: job.id,
            status: job.status,
            workload_type: job.job_type.clone(),
            counts: EventCounts {
                total: p.total,
                pending: p.queued(),
                running: p.running,
                completed: p.completed,
                failed: p.failed,
                cancelled: p.cancelled,
                document_count: job.metadata.document_count,
            },
            progress_text: Some(p.summary()),
            error: job.error.clone(),
            document_id: None,
            timestamp: Utc::now(),
        }
    }

    /// A document was persisted under `parent`.
    pub fn document_saved(parent: &Job, document_id: Uuid) -> Self {
        Self {
            document_id: Some(document_id),
            ..Self::from_job(EventType::DocumentSaved, parent)
        }
    }
}

/// Subscriber callback.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &JobEvent) -> crate::Result<()>;
}

/// Broadcast-backed event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget publish. Having no subscribers is fine.
    pub fn publish(&self, event: JobEvent) {
        debug!(
            event = %event.event_type,
            job_id = %event.job_id,
            status = %event.status,
            "Event published"
        );
        let _ = self.tx.send(event);
    }

    /// Raw receiver of every event.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Stream of every event, skipping over lag gaps.
    pub fn stream(&self) -> impl Stream<Item = JobEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| item.ok())
    }

    /// Run `handler` for every event of `event_type` on a dedicated task.
    ///
    /// Handler errors are logged and never reach the publisher. The task
    /// ends when the bus is dropped; abort the handle to unsubscribe early.
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.event_type == event_type => {
                        if let Err(e) = handler.handle(&event).await {
                            warn!(
                                event = %event_type,
                                job_id = %event.job_id,
                                error = %e,
                                "Event handler failed"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = %event_type, skipped, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
