//! Durable task queue contract.
//!
//! Lease-based, at-least-once delivery: a dequeued message stays invisible
//! for its visibility timeout and is redelivered unless acknowledged.

pub mod libsql_queue;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::jobs::TaskMessage;

pub use libsql_queue::LibSqlQueue;

/// A leased message.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Queue-assigned id, used to acknowledge.
    pub id: String,
    pub task: TaskMessage,
    /// Deliveries so far, including this one.
    pub receive_count: u32,
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages ready to be dequeued.
    pub pending: u64,
    /// Messages currently leased.
    pub in_flight: u64,
}

/// Durable queue of task messages.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a message. Returns its id.
    async fn enqueue(&self, task: &TaskMessage) -> Result<String, QueueError>;

    /// Lease the oldest visible message, or `None` when nothing is ready.
    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>, QueueError>;

    /// Delete a message after it was handled.
    async fn ack(&self, id: &str) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}
