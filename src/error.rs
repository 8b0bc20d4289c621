//! Error types for the crawl orchestrator.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

impl Error {
    /// Whether the failure is transient and the task should be redelivered
    /// rather than recorded as failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => e.is_busy(),
            Self::Queue(QueueError::Database(e)) => e.is_busy(),
            Self::Pool(PoolError::Exhausted { .. }) => true,
            Self::Render(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Map a libSQL error, separating lock contention from hard failures.
    pub fn from_libsql(context: &str, err: libsql::Error) -> Self {
        let msg = err.to_string();
        if is_busy_message(&msg) {
            Self::Busy(format!("{context}: {msg}"))
        } else {
            Self::Query(format!("{context}: {msg}"))
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

fn is_busy_message(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("database is locked")
        || lower.contains("database is busy")
        || lower.contains("sqlite_busy")
}

/// Durable queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Malformed queue message {id}: {reason}")]
    Malformed { id: String, reason: String },
}

/// Resource pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No pooled handle became free within {timeout:?}")]
    Exhausted { timeout: Duration },

    #[error("Pool is shut down")]
    Closed,

    #[error("Failed to create pooled handle: {0}")]
    Create(String),
}

/// Page rendering errors raised inside a pooled handle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error("Timed out after {0:?} before any content arrived")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl RenderError {
    /// Transient failures are worth another attempt; client errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidUrl { .. } => false,
        }
    }
}

/// Content pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid base URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} in state {state} cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Invalid task or request: {0}")]
    Validation(String),

    #[error("No handler registered for type {0}")]
    UnsupportedType(String),

    #[error("Job {id} failed before spawning work: {reason}")]
    Fatal { id: Uuid, reason: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
