//! Crawl orchestrator: parent/child job execution over a durable queue.
//!
//! A manager turns a request into a parent job and its first tasks, workers
//! pull tasks from the queue and may discover more, and the orchestrator
//! watches each parent until the grace-period protocol confirms it is done.

pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod manager;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
