//! Persistence layer: libSQL-backed storage for jobs, documents and bookkeeping.

pub mod libsql_backend;
pub mod migrations;
pub mod retry;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use retry::{RetryPolicy, with_retry};
pub use traits::{ChildStats, JobStore};
