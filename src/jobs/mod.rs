//! Job, document and task message model.

pub mod model;
pub mod state;

pub use model::{
    CrawlTask, Document, Job, JobConfig, JobMetadata, JobProgress, TaskMessage, TaskOutcome,
    TransformRequest, task_types,
};
pub use state::JobStatus;
