//! Inline transform: one HTML document in, one stored document out.
//!
//! There is nothing to fan out, so the work runs in the caller's task and
//! skips the queue. A completed placeholder job is still recorded so every
//! document has a parent in the audit trail.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::JobError;
use crate::events::{EventBus, EventType, JobEvent};
use crate::jobs::{Document, Job, JobConfig, JobMetadata, JobStatus, TransformRequest, task_types};
use crate::manager::{Manager, decode_request};
use crate::pipeline::process_content;
use crate::store::JobStore;

pub struct TransformManager {
    store: Arc<dyn JobStore>,
    events: EventBus,
}

impl TransformManager {
    pub fn new(store: Arc<dyn JobStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Convert `request.html` and persist it. Returns the placeholder job id.
    pub async fn transform(&self, request: TransformRequest) -> crate::Result<Uuid> {
        if request.source_ref.trim().is_empty() {
            return Err(JobError::Validation("transform request needs a source_ref".into()).into());
        }

        let processed = process_content(&request.html, Some(&request.source_ref));
        let now = Utc::now();

        let mut job = Job::new_parent(
            task_types::TRANSFORM,
            JobConfig::Transform,
            JobMetadata {
                source_ref: Some(request.source_ref.clone()),
                document_count: 1,
                ..JobMetadata::default()
            },
        );
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.progress.total = 1;
        job.progress.completed = 1;
        job.result_count = 1;
        job.attempts = 1;
        self.store.create_job(&job).await?;

        let doc = Document {
            id: Uuid::new_v4(),
            job_id: job.id,
            parent_job_id: job.id,
            source_ref: request.source_ref.clone(),
            title: processed.title.clone(),
            raw_content: request.html,
            converted_content: processed.converted_content.clone(),
            size: processed.size as u64,
            process_time_ms: processed.duration.as_millis() as u64,
            metadata: json!({
                "fallback": processed.fallback,
                "fallback_reason": processed.fallback_reason,
                "links_found": processed.links.len(),
                "content": processed.metadata,
            }),
            created_at: now,
        };
        self.store.save_document(&doc).await?;

        self.events.publish(JobEvent {
            document_id: Some(doc.id),
            ..JobEvent::from_job(EventType::Completed, &job)
        });
        info!(
            job_id = %job.id,
            document_id = %doc.id,
            source_ref = %request.source_ref,
            fallback = processed.fallback,
            "Transform completed"
        );
        Ok(job.id)
    }
}

#[async_trait]
impl Manager for TransformManager {
    fn manager_type(&self) -> &str {
        task_types::TRANSFORM
    }

    async fn create_parent_job(&self, request: serde_json::Value) -> crate::Result<Uuid> {
        let request: TransformRequest = decode_request(task_types::TRANSFORM, request)?;
        self.transform(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::LibSqlStore;

    async fn manager() -> (Arc<LibSqlStore>, EventBus, TransformManager) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let events = EventBus::new();
        let manager = TransformManager::new(store.clone(), events.clone());
        (store, events, manager)
    }

    #[tokio::test]
    async fn records_completed_placeholder_and_document() {
        let (store, events, manager) = manager().await;
        let mut rx = events.subscribe_raw();

        let id = manager
            .create_parent_job(json!({
                "html": "<html><head><title>Notes</title></head><body><p>Hello</p></body></html>",
                "source_ref": "upload://notes.html",
            }))
            .await
            .unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_count, job.progress.completed);
        assert_eq!(job.failed_count, job.progress.failed);
        assert_eq!(job.progress.pending, 0);

        let docs = store.list_documents(id).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].title, "Notes");
        assert!(docs[0].converted_content.contains("Hello"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Completed);
        assert_eq!(event.document_id, Some(docs[0].id));
    }

    #[tokio::test]
    async fn missing_source_ref_is_rejected() {
        let (store, _events, manager) = manager().await;
        let err = manager
            .transform(TransformRequest {
                html: "<p>x</p>".into(),
                source_ref: " ".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::Validation(_))));
        assert!(store.list_parent_jobs(None).await.unwrap().is_empty());
    }
}
