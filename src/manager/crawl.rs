//! Crawl manager: seeds in, parent job with one task per seed out.
//!
//! 1. Validate and normalise the seed URLs
//! 2. Create the parent job (`running`) and publish `created`
//! 3. Compile the link patterns; a bad pattern fails the parent at once
//! 4. Reserve and enqueue one `crawl_url` task per seed at depth 0
//! 5. Publish `started` and hand the parent to the orchestrator

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CrawlConfig;
use crate::error::{Error, JobError};
use crate::events::{EventType, JobEvent};
use crate::jobs::{Job, JobConfig, JobMetadata, task_types};
use crate::manager::{Manager, decode_request};
use crate::orchestrator::Orchestrator;
use crate::pipeline::{LinkFilter, normalize_link};
use crate::queue::TaskQueue;
use crate::store::JobStore;
use crate::worker::crawl::{SpawnContext, spawn_crawl_tasks};

/// Request accepted by [`CrawlManager`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub seeds: Vec<String>,
    #[serde(default)]
    pub source_ref: Option<String>,
    /// Falls back to the manager's defaults when absent.
    #[serde(default)]
    pub config: Option<CrawlConfig>,
}

pub struct CrawlManager {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    orchestrator: Arc<Orchestrator>,
    defaults: CrawlConfig,
}

impl CrawlManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        orchestrator: Arc<Orchestrator>,
        defaults: CrawlConfig,
    ) -> Self {
        Self {
            store,
            queue,
            orchestrator,
            defaults,
        }
    }

    /// Typed entry point; [`Manager::create_parent_job`] decodes into this.
    pub async fn start_crawl(&self, request: CrawlRequest) -> crate::Result<Uuid> {
        let seeds = normalize_seeds(&request.seeds)?;
        let config = request.config.unwrap_or_else(|| self.defaults.clone());

        let parent = Job::new_parent(
            task_types::CRAWL,
            JobConfig::Crawl(config.clone()),
            JobMetadata {
                source_ref: request.source_ref.clone(),
                ..JobMetadata::default()
            },
        );
        self.store.create_job(&parent).await?;
        let events = self.orchestrator.events();
        events.publish(JobEvent::from_job(EventType::Created, &parent));

        if let Err(e) = LinkFilter::new(&config.include_patterns, &config.exclude_patterns) {
            return Err(self.fail_before_work(parent.id, e.to_string()).await);
        }

        let origin = SpawnContext {
            parent_id: parent.id,
            depth: 0,
            spawned_from: None,
            source_ref: request.source_ref.as_deref(),
        };
        let enqueued = match spawn_crawl_tasks(
            self.store.as_ref(),
            self.queue.as_ref(),
            &origin,
            seeds,
            &config,
        )
        .await
        {
            Ok(n) => n,
            Err(e) => return Err(self.fail_before_work(parent.id, e.to_string()).await),
        };
        if enqueued == 0 {
            return Err(self
                .fail_before_work(parent.id, "no seed task could be enqueued".to_string())
                .await);
        }

        if let Some(job) = self.store.get_job(parent.id).await? {
            events.publish(JobEvent::from_job(EventType::Started, &job));
        }
        self.orchestrator.start_monitoring(parent.id).await;
        info!(
            job_id = %parent.id,
            seeds = enqueued,
            max_depth = config.max_depth,
            max_pages = config.max_pages,
            "Crawl started"
        );
        Ok(parent.id)
    }

    /// Fail the parent and turn `reason` into a fatal job error.
    async fn fail_before_work(&self, job_id: Uuid, reason: String) -> Error {
        if let Err(e) = self.orchestrator.fail_job(job_id, &reason).await {
            warn!(job_id = %job_id, error = %e, "Could not mark job failed");
        }
        Error::Job(JobError::Fatal { id: job_id, reason })
    }
}

#[async_trait]
impl Manager for CrawlManager {
    fn manager_type(&self) -> &str {
        task_types::CRAWL
    }

    async fn create_parent_job(&self, request: serde_json::Value) -> crate::Result<Uuid> {
        let request: CrawlRequest = decode_request(task_types::CRAWL, request)?;
        self.start_crawl(request).await
    }
}

/// Absolute http(s) seeds without fragments, de-duplicated in order.
fn normalize_seeds(seeds: &[String]) -> Result<Vec<String>, JobError> {
    if seeds.is_empty() {
        return Err(JobError::Validation("at least one seed URL is required".into()));
    }
    let mut out: Vec<String> = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let url = normalize_link(seed, None)
            .ok_or_else(|| JobError::Validation(format!("invalid seed URL: {seed}")))?;
        if !out.contains(&url) {
            out.push(url);
        }
    }
    Ok(out)
}
