//! Managers turn a workload request into a parent job.
//!
//! A manager validates the request, creates the parent row, enqueues one
//! task per unit of work and hands the parent to the orchestrator. It never
//! does the work itself, except for inline workloads that finish in one step.

pub mod crawl;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::JobError;

pub use crawl::{CrawlManager, CrawlRequest};
pub use transform::TransformManager;

/// Entry point of one workload type.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Workload type handled by this manager.
    fn manager_type(&self) -> &str;

    /// Validate `request`, create the parent job and start its work.
    async fn create_parent_job(&self, request: serde_json::Value) -> crate::Result<Uuid>;
}

/// Decode a loosely typed request into the manager's request type.
pub(crate) fn decode_request<T: serde::de::DeserializeOwned>(
    kind: &str,
    request: serde_json::Value,
) -> Result<T, JobError> {
    serde_json::from_value(request)
        .map_err(|e| JobError::Validation(format!("{kind} request: {e}")))
}

/// Registry of managers keyed by workload type.
pub struct ManagerRegistry {
    managers: RwLock<HashMap<String, Arc<dyn Manager>>>,
}

impl Default for ManagerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self {
            managers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, manager: Arc<dyn Manager>) {
        let name = manager.manager_type().to_string();
        if self.managers.write().await.insert(name.clone(), manager).is_some() {
            tracing::warn!(workload_type = %name, "Replaced existing manager registration");
        } else {
            tracing::debug!(workload_type = %name, "Registered manager");
        }
    }

    pub async fn get(&self, workload_type: &str) -> Option<Arc<dyn Manager>> {
        self.managers.read().await.get(workload_type).cloned()
    }

    pub async fn list(&self) -> Vec<String> {
        self.managers.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.managers.read().await.len()
    }

    /// Route `request` to the manager of `workload_type`.
    pub async fn submit(&self, workload_type: &str, request: serde_json::Value) -> crate::Result<Uuid> {
        let manager = self
            .get(workload_type)
            .await
            .ok_or_else(|| JobError::UnsupportedType(workload_type.to_string()))?;
        manager.create_parent_job(request).await
    }
}
