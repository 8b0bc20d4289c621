//! Page renderers: the long-lived handles held by the pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::error::{PoolError, RenderError};

/// Output of one page render.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPage {
    /// URL after redirects.
    pub url: String,
    pub status: u16,
    pub html: String,
    /// The operation timeout cut the body short.
    pub partial: bool,
}

/// A reusable automation handle that turns a URL into HTML.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Render `url`. When `timeout` elapses after content started arriving,
    /// return what was received with `partial` set instead of failing.
    async fn render(&self, url: &str, timeout: Duration) -> Result<RenderedPage, RenderError>;

    /// Release resources held by the handle. Called once on pool shutdown.
    async fn close(&self) {}
}

/// Creates renderer handles for the pool.
#[async_trait]
pub trait RendererFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PageRenderer>, PoolError>;
}

/// Plain HTTP renderer built on a `reqwest` client.
pub struct HttpRenderer {
    client: reqwest::Client,
}

impl HttpRenderer {
    pub fn new(user_agent: &str) -> Result<Self, PoolError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| PoolError::Create(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    async fn render(&self, url: &str, timeout: Duration) -> Result<RenderedPage, RenderError> {
        let parsed = Url::parse(url).map_err(|e| RenderError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let deadline = Instant::now() + timeout;

        let mut response = match tokio::time::timeout_at(deadline, self.client.get(parsed).send()).await
        {
            Err(_) => return Err(RenderError::Timeout(timeout)),
            Ok(Err(e)) if e.is_timeout() => return Err(RenderError::Timeout(timeout)),
            Ok(Err(e)) => return Err(RenderError::Network(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(RenderError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let final_url = response.url().to_string();

        let mut body = Vec::new();
        let mut partial = false;
        loop {
            match tokio::time::timeout_at(deadline, response.chunk()).await {
                Err(_) => {
                    partial = true;
                    break;
                }
                Ok(Ok(Some(chunk))) => body.extend_from_slice(&chunk),
                Ok(Ok(None)) => break,
                Ok(Err(e)) if body.is_empty() => return Err(RenderError::Network(e.to_string())),
                Ok(Err(e)) => {
                    debug!(url, error = %e, "Body stream broke, keeping partial content");
                    partial = true;
                    break;
                }
            }
        }

        Ok(RenderedPage {
            url: final_url,
            status: status.as_u16(),
            html: String::from_utf8_lossy(&body).into_owned(),
            partial,
        })
    }
}

/// Factory for [`HttpRenderer`] handles.
pub struct HttpRendererFactory {
    user_agent: String,
}

impl HttpRendererFactory {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl RendererFactory for HttpRendererFactory {
    async fn create(&self) -> Result<Arc<dyn PageRenderer>, PoolError> {
        Ok(Arc::new(HttpRenderer::new(&self.user_agent)?))
    }
}
