//! Bounded exponential backoff for writes that hit lock contention.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::DatabaseError;

/// Backoff settings for contended writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with up to 50% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let jitter_ms = (capped.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }
}

/// Run `op`, retrying while it fails with [`DatabaseError::Busy`].
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    name: &str,
    mut op: F,
) -> Result<T, DatabaseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_busy() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    operation = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Database busy, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_busy() => {
                tracing::warn!(operation = name, attempts = attempt, error = %e, "Giving up on contended write");
                return Err(e);
            }
            other => return other,
        }
    }
}
