//! Configuration types.
//!
//! Every section has a `Default` and is populated from `CRAWL_*` environment
//! variables by [`OrchestratorConfig::from_env`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Pools larger than this are allowed but usually a mistake.
pub const POOL_WARN_THRESHOLD: usize = 20;

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Path of the libSQL database file.
    pub database_path: PathBuf,
    /// Worker loops pulling from the queue.
    pub worker: WorkerConfig,
    /// Renderer pool sizing.
    pub pool: PoolConfig,
    /// Parent job monitoring and completion detection.
    pub monitor: MonitorConfig,
    /// Defaults applied to crawl requests that do not override them.
    pub crawl: CrawlConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/crawl.db"),
            worker: WorkerConfig::default(),
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
            crawl: CrawlConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Build configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_path = std::env::var("CRAWL_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let worker = WorkerConfig {
            concurrency: env_or("CRAWL_CONCURRENCY", defaults.worker.concurrency),
            poll_interval: env_millis("CRAWL_POLL_INTERVAL_MS", defaults.worker.poll_interval),
            visibility_timeout: env_secs(
                "CRAWL_VISIBILITY_TIMEOUT_SECS",
                defaults.worker.visibility_timeout,
            ),
            max_receive: env_or("CRAWL_MAX_RECEIVE", defaults.worker.max_receive),
            max_retries: env_or("CRAWL_MAX_RETRIES", defaults.worker.max_retries),
            retry_backoff: defaults.worker.retry_backoff,
        };

        let pool = PoolConfig {
            min_instances: env_or("CRAWL_POOL_MIN", defaults.pool.min_instances),
            max_instances: env_or("CRAWL_POOL_MAX", defaults.pool.max_instances),
            acquire_timeout: env_secs(
                "CRAWL_POOL_ACQUIRE_TIMEOUT_SECS",
                defaults.pool.acquire_timeout,
            ),
            user_agent: std::env::var("CRAWL_USER_AGENT").unwrap_or(defaults.pool.user_agent),
        };

        let failure_action = match std::env::var("CRAWL_FAILURE_ACTION") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.monitor.tolerance.failure_action,
        };

        let monitor = MonitorConfig {
            grace_period: env_secs("CRAWL_GRACE_PERIOD_SECS", defaults.monitor.grace_period),
            interval: env_secs("CRAWL_MONITOR_INTERVAL_SECS", defaults.monitor.interval),
            job_timeout: env_secs("CRAWL_JOB_TIMEOUT_SECS", defaults.monitor.job_timeout),
            stale_threshold: env_secs(
                "CRAWL_STALE_THRESHOLD_SECS",
                defaults.monitor.stale_threshold,
            ),
            tolerance: ErrorTolerance {
                max_child_failures: env_or(
                    "CRAWL_MAX_CHILD_FAILURES",
                    defaults.monitor.tolerance.max_child_failures,
                ),
                max_failure_ratio: env_or(
                    "CRAWL_MAX_FAILURE_RATIO",
                    defaults.monitor.tolerance.max_failure_ratio,
                ),
                failure_action,
            },
        };

        let crawl = CrawlConfig {
            max_depth: env_or("CRAWL_MAX_DEPTH", defaults.crawl.max_depth),
            max_pages: env_or("CRAWL_MAX_PAGES", defaults.crawl.max_pages),
            follow_links: env_or("CRAWL_FOLLOW_LINKS", defaults.crawl.follow_links),
            include_patterns: env_list("CRAWL_INCLUDE_PATTERNS"),
            exclude_patterns: env_list("CRAWL_EXCLUDE_PATTERNS"),
            request_delay_ms: env_or("CRAWL_REQUEST_DELAY_MS", defaults.crawl.request_delay_ms),
            operation_timeout_secs: env_or(
                "CRAWL_OPERATION_TIMEOUT_SECS",
                defaults.crawl.operation_timeout_secs,
            ),
        };

        let config = Self {
            database_path,
            worker,
            pool,
            monitor,
            crawl,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(invalid("CRAWL_CONCURRENCY", "must be at least 1"));
        }
        if self.worker.max_receive == 0 {
            return Err(invalid("CRAWL_MAX_RECEIVE", "must be at least 1"));
        }
        if self.pool.max_instances == 0 {
            return Err(invalid("CRAWL_POOL_MAX", "must be at least 1"));
        }
        if self.pool.min_instances > self.pool.max_instances {
            return Err(invalid(
                "CRAWL_POOL_MIN",
                "must not exceed CRAWL_POOL_MAX",
            ));
        }
        let ratio = self.monitor.tolerance.max_failure_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(invalid("CRAWL_MAX_FAILURE_RATIO", "must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Lease length of a dequeued message before it becomes visible again.
    pub visibility_timeout: Duration,
    /// Deliveries allowed before a message is recorded as failed.
    pub max_receive: u32,
    /// In-worker retries of transient render failures.
    pub max_retries: u32,
    /// Base delay of the in-worker exponential backoff.
    pub retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(300), // 5 minutes
            max_receive: 3,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Renderer pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Handles created eagerly at startup.
    pub min_instances: usize,
    /// Upper bound on live handles.
    pub max_instances: usize,
    /// Longest a caller waits for a free handle.
    pub acquire_timeout: Duration,
    /// User agent sent by HTTP renderers.
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 4,
            acquire_timeout: Duration::from_secs(30),
            user_agent: format!("crawl-orchestrator/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Parent job monitoring.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Idle window before a zero-pending job is confirmed complete.
    pub grace_period: Duration,
    /// Scheduled evaluation interval of each monitor.
    pub interval: Duration,
    /// Jobs running longer than this are cancelled.
    pub job_timeout: Duration,
    /// Jobs with pending work and no heartbeat for this long are failed.
    pub stale_threshold: Duration,
    /// When child failures move the parent to failed.
    pub tolerance: ErrorTolerance,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            interval: Duration::from_secs(5),
            job_timeout: Duration::from_secs(1800), // 30 minutes
            stale_threshold: Duration::from_secs(600), // 10 minutes
            tolerance: ErrorTolerance::default(),
        }
    }
}

/// Child failure tolerance of a parent job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTolerance {
    /// Absolute failure limit; 0 disables the check.
    pub max_child_failures: usize,
    /// Failed / total ratio that must be exceeded to trigger the action.
    pub max_failure_ratio: f64,
    pub failure_action: FailureAction,
}

impl Default for ErrorTolerance {
    fn default() -> Self {
        Self {
            max_child_failures: 0,
            max_failure_ratio: 0.5,
            failure_action: FailureAction::StopAll,
        }
    }
}

impl ErrorTolerance {
    /// Whether `failed` out of `total` children breaches the tolerance.
    pub fn is_exceeded(&self, failed: u64, total: u64) -> bool {
        if failed == 0 || total == 0 {
            return false;
        }
        if self.max_child_failures > 0 && failed as usize >= self.max_child_failures {
            return true;
        }
        self.max_failure_ratio < 1.0 && (failed as f64 / total as f64) > self.max_failure_ratio
    }
}

/// What the orchestrator does once the tolerance is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Fail the parent and cancel outstanding children.
    StopAll,
    /// Keep going; failures only show up in the counts.
    Continue,
    /// Keep going and attach a warning to the parent.
    MarkWarning,
}

impl FromStr for FailureAction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop_all" => Ok(Self::StopAll),
            "continue" => Ok(Self::Continue),
            "mark_warning" => Ok(Self::MarkWarning),
            other => Err(invalid(
                "CRAWL_FAILURE_ACTION",
                &format!("unknown action '{other}' (expected stop_all, continue or mark_warning)"),
            )),
        }
    }
}

/// Per-request crawl settings, carried on the parent job and on every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Depth of the deepest page that is still fetched (seeds are depth 0).
    pub max_depth: u32,
    /// Cap on pages per parent job; 0 means unlimited.
    pub max_pages: u64,
    pub follow_links: bool,
    /// Regexes a link must match at least one of (empty = all links).
    pub include_patterns: Vec<String>,
    /// Regexes that reject a link.
    pub exclude_patterns: Vec<String>,
    /// Delay before each fetch.
    pub request_delay_ms: u64,
    /// Budget for a single page render.
    pub operation_timeout_secs: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_pages: 100,
            follow_links: true,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            request_delay_ms: 0,
            operation_timeout_secs: 30,
        }
    }
}

impl CrawlConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.max(1))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitor.grace_period, Duration::from_secs(5));
        assert_eq!(config.monitor.job_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn min_above_max_is_rejected() {
        let mut config = OrchestratorConfig::default();
        config.pool.min_instances = 5;
        config.pool.max_instances = 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "CRAWL_POOL_MIN"
        ));
    }

    #[test]
    fn failure_action_parses() {
        assert_eq!("stop_all".parse::<FailureAction>().unwrap(), FailureAction::StopAll);
        assert_eq!(
            " Mark_Warning ".parse::<FailureAction>().unwrap(),
            FailureAction::MarkWarning
        );
        assert!("explode".parse::<FailureAction>().is_err());
    }

    #[test]
    fn tolerance_ratio_and_absolute_limit() {
        let tolerance = ErrorTolerance::default();
        assert!(!tolerance.is_exceeded(0, 10));
        assert!(!tolerance.is_exceeded(5, 10));
        assert!(tolerance.is_exceeded(6, 10));

        let absolute = ErrorTolerance {
            max_child_failures: 2,
            max_failure_ratio: 1.0,
            failure_action: FailureAction::StopAll,
        };
        assert!(!absolute.is_exceeded(1, 100));
        assert!(absolute.is_exceeded(2, 100));
    }

    #[test]
    fn ratio_of_one_never_trips() {
        let lenient = ErrorTolerance {
            max_child_failures: 0,
            max_failure_ratio: 1.0,
            failure_action: FailureAction::StopAll,
        };
        assert!(!lenient.is_exceeded(10, 10));
    }

    #[test]
    fn crawl_config_deserializes_with_defaults() {
        let config: CrawlConfig = serde_json::from_str(r#"{"max_depth": 1}"#).unwrap();
        assert_eq!(config.max_depth, 1);
        assert_eq!(config.max_pages, 100);
        assert!(config.follow_links);
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
    }
}
