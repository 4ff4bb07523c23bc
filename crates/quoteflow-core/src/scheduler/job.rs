//! Refresh job definitions and status snapshots.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::SchedulerError;

/// Key namespace for data written by refresh jobs.
pub const PREFETCH_PREFIX: &str = "prefetch:";

/// Future returned by an upstream fetch function.
pub type FetchFuture = BoxFuture<'static, anyhow::Result<Vec<u8>>>;

/// Upstream fetch function. The scheduler owns all retry logic; fetchers
/// should fail fast and never retry on their own.
pub type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Bootstrap order and tie-break for status listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTrigger {
    /// Staggered startup run.
    Bootstrap,
    /// Periodic tick found the job due.
    Interval,
    /// Backoff retry after a failure.
    Retry,
    /// Direct `execute_job` call.
    Manual,
    /// Operator-requested refresh.
    Forced,
}

/// Result of one `execute_job` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Fresh data was written to the cache.
    Succeeded { bytes: usize },
    /// The fetch failed; cached data from earlier runs is left in place.
    Failed { error: String, retry_scheduled: bool },
    /// Another execution of the same job was in flight; nothing was done.
    AlreadyRunning,
}

/// Static description of a refresh job.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub interval: Duration,
    pub priority: Priority,
    pub max_retries: u32,
    /// TTL of the cache entry written on success.
    pub ttl: Duration,
    pub cache_key: String,
    pub tags: Vec<String>,
    pub fetch: FetchFn,
}

impl JobDefinition {
    /// Create a job writing raw bytes under `prefetch:<name>`.
    ///
    /// Defaults: medium priority, 3 retries, TTL of three intervals.
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
    {
        let name = name.into();
        Self {
            cache_key: format!("{PREFETCH_PREFIX}{name}"),
            name,
            interval,
            priority: Priority::Medium,
            max_retries: 3,
            ttl: interval * 3,
            tags: Vec::new(),
            fetch: Arc::new(move || -> FetchFuture { Box::pin(fetch()) }),
        }
    }

    /// Create a job whose fetch function produces JSON.
    pub fn json<F, Fut>(name: impl Into<String>, interval: Duration, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Self::new(name, interval, move || {
            let fut = fetch();
            async move {
                let value = fut.await?;
                Ok::<_, anyhow::Error>(serde_json::to_vec(&value)?)
            }
        })
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = cache_key.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SchedulerError> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("job name must not be empty".into()));
        }
        if self.interval.is_zero() {
            return Err(SchedulerError::InvalidJob(format!(
                "job '{}' interval must be > 0",
                self.name
            )));
        }
        if self.cache_key.is_empty() {
            return Err(SchedulerError::InvalidJob(format!(
                "job '{}' cache key must not be empty",
                self.name
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("priority", &self.priority)
            .field("max_retries", &self.max_retries)
            .field("ttl", &self.ttl)
            .field("cache_key", &self.cache_key)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a job, for operators and tests.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub priority: Priority,
    pub interval_ms: u64,
    pub cache_key: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub running: bool,
    pub retry_pending: bool,
    pub run_count: u64,
    pub failure_count: u64,
    /// Milliseconds since the last execution started.
    pub last_run_ago_ms: Option<u64>,
    /// Milliseconds since the last successful execution finished.
    pub last_success_ago_ms: Option<u64>,
    pub last_error: Option<String>,
}
