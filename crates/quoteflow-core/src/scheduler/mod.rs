//! Background refresh of upstream data into the cache.
//!
//! Jobs are registered with an interval and a priority. On `start`, high
//! priority jobs run immediately, medium and low after short delays, and a
//! periodic tick executes any job whose interval has elapsed. Failed fetches
//! are retried with linear backoff up to the job's retry budget.

mod job;
mod refresh;

use thiserror::Error;

pub use job::{
    ExecutionTrigger, FetchFn, FetchFuture, JobDefinition, JobOutcome, JobStatus, PREFETCH_PREFIX,
    Priority,
};
pub use refresh::{RefreshScheduler, SchedulerConfig};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already registered: {0}")]
    DuplicateJob(String),

    #[error("Invalid job definition: {0}")]
    InvalidJob(String),
}
