use thiserror::Error;

use crate::broadcaster::BroadcastError;
use crate::cache::{CacheError, RemoteError};
use crate::scheduler::SchedulerError;

/// Error taxonomy shared by the cache, the scheduler and the broadcaster.
///
/// Component errors convert into one of three families:
/// transient upstream failures, capacity rejections and configuration errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Transient upstream failure: {0}")]
    TransientUpstreamFailure(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Refresh job not found: {0}")]
    JobNotFound(String),

    #[error("Connection not found: {0}")]
    NotConnected(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientUpstreamFailure(_))
    }

    /// Whether the error is a rejection of the caller rather than a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CapacityExceeded(_) | Self::Configuration(_))
    }
}

impl From<RemoteError> for CoreError {
    fn from(e: RemoteError) -> Self {
        Self::TransientUpstreamFailure(e.to_string())
    }
}

impl From<CacheError> for CoreError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Serialization(e) => Self::Serialization(e),
            CacheError::Factory(e) => Self::TransientUpstreamFailure(format!("{e:#}")),
        }
    }
}

impl From<SchedulerError> for CoreError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::JobNotFound(name) => Self::JobNotFound(name),
            SchedulerError::DuplicateJob(_) | SchedulerError::InvalidJob(_) => {
                Self::Configuration(e.to_string())
            }
        }
    }
}

impl From<BroadcastError> for CoreError {
    fn from(e: BroadcastError) -> Self {
        match e {
            BroadcastError::CapacityExceeded { .. } | BroadcastError::RateLimited { .. } => {
                Self::CapacityExceeded(e.to_string())
            }
            BroadcastError::InvalidTopic(_) | BroadcastError::InvalidMessage(_) => {
                Self::Configuration(e.to_string())
            }
            BroadcastError::NotConnected(id) => Self::NotConnected(id.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_broadcast_errors_map_to_taxonomy() {
        let err: CoreError = BroadcastError::CapacityExceeded { max: 10 }.into();
        assert!(matches!(err, CoreError::CapacityExceeded(_)));
        assert!(err.is_rejection());

        let err: CoreError = BroadcastError::RateLimited {
            retry_after: Duration::from_secs(3),
        }
        .into();
        assert!(matches!(err, CoreError::CapacityExceeded(_)));

        let err: CoreError = BroadcastError::InvalidTopic("empty topic".into()).into();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn test_scheduler_errors_map_to_taxonomy() {
        let err: CoreError = SchedulerError::JobNotFound("prices".into()).into();
        assert!(matches!(err, CoreError::JobNotFound(ref n) if n == "prices"));
        assert!(!err.is_transient());

        let err: CoreError = SchedulerError::DuplicateJob("prices".into()).into();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn test_remote_errors_are_transient() {
        let err: CoreError = RemoteError::Timeout(Duration::from_secs(2)).into();
        assert!(err.is_transient());
    }
}
