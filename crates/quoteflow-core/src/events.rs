//! Event bus for observing the distribution core.
//!
//! Components publish `CoreEvent`s on a tokio broadcast channel instead of
//! invoking listeners directly. Observers (logging, alerting) subscribe and
//! consume at their own pace; slow observers lose the oldest events.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::broadcaster::{ConnectionId, DisconnectReason};

/// Default buffer size for the broadcast channel.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Something observable happened inside the core.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A refresh job wrote fresh data into the cache.
    JobSucceeded {
        job: String,
        duration: Duration,
        bytes: usize,
    },
    /// A refresh job's fetch failed. `retry_count` is the value after the failure.
    JobFailed {
        job: String,
        error: String,
        retry_count: u32,
    },
    /// A retry was scheduled for a failed job.
    RetryScheduled {
        job: String,
        attempt: u32,
        delay: Duration,
    },
    /// The remote cache tier failed or timed out; the local tier was used.
    RemoteDegraded {
        operation: &'static str,
        error: String,
    },
    ConnectionAccepted {
        connection_id: ConnectionId,
        origin: Option<String>,
    },
    /// A connection attempt was refused because the server is full.
    ConnectionRejected { max_connections: usize },
    ConnectionClosed {
        connection_id: ConnectionId,
        reason: DisconnectReason,
    },
    /// A control message was dropped by the per-connection rate limiter.
    RateLimited { connection_id: ConnectionId },
}

/// Cloneable handle to the core event channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Create a new bus with default buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a new bus with custom buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event.
    ///
    /// Returns the number of observers that will see it; 0 when nobody listens.
    pub fn publish(&self, event: CoreEvent) -> usize {
        self.sender.send(event).unwrap_or_default()
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active observers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
