//! Subscription broadcaster: long-lived client connections grouped by topic.
//!
//! Transports (see `quoteflow-server::ws`) own the socket. The broadcaster
//! hands each connection an outbound `mpsc` channel of [`Delivery`] items and
//! is fed inbound text through [`Broadcaster::handle_message`].

mod connection;
mod hub;
mod messages;
mod rate_limit;
mod topic;

use std::time::Duration;

use thiserror::Error;

pub use connection::{ConnectionId, ConnectionMetadata, DisconnectReason};
pub use hub::{Broadcaster, BroadcasterConfig, BroadcasterMetrics, TOPIC_PREFIX, TopicFetcher};
pub use messages::{ClientMessage, Delivery, ServerMessage, now_millis};
pub use rate_limit::RateWindow;
pub use topic::{MAX_SYMBOLS, TopicSpec};

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("connection limit reached ({max})")]
    CapacityExceeded { max: usize },

    #[error("rate limit exceeded, retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("connection not found: {0}")]
    NotConnected(ConnectionId),
}
