//! Real-time data distribution core.
//!
//! Data flows one way: the [`RefreshScheduler`] pulls from upstream sources
//! into the [`TieredCache`], and the [`Broadcaster`] pushes cached data to
//! subscribed connections. The broadcaster never calls upstream directly
//! except through the cache's read-through path.

pub mod broadcaster;
pub mod cache;
pub mod error;
pub mod events;
pub mod metrics;
pub mod scheduler;

pub use broadcaster::{
    BroadcastError, Broadcaster, BroadcasterConfig, BroadcasterMetrics, ClientMessage,
    ConnectionId, ConnectionMetadata, Delivery, DisconnectReason, ServerMessage, TopicSpec,
};
pub use cache::{CacheConfig, CacheError, CacheStats, RedisStore, RemoteError, RemoteStore, TieredCache};
pub use error::CoreError;
pub use events::{CoreEvent, EventBus};
pub use scheduler::{
    JobDefinition, JobOutcome, JobStatus, Priority, RefreshScheduler, SchedulerConfig,
    SchedulerError,
};
