//! Two-tier caching for frequently refreshed payloads.
//!
//! ## Architecture
//!
//! - **Remote tier (Redis)**: optional, shared across instances, consulted first
//! - **Local tier (DashMap)**: in-process, bounded by entry count and bytes
//! - **Tag index**: bulk invalidation of related keys in both tiers
//!
//! ## Cache Hierarchy
//!
//! ```text
//! get(key) → Remote (Redis) → Local (DashMap) → absent
//!                 ↓ error/timeout
//!            counted as degradation, falls through to Local
//! ```
//!
//! ## Graceful Degradation
//!
//! If Redis is unavailable or disabled, the cache runs local-only. Remote
//! failures never surface to callers.

pub mod entry;
pub mod local;
pub mod remote;
pub mod tiered;

pub use entry::CacheEntry;
pub use local::LocalStore;
pub use remote::{RedisStore, RemoteError, RemoteStore};
pub use tiered::{CacheConfig, CacheError, CacheStats, TieredCache};
