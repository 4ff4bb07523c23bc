use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// A cached entry with TTL and tag support.
///
/// The data is wrapped in `Arc` so hits hand out cheap clones instead of
/// copying the payload.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub data: Arc<Vec<u8>>,
    pub created_at: Instant,
    pub ttl: Duration,
    pub tags: HashSet<String>,
}

impl CacheEntry {
    /// Create a new cached entry written now.
    pub fn new(data: Arc<Vec<u8>>, ttl: Duration, tags: HashSet<String>) -> Self {
        Self {
            data,
            created_at: Instant::now(),
            ttl,
            tags,
        }
    }

    /// Check if this entry is expired at `now`. Live while `now - created_at <= ttl`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Approximate heap footprint of the entry stored under `key`.
    pub fn weight(&self, key: &str) -> usize {
        key.len() + self.data.len() + self.tags.iter().map(String::len).sum::<usize>()
    }
}
