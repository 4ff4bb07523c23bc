//! Tiered cache: optional remote tier consulted first, bounded local map behind it.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};

use super::entry::CacheEntry;
use super::local::LocalStore;
use super::remote::{RemoteError, RemoteStore, ttl_millis};
use crate::events::{CoreEvent, EventBus};
use crate::metrics;

/// Prefix of the remote sets indexing keys by tag.
const TAG_KEY_PREFIX: &str = "tag:";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cached value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("value factory failed: {0}")]
    Factory(#[source] anyhow::Error),
}

/// Local tier limits and remote tier behaviour.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of local entries before eviction.
    pub max_entries: usize,
    /// Approximate byte budget of the local tier.
    pub max_bytes: usize,
    /// Period of the expired-entry sweep.
    pub sweep_interval: Duration,
    /// Upper bound for every remote tier call.
    pub remote_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            sweep_interval: Duration::from_secs(60),
            remote_timeout: Duration::from_secs(2),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub mode: &'static str,
    pub local_entries: usize,
    pub local_bytes: usize,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub remote_errors: u64,
    pub evictions: u64,
    pub expired: u64,
}

#[derive(Default)]
struct Counters {
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    remote_errors: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Key/value cache with per-entry TTL and tag invalidation.
///
/// ## Lookup Order
///
/// 1. Remote tier (when configured and reachable)
/// 2. Local bounded map
/// 3. Absent
///
/// Remote failures and timeouts are logged, counted and treated as misses;
/// they never fail the caller.
pub struct TieredCache {
    local: LocalStore,
    remote: Option<Arc<dyn RemoteStore>>,
    config: CacheConfig,
    counters: Counters,
    events: Option<EventBus>,
}

impl TieredCache {
    /// Create a local-only cache.
    pub fn new_local(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a cache backed by a shared remote tier.
    pub fn with_remote(config: CacheConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self::build(config, Some(remote))
    }

    fn build(config: CacheConfig, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        Self {
            local: LocalStore::new(config.max_entries, config.max_bytes),
            remote,
            config,
            counters: Counters::default(),
            events: None,
        }
    }

    /// Publish remote degradation events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a live value.
    ///
    /// Returns `Arc<Vec<u8>>` so hits never copy the payload.
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(remote) = &self.remote {
            if let Some(Some(data)) = self.remote_call("get", remote.get(key)).await {
                tracing::debug!(key = %key, "cache hit (remote)");
                bump(&self.counters.remote_hits, 1);
                metrics::record_cache_hit("remote");
                return Some(Arc::new(data));
            }
        }

        let (value, expired) = self.local.get(key, Instant::now());
        if expired {
            bump(&self.counters.expired, 1);
        }
        match value {
            Some(data) => {
                tracing::debug!(key = %key, "cache hit (local)");
                bump(&self.counters.local_hits, 1);
                metrics::record_cache_hit("local");
                Some(data)
            }
            None => {
                tracing::debug!(key = %key, "cache miss");
                bump(&self.counters.misses, 1);
                metrics::record_cache_miss();
                None
            }
        }
    }

    /// Store a value with TTL and tags in both tiers.
    ///
    /// The local write always happens and may trigger eviction of the oldest
    /// local entries. The remote write is best-effort; when it fails, or the TTL
    /// is too short to express remotely, any older remote copy is deleted.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[&str]) {
        self.store(key, Arc::new(value), ttl, tags).await;
    }

    async fn store(&self, key: &str, data: Arc<Vec<u8>>, ttl: Duration, tags: &[&str]) {
        let tag_set: HashSet<String> = tags.iter().map(|t| t.to_string()).collect();
        let evicted = self.local.insert(
            key.to_string(),
            CacheEntry::new(Arc::clone(&data), ttl, tag_set),
        );
        if evicted > 0 {
            bump(&self.counters.evictions, evicted as u64);
            metrics::record_cache_evictions(evicted);
        }
        metrics::set_cache_entries(self.local.len());

        let Some(remote) = &self.remote else {
            tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set (local)");
            return;
        };

        // The remote tier is read first, so a copy it cannot replace must go.
        let written = ttl_millis(ttl).is_some()
            && self
                .remote_call("set", remote.set_with_ttl(key, &data, ttl))
                .await
                .is_some();
        if !written {
            self.remote_call("delete", remote.delete(key)).await;
            tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set (local, remote copy dropped)");
            return;
        }

        for tag in tags {
            let tag_key = format!("{TAG_KEY_PREFIX}{tag}");
            if self
                .remote_call("add_to_set", remote.add_to_set(&tag_key, key))
                .await
                .is_none()
            {
                return;
            }
            self.remote_call("extend_expiry", remote.extend_expiry(&tag_key, ttl))
                .await;
        }
        tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set (local+remote)");
    }

    /// Remove `key` from both tiers. Returns whether either tier held it.
    pub async fn delete(&self, key: &str) -> bool {
        let local = self.local.remove(key);
        let remote = match &self.remote {
            Some(remote) => self
                .remote_call("delete", remote.delete(key))
                .await
                .unwrap_or(false),
            None => false,
        };
        metrics::set_cache_entries(self.local.len());
        tracing::debug!(key = %key, removed = local || remote, "cache delete");
        local || remote
    }

    /// Remove every entry tagged `tag` from both tiers.
    ///
    /// Returns the number of distinct keys removed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut removed: BTreeSet<String> = self.local.remove_tagged(tag).into_iter().collect();

        if let Some(remote) = &self.remote {
            let tag_key = format!("{TAG_KEY_PREFIX}{tag}");
            if let Some(members) = self.remote_call("members", remote.members(&tag_key)).await {
                for key in members {
                    if let Some(true) = self.remote_call("delete", remote.delete(&key)).await {
                        removed.insert(key);
                    }
                }
                self.remote_call("delete", remote.delete(&tag_key)).await;
            }
        }

        metrics::set_cache_entries(self.local.len());
        tracing::debug!(tag = %tag, removed = removed.len(), "cache invalidated by tag");
        removed.len()
    }

    /// Read-through: return the cached value or compute, store and return it.
    ///
    /// Concurrent callers missing the same key each run their own factory;
    /// reads are not de-duplicated. A failing factory stores nothing.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        tags: &[&str],
        factory: F,
    ) -> Result<Arc<Vec<u8>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
    {
        if let Some(data) = self.get(key).await {
            return Ok(data);
        }

        let data = Arc::new(factory().await?);
        self.store(key, Arc::clone(&data), ttl, tags).await;
        Ok(data)
    }

    /// Get and deserialize a JSON value. Undecodable entries count as absent.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.get(key).await?;
        match serde_json::from_slice(&data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cached value is not valid JSON for the requested type");
                None
            }
        }
    }

    /// Serialize `value` as JSON and store it.
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        tags: &[&str],
    ) -> Result<(), CacheError> {
        let data = serde_json::to_vec(value)?;
        self.set(key, data, ttl, tags).await;
        Ok(())
    }

    /// JSON flavour of [`TieredCache::get_or_set`].
    pub async fn get_or_set_json<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        tags: &[&str],
        factory: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let data = self
            .get_or_set(key, ttl, tags, move || async move {
                let value = factory().await.map_err(CacheError::Factory)?;
                Ok::<_, CacheError>(serde_json::to_vec(&value)?)
            })
            .await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Remove expired local entries now.
    pub fn purge_expired(&self) -> usize {
        let purged = self.local.purge_expired(Instant::now());
        if purged > 0 {
            bump(&self.counters.expired, purged as u64);
            metrics::set_cache_entries(self.local.len());
        }
        purged
    }

    /// Start the periodic expired-entry sweep.
    ///
    /// Returns a shutdown sender; sending `true` (or dropping it) stops the sweep.
    pub fn start_sweeper(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cache = Arc::clone(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            tracing::info!(interval_secs = period.as_secs(), "Cache sweeper started");
            let mut ticker = interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "Swept expired cache entries");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("Cache sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            mode: self.mode(),
            local_entries: self.local.len(),
            local_bytes: self.local.bytes(),
            local_hits: c.local_hits.load(Ordering::Relaxed),
            remote_hits: c.remote_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            remote_errors: c.remote_errors.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
        }
    }

    pub fn mode(&self) -> &'static str {
        if self.remote.is_some() { "remote" } else { "local" }
    }

    /// Check if the remote tier answers (for health checks).
    pub async fn is_remote_available(&self) -> bool {
        match &self.remote {
            Some(remote) => self.remote_call("ping", remote.ping()).await.is_some(),
            None => false,
        }
    }

    /// Run a remote call under the configured timeout.
    ///
    /// `None` means the call failed or timed out; the failure has been recorded.
    async fn remote_call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Option<T> {
        let timeout = self.config.remote_timeout;
        let error = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => e,
            Err(_) => RemoteError::Timeout(timeout),
        };

        tracing::warn!(operation, error = %error, "remote cache tier degraded, using local tier");
        bump(&self.counters.remote_errors, 1);
        metrics::record_remote_error(operation);
        if let Some(events) = &self.events {
            events.publish(CoreEvent::RemoteDegraded {
                operation,
                error: error.to_string(),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TieredCache {
        TieredCache::new_local(CacheConfig::default())
    }

    #[tokio::test]
    async fn test_get_or_set_skips_factory_on_hit() {
        let cache = cache();
        cache.set("k", b"cached".to_vec(), Duration::from_secs(60), &[]).await;

        let value = cache
            .get_or_set("k", Duration::from_secs(60), &[], || async {
                Err::<Vec<u8>, &str>("factory must not run")
            })
            .await
            .unwrap();
        assert_eq!(value.as_slice(), b"cached");
    }

    #[tokio::test]
    async fn test_get_or_set_failure_stores_nothing() {
        let cache = cache();
        let result = cache
            .get_or_set("k", Duration::from_secs(60), &[], || async {
                Err::<Vec<u8>, &str>("upstream down")
            })
            .await;
        assert_eq!(result.unwrap_err(), "upstream down");
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let cache = cache();
        let value = serde_json::json!({"btc": 100});
        cache
            .set_json("prices", &value, Duration::from_secs(60), &[])
            .await
            .unwrap();
        let back: serde_json::Value = cache.get_json("prices").await.unwrap();
        assert_eq!(back, value);

        let computed: Vec<u32> = cache
            .get_or_set_json("list", Duration::from_secs(60), &[], || async {
                Ok(vec![1, 2, 3])
            })
            .await
            .unwrap();
        assert_eq!(computed, vec![1, 2, 3]);

        let mismatched: Option<Vec<u32>> = cache.get_json("prices").await;
        assert!(mismatched.is_none());
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let cache = cache();
        assert!(cache.get("missing").await.is_none());
        cache.set("k", b"v".to_vec(), Duration::from_secs(60), &[]).await;
        assert!(cache.get("k").await.is_some());

        let stats = cache.stats();
        assert_eq!(stats.mode, "local");
        assert_eq!(stats.local_entries, 1);
        assert_eq!(stats.local_hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.remote_errors, 0);
        assert!(!cache.is_remote_available().await);
    }
}
