//! Shared test doubles.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quoteflow_core::cache::{CacheConfig, RemoteError, RemoteStore, TieredCache};
use tokio::time::Instant;

/// In-memory remote store whose availability can be toggled.
#[derive(Default)]
pub struct FakeRemote {
    values: Mutex<HashMap<String, (Vec<u8>, Instant, Duration)>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    /// Expiry deadlines of sets; a set without one never expires.
    set_deadlines: Mutex<HashMap<String, Instant>>,
    failing: AtomicBool,
    failing_writes: AtomicBool,
    hang: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail only `set_with_ttl`, leaving reads and deletes working.
    pub fn set_failing_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    /// Make every call hang until the cache's remote timeout fires.
    pub fn set_hanging(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    pub fn set_members(&self, key: &str) -> HashSet<String> {
        self.drop_expired_set(key);
        self.sets.lock().get(key).cloned().unwrap_or_default()
    }

    /// Time left before the set at `key` expires, if it has a deadline.
    pub fn set_ttl(&self, key: &str) -> Option<Duration> {
        self.set_deadlines
            .lock()
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn drop_expired_set(&self, key: &str) {
        let mut deadlines = self.set_deadlines.lock();
        if deadlines.get(key).is_some_and(|deadline| Instant::now() >= *deadline) {
            deadlines.remove(key);
            self.sets.lock().remove(key);
        }
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.enter().await?;
        let mut values = self.values.lock();
        match values.get(key) {
            Some((_, written, ttl)) if written.elapsed() > *ttl => {
                values.remove(key);
                Ok(None)
            }
            Some((data, _, _)) => Ok(Some(data.clone())),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), RemoteError> {
        self.enter().await?;
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("READONLY replica".into()));
        }
        self.values
            .lock()
            .insert(key.to_string(), (value.to_vec(), Instant::now(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        self.enter().await?;
        let removed_value = self.values.lock().remove(key).is_some();
        self.drop_expired_set(key);
        self.set_deadlines.lock().remove(key);
        let removed_set = self.sets.lock().remove(key).is_some();
        Ok(removed_value || removed_set)
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<(), RemoteError> {
        self.enter().await?;
        self.drop_expired_set(set_key);
        self.sets
            .lock()
            .entry(set_key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>, RemoteError> {
        self.enter().await?;
        self.drop_expired_set(set_key);
        Ok(self
            .sets
            .lock()
            .get(set_key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn extend_expiry(&self, key: &str, ttl: Duration) -> Result<(), RemoteError> {
        self.enter().await?;
        self.drop_expired_set(key);
        if !self.sets.lock().contains_key(key) {
            return Ok(());
        }
        let deadline = Instant::now() + ttl;
        self.set_deadlines
            .lock()
            .entry(key.to_string())
            .and_modify(|current| *current = (*current).max(deadline))
            .or_insert(deadline);
        Ok(())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.enter().await
    }
}

pub fn local_cache() -> Arc<TieredCache> {
    Arc::new(TieredCache::new_local(CacheConfig::default()))
}

pub fn remote_cache(remote: Arc<FakeRemote>) -> Arc<TieredCache> {
    Arc::new(TieredCache::with_remote(CacheConfig::default(), remote))
}
