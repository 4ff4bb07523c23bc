//! In-process cache tier: a bounded `DashMap` with age-based eviction.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::time::Instant;

use super::entry::CacheEntry;

/// Fraction of entries removed when the budget is exceeded (1/4 = oldest 25%).
const EVICTION_DIVISOR: usize = 4;

/// Bounded local map.
///
/// The map is bounded both by entry count and by an approximate byte budget.
/// Exceeding either removes the oldest quarter of entries by write time.
pub struct LocalStore {
    entries: DashMap<String, CacheEntry>,
    bytes: AtomicUsize,
    max_entries: usize,
    max_bytes: usize,
}

impl LocalStore {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            bytes: AtomicUsize::new(0),
            max_entries,
            max_bytes,
        }
    }

    /// Return the live value under `key`, dropping it if it has expired.
    ///
    /// The second element reports whether an expired entry was removed.
    pub fn get(&self, key: &str, now: Instant) -> (Option<Arc<Vec<u8>>>, bool) {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired_at(now) {
                return (Some(Arc::clone(&entry.data)), false);
            }
        }

        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.is_expired_at(now))
            .map(|(k, entry)| self.release(&k, &entry))
            .is_some();
        (None, removed)
    }

    /// Insert an entry, then enforce the budget.
    ///
    /// Returns the number of entries evicted to get back under budget.
    pub fn insert(&self, key: String, entry: CacheEntry) -> usize {
        self.bytes.fetch_add(entry.weight(&key), Ordering::Relaxed);
        if let Some(old) = self.entries.insert(key.clone(), entry) {
            self.release(&key, &old);
        }

        if self.over_budget() {
            self.evict_oldest()
        } else {
            0
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((k, entry)) => {
                self.release(&k, &entry);
                true
            }
            None => false,
        }
    }

    /// Remove every entry carrying `tag`, returning the removed keys.
    pub fn remove_tagged(&self, tag: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|key, entry| {
            if entry.has_tag(tag) {
                self.bytes.fetch_sub(entry.weight(key), Ordering::Relaxed);
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove every entry expired at `now`.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut purged = 0;
        self.entries.retain(|key, entry| {
            if entry.is_expired_at(now) {
                self.bytes.fetch_sub(entry.weight(key), Ordering::Relaxed);
                purged += 1;
                false
            } else {
                true
            }
        });
        purged
    }

    /// Remove the oldest quarter of entries (at least one) by write time.
    pub fn evict_oldest(&self) -> usize {
        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().created_at))
            .collect();
        if by_age.is_empty() {
            return 0;
        }

        by_age.sort_by_key(|(_, created_at)| *created_at);
        let target = by_age.len().div_ceil(EVICTION_DIVISOR).max(1);

        let evicted = by_age
            .into_iter()
            .take(target)
            .filter(|(key, _)| self.remove(key))
            .count();

        tracing::debug!(
            evicted,
            remaining = self.entries.len(),
            bytes = self.bytes(),
            "local cache evicted oldest entries"
        );
        evicted
    }

    pub fn over_budget(&self) -> bool {
        self.entries.len() > self.max_entries || self.bytes() > self.max_bytes
    }

    #[cfg(test)]
    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate bytes held by live and not-yet-purged entries.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    fn release(&self, key: &str, entry: &CacheEntry) {
        self.bytes.fetch_sub(entry.weight(key), Ordering::Relaxed);
    }
}
