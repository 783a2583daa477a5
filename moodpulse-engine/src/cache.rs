//! In-memory TTL response cache
//!
//! Entries expire lazily: an expired entry is evicted by the `get` that finds
//! it, or in bulk by [`ResponseCache::clear_expired`]. Prefix invalidation drops
//! every key that starts with the prefix, so stale aggregates are never served
//! after a consensus row changes.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Key of an entity's cached consensus
pub fn consensus_key(entity_id: &str) -> String {
    format!("consensus:{}", entity_id)
}

/// Prefix of every other cached response about an entity
pub fn entity_prefix(entity_id: &str) -> String {
    format!("entity:{}:", entity_id)
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Cache occupancy report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub expired: usize,
    pub hits: u64,
    pub misses: u64,
    pub oldest_age_secs: Option<u64>,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
}

/// TTL key/value cache with prefix invalidation
#[derive(Debug)]
pub struct ResponseCache<V = serde_json::Value> {
    default_ttl: Duration,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Value for `key` if present and younger than its TTL
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.entries.remove(key);
            inner.misses += 1;
            debug!(key = %key, "Cache entry expired");
            return None;
        }

        inner.hits += 1;
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Store `value`; `ttl` of None uses the cache default
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        self.lock().entries.insert(key.into(), entry);
    }

    /// Remove exactly `key`
    pub fn remove(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Remove every key starting with `prefix`; returns how many were removed
    pub fn invalidate(&self, prefix: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(prefix = %prefix, removed, "Cache invalidated");
        }
        removed
    }

    /// Evict every expired entry; returns how many were evicted
    pub fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            expired: inner.entries.values().filter(|e| e.is_expired(now)).count(),
            hits: inner.hits,
            misses: inner.misses,
            oldest_age_secs: inner
                .entries
                .values()
                .map(|e| now.duration_since(e.inserted_at).as_secs())
                .max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_get_within_ttl() {
        let cache: ResponseCache<String> = ResponseCache::new(Duration::from_secs(30));
        cache.set("consensus:Chile", "joy".to_string(), None);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cache.get("consensus:Chile").as_deref(), Some("joy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_after_ttl_misses_and_evicts() {
        let cache: ResponseCache<u32> = ResponseCache::new(Duration::from_secs(300));
        cache.set("consensus:Chile", 7, Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("consensus:Chile"), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_invalidate_removes_all_and_only_matching_keys() {
        let cache: ResponseCache<u32> = ResponseCache::new(Duration::from_secs(60));
        cache.set(consensus_key("Chile"), 1, None);
        cache.set(format!("{}trend", entity_prefix("Chile")), 2, None);
        cache.set(format!("{}posts", entity_prefix("Chile")), 3, None);
        cache.set(consensus_key("China"), 4, None);
        cache.set(format!("{}trend", entity_prefix("China")), 5, None);

        assert_eq!(cache.invalidate(&entity_prefix("Chile")), 2);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&consensus_key("Chile")), Some(1));
        assert_eq!(cache.get(&format!("{}trend", entity_prefix("China"))), Some(5));

        assert_eq!(cache.invalidate("consensus:"), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_expired_and_stats() {
        let cache: ResponseCache<u32> = ResponseCache::new(Duration::from_secs(60));
        cache.set("a", 1, Some(Duration::from_secs(5)));
        cache.set("b", 2, Some(Duration::from_secs(120)));
        tokio::time::advance(Duration::from_secs(6)).await;

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.oldest_age_secs, Some(6));

        assert_eq!(cache.clear_expired(), 1);
        assert_eq!(cache.get("b"), Some(2));
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let cache: ResponseCache<u32> = ResponseCache::new(Duration::from_secs(60));
        cache.set("k", 1, None);
        cache.set("k", 2, None);
        assert_eq!(cache.get("k"), Some(2));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_exact() {
        let cache: ResponseCache<u32> = ResponseCache::new(Duration::from_secs(60));
        cache.set(consensus_key("UK"), 1, None);
        cache.set(consensus_key("UKR"), 2, None);

        assert!(cache.remove(&consensus_key("UK")));
        assert!(!cache.remove(&consensus_key("UK")));
        assert_eq!(cache.get(&consensus_key("UKR")), Some(2));
    }
}
