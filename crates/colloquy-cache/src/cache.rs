//! LRU cache with TTL expiry.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::ttl::TtlTracker;

struct CacheInner<V> {
    lru: LruCache<String, V>,
    ttl: TtlTracker,
}

/// A cloneable, shared cache with LRU eviction and optional TTL.
///
/// Clones share the same storage. Expired entries are dropped lazily on
/// access or eagerly via [`TtlCache::cleanup_expired`].
pub struct TtlCache<V> {
    name: &'static str,
    inner: Arc<RwLock<CacheInner<V>>>,
    config: CacheConfig,
}

impl<V: Clone + Send + Sync> TtlCache<V> {
    /// Create a new cache.
    pub fn new(config: CacheConfig) -> Self {
        Self::named("cache", config)
    }

    /// Create a new cache with a name used in log output.
    pub fn named(name: &'static str, config: CacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);

        let inner = CacheInner {
            lru: LruCache::new(cap),
            ttl: TtlTracker::new(config.ttl),
        };

        Self {
            name,
            inner: Arc::new(RwLock::new(inner)),
            config,
        }
    }

    /// Get the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current number of stored entries, including not-yet-collected expired ones.
    pub async fn len(&self) -> usize {
        self.inner.read().await.lru.len()
    }

    /// Check if the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.lru.is_empty()
    }

    /// Look up a live entry, marking it recently used.
    pub async fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.write().await;

        if inner.ttl.is_expired(key) {
            if inner.lru.pop(key).is_some() {
                debug!(cache = self.name, key = %key, "Entry expired");
            }
            inner.ttl.remove(key);
            return None;
        }

        let value = inner.lru.get(key).cloned();
        trace!(cache = self.name, key = %key, hit = value.is_some(), "Cache lookup");
        value
    }

    /// Insert or replace an entry, resetting its TTL.
    pub async fn insert(&self, key: &str, value: V) {
        let mut inner = self.inner.write().await;

        if !inner.lru.contains(key) && inner.lru.len() >= self.config.max_entries.max(1) {
            if let Some((evicted, _)) = inner.lru.pop_lru() {
                debug!(cache = self.name, key = %evicted, "Evicting LRU entry");
                inner.ttl.remove(&evicted);
            }
        }

        inner.lru.put(key.to_string(), value);
        inner.ttl.touch(key);

        trace!(
            cache = self.name,
            key = %key,
            size = inner.lru.len(),
            "Entry inserted"
        );
    }

    /// Return the live entry for `key`, or build and store one.
    ///
    /// The loader runs without holding the lock, so two concurrent misses
    /// may both load; the later insert wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        debug!(cache = self.name, key = %key, "Cache miss, loading");
        let value = load().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }

    /// Check whether a live entry exists, without touching LRU order.
    pub async fn contains(&self, key: &str) -> bool {
        let inner = self.inner.read().await;
        inner.lru.contains(key) && !inner.ttl.is_expired(key)
    }

    /// Remove an entry.
    pub async fn invalidate(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.write().await;
        inner.ttl.remove(key);
        let removed = inner.lru.pop(key);
        if removed.is_some() {
            debug!(cache = self.name, key = %key, "Entry invalidated");
        }
        removed
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.lru.clear();
        inner.ttl = TtlTracker::new(self.config.ttl);
    }

    /// Remove all expired entries, returning how many were dropped.
    pub async fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let expired = inner.ttl.drain_expired();
        let mut count = 0;
        for key in expired {
            if inner.lru.pop(&key).is_some() {
                count += 1;
            }
        }

        if count > 0 {
            debug!(cache = self.name, count, "Cleaned up expired entries");
        }

        count
    }

    /// Cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        CacheStats {
            size: inner.lru.len(),
            capacity: self.config.max_entries,
            ttl_tracked: inner.ttl.len(),
        }
    }
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: Arc::clone(&self.inner),
            config: self.config.clone(),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Current number of stored entries.
    pub size: usize,

    /// Maximum capacity.
    pub capacity: usize,

    /// Number of keys tracked for TTL.
    pub ttl_tracked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_insert_and_get() {
        let cache = TtlCache::new(CacheConfig::new());
        cache.insert("a", 1u32).await;

        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = TtlCache::new(CacheConfig::new().with_max_entries(3));
        for i in 1..=3 {
            cache.insert(&format!("k{}", i), i).await;
        }

        // Touch k1 so k2 becomes least recently used
        let _ = cache.get("k1").await;
        cache.insert("k4", 4).await;

        assert_eq!(cache.len().await, 3);
        assert!(cache.contains("k1").await);
        assert!(!cache.contains("k2").await);
        assert!(cache.contains("k3").await);
        assert!(cache.contains("k4").await);
    }

    #[tokio::test]
    async fn test_replace_does_not_evict() {
        let cache = TtlCache::new(CacheConfig::new().with_max_entries(2));
        cache.insert("a", 1).await;
        cache.insert("b", 2).await;
        cache.insert("a", 10).await;

        assert_eq!(cache.get("a").await, Some(10));
        assert_eq!(cache.get("b").await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiration() {
        let cache = TtlCache::new(CacheConfig::new().with_ttl(Duration::from_secs(300)));
        cache.insert("a", "v".to_string()).await;

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.contains("a").await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.contains("a").await);
        assert_eq!(cache.get("a").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_try_insert_with_loads_once() {
        let cache = TtlCache::new(CacheConfig::new().with_ttl(Duration::from_secs(60)));
        let counter = AtomicUsize::new(0);
        let loads = &counter;

        for _ in 0..3 {
            let value: Result<u32, String> = cache
                .get_or_try_insert_with("k", || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(value, Ok(7));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // After expiry the loader runs again
        tokio::time::advance(Duration::from_secs(61)).await;
        let _: Result<u32, String> = cache
            .get_or_try_insert_with("k", || async move {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(8)
            })
            .await;
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_get_or_try_insert_with_error_not_cached() {
        let cache: TtlCache<u32> = TtlCache::new(CacheConfig::new());
        let result: Result<u32, &str> = cache
            .get_or_try_insert_with("k", || async { Err("boom") })
            .await;

        assert_eq!(result, Err("boom"));
        assert!(!cache.contains("k").await);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = TtlCache::new(CacheConfig::new());
        cache.insert("a", 1).await;
        cache.insert("b", 2).await;

        assert_eq!(cache.invalidate("a").await, Some(1));
        assert!(!cache.contains("a").await);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let cache = TtlCache::new(CacheConfig::new().with_ttl(Duration::from_secs(10)));
        for i in 1..=3 {
            cache.insert(&format!("k{}", i), i).await;
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        cache.insert("fresh", 0).await;

        assert_eq!(cache.cleanup_expired().await, 3);
        let stats = cache.stats().await;
        assert_eq!(stats.size, 1);
        assert_eq!(stats.ttl_tracked, 1);
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let cache = TtlCache::new(CacheConfig::new());
        let other = cache.clone();
        cache.insert("a", 1).await;

        assert_eq!(other.get("a").await, Some(1));
    }
}
