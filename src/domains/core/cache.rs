//! Injected TTL caches.
//!
//! Components receive an `Arc<dyn LookupCache<V>>` instead of holding
//! process-wide statics, so every instance (and every test) gets its own
//! cache scope.

use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;

#[async_trait]
pub trait LookupCache<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V>;

    async fn insert(&self, key: String, value: V);

    async fn invalidate(&self, key: &str);

    fn invalidate_all(&self);
}

/// `LookupCache` backed by a moka future cache with time-based expiration.
#[derive(Clone)]
pub struct MokaLookupCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    inner: Cache<String, V>,
}

impl<V> MokaLookupCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn with_ttl(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }
}

#[async_trait]
impl<V> LookupCache<V> for MokaLookupCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        self.inner.get(key).await
    }

    async fn insert(&self, key: String, value: V) {
        self.inner.insert(key, value).await;
    }

    async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }
}

/// Cache that never stores anything; handy when deterministic reads matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl<V> LookupCache<V> for NoopCache
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, _key: &str) -> Option<V> {
        None
    }

    async fn insert(&self, _key: String, _value: V) {}

    async fn invalidate(&self, _key: &str) {}

    fn invalidate_all(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_moka_cache_roundtrip_and_invalidate() {
        let cache: MokaLookupCache<i64> = MokaLookupCache::with_ttl(100, Duration::from_secs(60));
        cache.insert("2024/05/a.jpg".to_string(), 42).await;
        assert_eq!(cache.get("2024/05/a.jpg").await, Some(42));

        cache.invalidate("2024/05/a.jpg").await;
        assert_eq!(cache.get("2024/05/a.jpg").await, None);
    }

    #[tokio::test]
    async fn test_noop_cache_never_hits() {
        let cache = NoopCache;
        LookupCache::<i64>::insert(&cache, "k".to_string(), 1).await;
        assert_eq!(LookupCache::<i64>::get(&cache, "k").await, None);
    }
}
