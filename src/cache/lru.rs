use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache as Lru;
use metrics::counter;

use super::lock::mutex_lock;
use super::{Cache, CacheClass, CacheError};

const BACKEND: &str = "lru";

/// Capacity-bounded least-recently-used cache. TTL arguments are ignored.
///
/// `get` promotes the entry; `peek` and `exists` leave recency untouched.
pub struct LruCache<T> {
    entries: Mutex<Lru<String, T>>,
}

impl<T> LruCache<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(Lru::new(capacity)),
        }
    }
}

#[async_trait]
impl<T> Cache<T> for LruCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn class(&self) -> CacheClass {
        CacheClass::NoExpiration
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn set(&self, key: &str, value: T, _ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut entries = mutex_lock(&self.entries, BACKEND, "set");
        if let Some((evicted, _)) = entries.push(key.to_string(), value)
            && evicted != key
        {
            counter!("trellis_cache_evict_total", "backend" => BACKEND).increment(1);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<T, CacheError> {
        mutex_lock(&self.entries, BACKEND, "get")
            .get(key)
            .cloned()
            .ok_or(CacheError::NotFound)
    }

    async fn peek(&self, key: &str) -> Result<T, CacheError> {
        mutex_lock(&self.entries, BACKEND, "peek")
            .peek(key)
            .cloned()
            .ok_or(CacheError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        mutex_lock(&self.entries, BACKEND, "delete").pop(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        mutex_lock(&self.entries, BACKEND, "exists").contains(key)
    }

    async fn len(&self) -> i64 {
        mutex_lock(&self.entries, BACKEND, "len").len() as i64
    }

    async fn clear(&self) -> Result<(), CacheError> {
        mutex_lock(&self.entries, BACKEND, "clear").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> LruCache<&'static str> {
        LruCache::new(NonZeroUsize::new(capacity).expect("non-zero capacity"))
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let cache = cache(2);
        cache.set("a", "A", None).await.expect("set a");
        cache.set("b", "B", None).await.expect("set b");
        cache.get("a").await.expect("touch a");
        cache.set("c", "C", None).await.expect("set c");

        assert!(cache.exists("a").await);
        assert!(!cache.exists("b").await);
        assert!(cache.exists("c").await);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn peek_does_not_promote() {
        let cache = cache(2);
        cache.set("a", "A", None).await.expect("set a");
        cache.set("b", "B", None).await.expect("set b");
        assert_eq!(cache.peek("a").await.expect("peek a"), "A");
        cache.set("c", "C", None).await.expect("set c");

        assert!(cache.get("a").await.unwrap_err().is_not_found());
        assert_eq!(cache.get("b").await.expect("b kept"), "B");
    }

    #[tokio::test]
    async fn overwriting_a_key_keeps_a_single_entry() {
        let cache = cache(1);
        cache.set("a", "first", None).await.expect("set");
        cache.set("a", "second", None).await.expect("overwrite");
        assert_eq!(cache.get("a").await.expect("get"), "second");
        assert_eq!(cache.len().await, 1);
    }
}
