use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache as Lru;
use metrics::counter;

use super::lock::mutex_lock;
use super::{Cache, CacheClass, CacheError};

const BACKEND: &str = "expiring_lru";

struct Stamped<T> {
    value: T,
    stored_at: Instant,
}

/// LRU cache whose entries all share one time-to-live fixed at construction.
///
/// Per-call TTL arguments are ignored. Expired entries are dropped lazily on
/// access and count towards capacity until then.
pub struct ExpiringLruCache<T> {
    entries: Mutex<Lru<String, Stamped<T>>>,
    ttl: Duration,
}

impl<T> ExpiringLruCache<T> {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(Lru::new(capacity)),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_live(&self, stamped: &Stamped<T>) -> bool {
        stamped.stored_at.elapsed() < self.ttl
    }
}

#[async_trait]
impl<T> Cache<T> for ExpiringLruCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn class(&self) -> CacheClass {
        CacheClass::GlobalExpiration
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn set(&self, key: &str, value: T, _ttl: Option<Duration>) -> Result<(), CacheError> {
        let stamped = Stamped {
            value,
            stored_at: Instant::now(),
        };
        let mut entries = mutex_lock(&self.entries, BACKEND, "set");
        if let Some((evicted, _)) = entries.push(key.to_string(), stamped)
            && evicted != key
        {
            counter!("trellis_cache_evict_total", "backend" => BACKEND).increment(1);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<T, CacheError> {
        let mut entries = mutex_lock(&self.entries, BACKEND, "get");
        let expired = match entries.get(key) {
            Some(stamped) if self.is_live(stamped) => return Ok(stamped.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Err(CacheError::NotFound)
    }

    async fn peek(&self, key: &str) -> Result<T, CacheError> {
        let entries = mutex_lock(&self.entries, BACKEND, "peek");
        entries
            .peek(key)
            .filter(|stamped| self.is_live(stamped))
            .map(|stamped| stamped.value.clone())
            .ok_or(CacheError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        mutex_lock(&self.entries, BACKEND, "delete").pop(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        mutex_lock(&self.entries, BACKEND, "exists")
            .peek(key)
            .is_some_and(|stamped| self.is_live(stamped))
    }

    async fn len(&self) -> i64 {
        let entries = mutex_lock(&self.entries, BACKEND, "len");
        entries.iter().filter(|(_, stamped)| self.is_live(stamped)).count() as i64
    }

    async fn clear(&self) -> Result<(), CacheError> {
        mutex_lock(&self.entries, BACKEND, "clear").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero capacity")
    }

    #[tokio::test]
    async fn entries_expire_after_the_global_ttl() {
        let cache = ExpiringLruCache::new(capacity(4), Duration::from_millis(20));
        cache.set("k", 1_u8, None).await.expect("set");
        assert!(cache.exists("k").await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!cache.exists("k").await);
        assert!(cache.get("k").await.unwrap_err().is_not_found());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn per_call_ttl_cannot_extend_the_global_ttl() {
        let cache = ExpiringLruCache::new(capacity(4), Duration::from_millis(20));
        cache
            .set("k", 1_u8, Some(Duration::from_secs(3600)))
            .await
            .expect("set");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.peek("k").await.unwrap_err().is_not_found());
    }
}
