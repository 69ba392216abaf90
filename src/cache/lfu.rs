use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;

use super::lock::mutex_lock;
use super::{Cache, CacheClass, CacheError, effective_ttl};

const BACKEND: &str = "lfu";

struct LfuEntry<T> {
    value: T,
    hits: u64,
    tick: u64,
    expires_at: Option<Instant>,
}

impl<T> LfuEntry<T> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }

    fn rank(&self, key: &str) -> (u64, u64, String) {
        (self.hits, self.tick, key.to_string())
    }
}

struct LfuState<T> {
    entries: HashMap<String, LfuEntry<T>>,
    /// `(hits, tick, key)`; the first element is the eviction victim.
    ranking: BTreeSet<(u64, u64, String)>,
    clock: u64,
}

impl<T> LfuState<T> {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str) -> Option<LfuEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.ranking.remove(&entry.rank(key));
        Some(entry)
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.ranking.remove(&entry.rank(key));
            entry.hits += 1;
            entry.tick = tick;
            self.ranking.insert(entry.rank(key));
        }
    }

    fn evict_one(&mut self, now: Instant) -> bool {
        let expired = self
            .entries
            .iter()
            .find(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone());
        let victim = expired.or_else(|| self.ranking.first().map(|(_, _, key)| key.clone()));
        match victim {
            Some(key) => self.remove(&key).is_some(),
            None => false,
        }
    }
}

/// Capacity-bounded least-frequently-used cache with per-entry expiry.
///
/// Ties on hit count are broken by least recent use. `peek` and `exists` do
/// not count as hits.
pub struct LfuCache<T> {
    state: Mutex<LfuState<T>>,
    capacity: NonZeroUsize,
    default_ttl: Option<Duration>,
}

impl<T> LfuCache<T> {
    pub fn new(capacity: NonZeroUsize, default_ttl: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(LfuState {
                entries: HashMap::new(),
                ranking: BTreeSet::new(),
                clock: 0,
            }),
            capacity,
            default_ttl: default_ttl.filter(|ttl| !ttl.is_zero()),
        }
    }
}

#[async_trait]
impl<T> Cache<T> for LfuCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn class(&self) -> CacheClass {
        CacheClass::PerEntryExpiration
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires_at = effective_ttl(ttl, self.default_ttl).map(|ttl| now + ttl);
        let mut state = mutex_lock(&self.state, BACKEND, "set");

        let hits = match state.remove(key) {
            Some(previous) => previous.hits + 1,
            None => {
                while state.entries.len() >= self.capacity.get() && state.evict_one(now) {
                    counter!("trellis_cache_evict_total", "backend" => BACKEND).increment(1);
                }
                1
            }
        };
        let tick = state.next_tick();
        let entry = LfuEntry {
            value,
            hits,
            tick,
            expires_at,
        };
        state.ranking.insert(entry.rank(key));
        state.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<T, CacheError> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, BACKEND, "get");
        let live = state
            .entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match live {
            Some(Some(value)) => {
                state.touch(key);
                Ok(value)
            }
            Some(None) => {
                state.remove(key);
                Err(CacheError::NotFound)
            }
            None => Err(CacheError::NotFound),
        }
    }

    async fn peek(&self, key: &str) -> Result<T, CacheError> {
        let now = Instant::now();
        mutex_lock(&self.state, BACKEND, "peek")
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
            .ok_or(CacheError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        mutex_lock(&self.state, BACKEND, "delete").remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        mutex_lock(&self.state, BACKEND, "exists")
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    async fn len(&self) -> i64 {
        mutex_lock(&self.state, BACKEND, "len").entries.len() as i64
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut state = mutex_lock(&self.state, BACKEND, "clear");
        state.entries.clear();
        state.ranking.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> LfuCache<u32> {
        LfuCache::new(NonZeroUsize::new(capacity).expect("non-zero"), None)
    }

    #[tokio::test]
    async fn least_frequently_used_entry_is_evicted() {
        let cache = cache(2);
        cache.set("hot", 1, None).await.expect("set hot");
        cache.set("cold", 2, None).await.expect("set cold");
        cache.get("hot").await.expect("hit");
        cache.get("hot").await.expect("hit");
        cache.set("new", 3, None).await.expect("set new");

        assert!(cache.exists("hot").await);
        assert!(!cache.exists("cold").await);
        assert!(cache.exists("new").await);
    }

    #[tokio::test]
    async fn peek_does_not_count_as_a_hit() {
        let cache = cache(2);
        cache.set("a", 1, None).await.expect("set a");
        cache.set("b", 2, None).await.expect("set b");
        for _ in 0..3 {
            cache.peek("a").await.expect("peek a");
        }
        cache.get("b").await.expect("hit b");
        cache.set("c", 3, None).await.expect("set c");

        assert!(!cache.exists("a").await, "peeks must not protect `a`");
        assert!(cache.exists("b").await);
    }

    #[tokio::test]
    async fn per_entry_ttl_is_honored() {
        let cache = cache(4);
        cache
            .set("k", 1, Some(Duration::from_millis(20)))
            .await
            .expect("set");
        assert_eq!(cache.peek("k").await.expect("live"), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.unwrap_err().is_not_found());
        assert_eq!(cache.len().await, 0);
    }
}
