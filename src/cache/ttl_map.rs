use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Cache, CacheClass, CacheError, effective_ttl};

const BACKEND: &str = "ttl_map";

struct TtlEntry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> TtlEntry<T> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Concurrent map honoring a TTL per entry.
///
/// Expired entries are invisible immediately and physically removed either
/// on access or by the optional background sweeper.
pub struct TtlMapCache<T> {
    entries: Arc<DashMap<String, TtlEntry<T>>>,
    default_ttl: Option<Duration>,
    sweeper: Option<JoinHandle<()>>,
}

impl<T> TtlMapCache<T>
where
    T: Send + Sync + 'static,
{
    /// `default_ttl` applies when `set` receives no TTL; `None` keeps such
    /// entries forever.
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            default_ttl: default_ttl.filter(|ttl| !ttl.is_zero()),
            sweeper: None,
        }
    }

    /// Spawn a sweeper on the current tokio runtime. Outside a runtime the
    /// cache keeps working with lazy expiry only.
    pub fn with_sweeper(mut self, interval: Duration) -> Self {
        if interval.is_zero() {
            return self;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let entries = Arc::downgrade(&self.entries);
            self.sweeper = Some(handle.spawn(sweep_loop(entries, interval)));
        }
        self
    }
}

async fn sweep_loop<T>(entries: Weak<DashMap<String, TtlEntry<T>>>, interval: Duration)
where
    T: Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(entries) = entries.upgrade() else {
            break;
        };
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(entries.len());
        if removed > 0 {
            counter!("trellis_cache_evict_total", "backend" => BACKEND).increment(removed as u64);
            debug!(target = "trellis::cache", removed, "swept expired cache entries");
        }
    }
}

impl<T> Drop for TtlMapCache<T> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[async_trait]
impl<T> Cache<T> for TtlMapCache<T>
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
        let expires_at = effective_ttl(ttl, self.default_ttl).map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), TtlEntry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<T, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key)
            && entry.is_live(now)
        {
            return Ok(entry.value.clone());
        }
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        Err(CacheError::NotFound)
    }

    async fn peek(&self, key: &str) -> Result<T, CacheError> {
        self.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    async fn len(&self) -> i64 {
        self.entries.len() as i64
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }
}
