use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Cache, CacheClass, CacheError};

/// Unbounded concurrent map sharded by key hash. TTL arguments are ignored.
pub struct ShardedMapCache<T> {
    entries: DashMap<String, T>,
}

impl<T> ShardedMapCache<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> Default for ShardedMapCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Cache<T> for ShardedMapCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn class(&self) -> CacheClass {
        CacheClass::NoExpiration
    }

    fn backend(&self) -> &'static str {
        "sharded_map"
    }

    async fn set(&self, key: &str, value: T, _ttl: Option<Duration>) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<T, CacheError> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or(CacheError::NotFound)
    }

    async fn peek(&self, key: &str) -> Result<T, CacheError> {
        self.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    async fn len(&self) -> i64 {
        self.entries.len() as i64
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }
}
