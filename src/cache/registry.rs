//! Per-type cache instances.
//!
//! Each cached type `T` owns exactly one logical store, keyed by its
//! `TypeId` and labelled with its fully qualified type name. The first
//! caller to request a type constructs the store; concurrent callers observe
//! the same instance.

use std::any::{Any, TypeId, type_name};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::config::{CacheBackend, CacheConfig};
use super::keys::{ListKeyTracker, TableGenerations};
use super::{
    ByteStoreCache, Cache, CacheError, Cacheable, ExpiringLruCache, LfuCache, LruCache,
    ShardedMapCache, Traced, TtlMapCache,
};

type Instance = Arc<dyn Any + Send + Sync>;

pub struct CacheRegistry {
    config: CacheConfig,
    instances: DashMap<TypeId, Instance>,
    list_keys: ListKeyTracker,
    generations: TableGenerations,
    #[cfg(feature = "redis")]
    redis: Option<deadpool_redis::Pool>,
}

impl CacheRegistry {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        #[cfg(feature = "redis")]
        let redis = match (config.backend, config.redis_url.as_deref()) {
            (CacheBackend::Redis, Some(url)) => Some(super::redis::connect(url)?),
            (CacheBackend::Redis, None) => {
                return Err(CacheError::backend(
                    "redis cache backend selected without a redis url",
                ));
            }
            _ => None,
        };
        #[cfg(not(feature = "redis"))]
        if config.backend == CacheBackend::Redis {
            return Err(CacheError::backend(
                "redis cache backend requires the `redis` feature",
            ));
        }

        Ok(Self {
            list_keys: ListKeyTracker::new(config.capacity_non_zero()),
            generations: TableGenerations::default(),
            config,
            instances: DashMap::new(),
            #[cfg(feature = "redis")]
            redis,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn list_keys(&self) -> &ListKeyTracker {
        &self.list_keys
    }

    pub fn generations(&self) -> &TableGenerations {
        &self.generations
    }

    /// Number of per-type instances constructed so far.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// The traced cache instance for `T`.
    pub fn cache<T: Cacheable>(&self) -> Traced<T> {
        let instance = self
            .instances
            .entry(TypeId::of::<T>())
            .or_insert_with(|| {
                debug!(
                    target = "trellis::cache",
                    cache = type_name::<T>(),
                    backend = self.config.backend.as_str(),
                    "constructing cache instance"
                );
                Arc::new(self.build::<T>()) as Instance
            })
            .value()
            .clone();

        match instance.downcast::<Traced<T>>() {
            Ok(handle) => (*handle).clone(),
            Err(_) => {
                warn!(
                    target = "trellis::cache",
                    cache = type_name::<T>(),
                    "cache instance type mismatch; serving an unshared instance"
                );
                self.build::<T>()
            }
        }
    }

    fn build<T: Cacheable>(&self) -> Traced<T> {
        let config = &self.config;
        let backend: Arc<dyn Cache<T>> = match config.backend {
            CacheBackend::ShardedMap => Arc::new(ShardedMapCache::new()),
            CacheBackend::Lru => Arc::new(LruCache::new(config.capacity_non_zero())),
            CacheBackend::Bytes => Arc::new(ByteStoreCache::new(config.max_bytes_non_zero().get())),
            CacheBackend::ExpiringLru => Arc::new(ExpiringLruCache::new(
                config.capacity_non_zero(),
                config.ttl(),
            )),
            CacheBackend::ExpiringBytes => Arc::new(ByteStoreCache::with_global_ttl(
                config.max_bytes_non_zero().get(),
                config.ttl(),
            )),
            CacheBackend::TtlMap => Arc::new(
                TtlMapCache::new(config.default_entry_ttl()).with_sweeper(config.sweep_interval()),
            ),
            CacheBackend::Lfu => Arc::new(LfuCache::new(
                config.capacity_non_zero(),
                config.default_entry_ttl(),
            )),
            CacheBackend::Redis => self.redis_backend::<T>(),
        };
        Traced::new(backend, type_name::<T>())
    }

    #[cfg(feature = "redis")]
    fn redis_backend<T: Cacheable>(&self) -> Arc<dyn Cache<T>> {
        match &self.redis {
            Some(pool) => Arc::new(super::redis::RedisCache::new(
                pool.clone(),
                type_name::<T>(),
                self.config.default_entry_ttl(),
            )),
            None => Arc::new(ShardedMapCache::new()),
        }
    }

    #[cfg(not(feature = "redis"))]
    fn redis_backend<T: Cacheable>(&self) -> Arc<dyn Cache<T>> {
        Arc::new(ShardedMapCache::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct Alpha(u32);

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct Beta(u32);

    fn registry(backend: CacheBackend) -> CacheRegistry {
        CacheRegistry::new(CacheConfig {
            backend,
            ..Default::default()
        })
        .expect("registry")
    }

    #[tokio::test]
    async fn same_type_returns_the_same_store() {
        let registry = registry(CacheBackend::Lru);
        registry
            .cache::<Alpha>()
            .set("k", Alpha(1), None)
            .await
            .expect("set");
        let again = registry.cache::<Alpha>();
        assert_eq!(again.get("k").await.expect("shared store").0, 1);
        assert_eq!(registry.instance_count(), 1);
    }

    #[tokio::test]
    async fn distinct_types_get_distinct_stores() {
        let registry = registry(CacheBackend::ShardedMap);
        registry
            .cache::<Alpha>()
            .set("k", Alpha(1), None)
            .await
            .expect("set");
        assert!(!registry.cache::<Beta>().exists("k").await);
        assert_eq!(registry.instance_count(), 2);
        assert!(registry.cache::<Beta>().label().ends_with("Beta"));
    }

    #[tokio::test]
    async fn concurrent_construction_yields_one_instance() {
        let registry = Arc::new(registry(CacheBackend::Lfu));
        let mut handles = Vec::new();
        for i in 0..16_u32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .cache::<Alpha>()
                    .set(&format!("k{i}"), Alpha(i), None)
                    .await
                    .expect("set");
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }
        assert_eq!(registry.instance_count(), 1);
        assert_eq!(registry.cache::<Alpha>().len().await, 16);
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn redis_backend_requires_the_feature() {
        let result = CacheRegistry::new(CacheConfig {
            backend: CacheBackend::Redis,
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
