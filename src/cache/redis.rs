//! Redis-backed cache (feature `redis`).
//!
//! Keys are namespaced per cached type so that `clear` only touches the
//! entries of one logical instance. Values use the envelope codec.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use super::codec;
use super::{Cache, CacheClass, CacheError, effective_ttl};

const BACKEND: &str = "redis";

/// Build a connection pool; no connection is opened until first use.
pub fn connect(url: &str) -> Result<Pool, CacheError> {
    PoolConfig::from_url(url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|err| CacheError::backend(format!("failed to create redis pool: {err}")))
}

pub struct RedisCache<T> {
    pool: Pool,
    namespace: String,
    default_ttl: Option<Duration>,
    _value: PhantomData<fn() -> T>,
}

impl<T> RedisCache<T> {
    pub fn new(pool: Pool, namespace: impl Into<String>, default_ttl: Option<Duration>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            default_ttl: default_ttl.filter(|ttl| !ttl.is_zero()),
            _value: PhantomData,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }

    async fn conn(&self) -> Result<Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|err| CacheError::backend(format!("failed to get redis connection: {err}")))
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn
            .get(self.key(key))
            .await
            .map_err(|err| CacheError::backend(format!("redis GET failed: {err}")))?;
        value.ok_or(CacheError::NotFound)
    }
}

#[async_trait]
impl<T> Cache<T> for RedisCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn class(&self) -> CacheClass {
        CacheClass::PerEntryExpiration
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<(), CacheError> {
        let bytes = codec::encode(&value)?.to_vec();
        let mut conn = self.conn().await?;
        let key = self.key(key);
        match effective_ttl(ttl, self.default_ttl) {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, bytes, ttl.as_secs().max(1))
                .await
                .map_err(|err| CacheError::backend(format!("redis SETEX failed: {err}"))),
            None => conn
                .set::<_, _, ()>(key, bytes)
                .await
                .map_err(|err| CacheError::backend(format!("redis SET failed: {err}"))),
        }
    }

    async fn get(&self, key: &str) -> Result<T, CacheError> {
        let bytes = self.fetch(key).await?;
        codec::decode(&bytes)
    }

    async fn peek(&self, key: &str) -> Result<T, CacheError> {
        self.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.key(key))
            .await
            .map_err(|err| CacheError::backend(format!("redis DEL failed: {err}")))
    }

    async fn exists(&self, key: &str) -> bool {
        let Ok(mut conn) = self.conn().await else {
            return false;
        };
        conn.exists(self.key(key)).await.unwrap_or(false)
    }

    async fn len(&self) -> i64 {
        -1
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}:*", self.namespace))
            .query_async(&mut *conn)
            .await
            .map_err(|err| CacheError::backend(format!("redis KEYS failed: {err}")))?;
        if keys.is_empty() {
            return Ok(());
        }
        warn!(
            target = "trellis::cache",
            namespace = %self.namespace,
            keys = keys.len(),
            "clearing redis namespace"
        );
        conn.del::<_, ()>(keys)
            .await
            .map_err(|err| CacheError::backend(format!("redis DEL failed: {err}")))
    }
}
