//! Generic key/value cache abstraction.
//!
//! Every backend implements [`Cache`] over string keys and typed values and
//! belongs to one [`CacheClass`] describing how it treats time-to-live:
//!
//! - `NoExpiration`: entries live until deleted or evicted; TTL is ignored.
//! - `GlobalExpiration`: one TTL fixed at construction; per-call TTL ignored.
//! - `PerEntryExpiration`: the per-call TTL is honored.
//!
//! Backends are selected through [`CacheConfig`] and handed out per cached
//! type by the [`CacheRegistry`], always wrapped in the [`Traced`] decorator.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

mod bytes;
pub mod codec;
mod config;
mod error;
mod expiring;
mod keys;
mod lfu;
mod lock;
mod lru;
#[cfg(feature = "redis")]
pub mod redis;
mod registry;
mod sharded;
mod traced;
mod ttl_map;

pub use bytes::ByteStoreCache;
pub use config::{CacheBackend, CacheConfig};
pub use error::CacheError;
pub use expiring::ExpiringLruCache;
pub use keys::{ListKeyTracker, TableGenerations, list_key, record_key};
pub use lfu::LfuCache;
pub use lru::LruCache;
pub use registry::CacheRegistry;
pub use sharded::ShardedMapCache;
pub use traced::Traced;
pub use ttl_map::TtlMapCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheClass {
    NoExpiration,
    GlobalExpiration,
    PerEntryExpiration,
}

impl CacheClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheClass::NoExpiration => "no_expiration",
            CacheClass::GlobalExpiration => "global_expiration",
            CacheClass::PerEntryExpiration => "per_entry_expiration",
        }
    }
}

/// Key/value store over string keys.
///
/// `get` may update recency or frequency bookkeeping; `peek` never does.
/// A miss is reported as [`CacheError::NotFound`]. `len` returns `-1` when
/// the backend cannot count entries cheaply.
#[async_trait]
pub trait Cache<T>: Send + Sync {
    fn class(&self) -> CacheClass;

    fn backend(&self) -> &'static str;

    async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<T, CacheError>;

    async fn peek(&self, key: &str) -> Result<T, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> bool;

    async fn len(&self) -> i64;

    async fn clear(&self) -> Result<(), CacheError>;
}

/// Values that can live in any backend, including the byte-serialized ones.
pub trait Cacheable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// TTL applied by per-entry backends: the explicit value wins, a zero
/// duration means "no expiry", otherwise the backend default applies.
pub(crate) fn effective_ttl(ttl: Option<Duration>, default: Option<Duration>) -> Option<Duration> {
    match ttl {
        Some(ttl) if ttl.is_zero() => None,
        Some(ttl) => Some(ttl),
        None => default,
    }
}
