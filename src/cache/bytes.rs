use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};

use super::codec;
use super::lock::mutex_lock;
use super::{Cache, CacheClass, CacheError};

const BACKEND: &str = "byte_store";

struct ByteEntry {
    bytes: Bytes,
    seq: u64,
    stored_at: Instant,
}

#[derive(Default)]
struct ByteStore {
    entries: HashMap<String, ByteEntry>,
    /// Insertion order, oldest first.
    order: BTreeMap<u64, String>,
    next_seq: u64,
    used: usize,
}

impl ByteStore {
    fn footprint(key: &str, bytes: &Bytes) -> usize {
        key.len() + bytes.len()
    }

    fn remove(&mut self, key: &str) -> Option<ByteEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        self.used -= Self::footprint(key, &entry.bytes);
        Some(entry)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.used -= Self::footprint(&key, &entry.bytes);
        }
        true
    }

    fn insert(&mut self, key: String, bytes: Bytes) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.used += Self::footprint(&key, &bytes);
        self.order.insert(seq, key.clone());
        self.entries.insert(
            key,
            ByteEntry {
                bytes,
                seq,
                stored_at: Instant::now(),
            },
        );
    }
}

/// Memory-capped store of serialized values.
///
/// Values are encoded with the envelope codec and the store never holds more
/// than `max_bytes` of keys plus payloads; the oldest entries are evicted
/// first. Without a global TTL the store belongs to the no-expiration class,
/// with one it belongs to the global-expiration class. Per-call TTLs are
/// ignored either way, and `len` is not tracked (always `-1`).
pub struct ByteStoreCache<T> {
    store: Mutex<ByteStore>,
    max_bytes: usize,
    ttl: Option<Duration>,
    _value: PhantomData<fn() -> T>,
}

impl<T> ByteStoreCache<T> {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            store: Mutex::new(ByteStore::default()),
            max_bytes,
            ttl: None,
            _value: PhantomData,
        }
    }

    pub fn with_global_ttl(max_bytes: usize, ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::new(max_bytes)
        }
    }

    fn is_live(&self, entry: &ByteEntry) -> bool {
        self.ttl
            .is_none_or(|ttl| entry.stored_at.elapsed() < ttl)
    }

    fn read(&self, key: &str, op: &'static str) -> Result<Bytes, CacheError> {
        let mut store = mutex_lock(&self.store, BACKEND, op);
        let expired = match store.entries.get(key) {
            Some(entry) if self.is_live(entry) => return Ok(entry.bytes.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            store.remove(key);
        }
        Err(CacheError::NotFound)
    }
}

#[async_trait]
impl<T> Cache<T> for ByteStoreCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn class(&self) -> CacheClass {
        if self.ttl.is_some() {
            CacheClass::GlobalExpiration
        } else {
            CacheClass::NoExpiration
        }
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn set(&self, key: &str, value: T, _ttl: Option<Duration>) -> Result<(), CacheError> {
        let encoded = codec::encode(&value);
        let mut store = mutex_lock(&self.store, BACKEND, "set");
        store.remove(key);

        let bytes = encoded?;
        let size = ByteStore::footprint(key, &bytes);
        if size > self.max_bytes {
            return Err(CacheError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }

        while store.used + size > self.max_bytes && store.evict_oldest() {
            counter!("trellis_cache_evict_total", "backend" => BACKEND).increment(1);
        }
        store.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<T, CacheError> {
        let bytes = self.read(key, "get")?;
        codec::decode(&bytes)
    }

    async fn peek(&self, key: &str) -> Result<T, CacheError> {
        let bytes = self.read(key, "peek")?;
        codec::decode(&bytes)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        mutex_lock(&self.store, BACKEND, "delete").remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        self.read(key, "exists").is_ok()
    }

    async fn len(&self) -> i64 {
        -1
    }

    async fn clear(&self) -> Result<(), CacheError> {
        *mutex_lock(&self.store, BACKEND, "clear") = ByteStore::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refused"))
        }
    }

    impl<'de> serde::Deserialize<'de> for Unserializable {
        fn deserialize<D: serde::Deserializer<'de>>(_: D) -> Result<Self, D::Error> {
            Ok(Unserializable)
        }
    }

    #[tokio::test]
    async fn oldest_entries_are_evicted_to_respect_the_byte_cap() {
        // Each entry costs 1 byte of key plus 6 header bytes plus "\"xxxx\"".
        let cache = ByteStoreCache::<String>::new(26);
        cache.set("a", "aaaa".into(), None).await.expect("set a");
        cache.set("b", "bbbb".into(), None).await.expect("set b");
        cache.get("a").await.expect("a readable");
        cache.set("c", "cccc".into(), None).await.expect("set c");

        assert!(!cache.exists("a").await, "oldest entry evicted");
        assert_eq!(cache.get("b").await.expect("b kept"), "bbbb");
        assert_eq!(cache.get("c").await.expect("c kept"), "cccc");
    }

    #[tokio::test]
    async fn oversized_values_are_rejected_and_absent() {
        let cache = ByteStoreCache::<String>::new(16);
        cache.set("k", "ok".into(), None).await.expect("small value");
        let err = cache
            .set("k", "x".repeat(64), None)
            .await
            .expect_err("too large");
        assert!(matches!(err, CacheError::TooLarge { limit: 16, .. }));
        assert!(!cache.exists("k").await);
    }

    #[tokio::test]
    async fn encode_failures_leave_the_key_absent() {
        let cache = ByteStoreCache::<Unserializable>::new(1024);
        let err = cache.set("k", Unserializable, None).await.unwrap_err();
        assert!(matches!(err, CacheError::Encode(_)));
        assert!(cache.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn len_is_not_reported() {
        let cache = ByteStoreCache::<u8>::new(1024);
        cache.set("k", 1, None).await.expect("set");
        assert_eq!(cache.len().await, -1);
    }

    #[tokio::test]
    async fn global_ttl_expires_entries() {
        let cache = ByteStoreCache::<u8>::with_global_ttl(1024, Duration::from_millis(20));
        assert_eq!(Cache::<u8>::class(&cache), CacheClass::GlobalExpiration);
        cache.set("k", 1, None).await.expect("set");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.unwrap_err().is_not_found());
    }
}
