//! Cache key construction, list-key tracking and table generations.

use std::num::NonZeroUsize;

use dashmap::DashMap;
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::error::CacheError;

/// Key of a single record served by `get`.
pub fn record_key(table: &str, id: &str) -> String {
    format!("{table}:{id}")
}

/// Key of a list result under one table generation, derived from a digest
/// of the full descriptor.
pub fn list_key<D: Serialize>(
    table: &str,
    generation: u64,
    descriptor: &D,
) -> Result<String, CacheError> {
    let canonical =
        serde_json::to_vec(descriptor).map_err(|err| CacheError::Encode(err.to_string()))?;
    let digest = Sha256::digest(&canonical);
    Ok(format!(
        "{table}:list:{generation}:{}",
        hex::encode(&digest[..16])
    ))
}

/// Remembers which list keys were populated per table.
///
/// Writes cannot know which list descriptors intersect the affected rows, so
/// invalidation drops every tracked list key of the table. Each table keeps
/// at most `capacity` keys; tracking one more hands back the least recently
/// tracked key for the caller to drop.
pub struct ListKeyTracker {
    capacity: NonZeroUsize,
    keys: DashMap<String, LruCache<String, ()>>,
}

impl ListKeyTracker {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            keys: DashMap::new(),
        }
    }

    /// Track `key`, returning the key pushed out of the table's window.
    pub fn track(&self, table: &str, key: &str) -> Option<String> {
        let mut tracked = self
            .keys
            .entry(table.to_string())
            .or_insert_with(|| LruCache::new(self.capacity));
        tracked
            .push(key.to_string(), ())
            .map(|(evicted, ())| evicted)
            .filter(|evicted| evicted != key)
    }

    /// Remove and return every tracked key of `table`.
    pub fn take(&self, table: &str) -> Vec<String> {
        self.keys
            .remove(table)
            .map(|(_, keys)| keys.into_iter().map(|(key, ())| key).collect())
            .unwrap_or_default()
    }

    pub fn tracked(&self, table: &str) -> usize {
        self.keys.get(table).map(|keys| keys.len()).unwrap_or(0)
    }
}

/// Per-table write counters.
///
/// List keys embed the generation read before the fetch, so a page computed
/// before a write lands under a key no later read asks for. Record fills
/// compare the generation before and after storing and drop their entry when
/// a write slipped in between.
#[derive(Default)]
pub struct TableGenerations {
    current: DashMap<String, u64>,
}

impl TableGenerations {
    pub fn current(&self, table: &str) -> u64 {
        self.current.get(table).map(|generation| *generation).unwrap_or(0)
    }

    /// Start a new generation for `table`, returning it.
    pub fn advance(&self, table: &str) -> u64 {
        let mut generation = self.current.entry(table.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(capacity: usize) -> ListKeyTracker {
        ListKeyTracker::new(NonZeroUsize::new(capacity).expect("non-zero"))
    }

    #[test]
    fn list_keys_are_stable_and_descriptor_sensitive() {
        let a = list_key("users", 0, &serde_json::json!({ "page": 1 })).expect("key");
        let b = list_key("users", 0, &serde_json::json!({ "page": 1 })).expect("key");
        let c = list_key("users", 0, &serde_json::json!({ "page": 2 })).expect("key");
        let d = list_key("users", 1, &serde_json::json!({ "page": 1 })).expect("key");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with("users:list:0:"));
        assert_eq!(a.len(), "users:list:0:".len() + 32);
    }

    #[test]
    fn unencodable_descriptors_have_no_key() {
        let mut descriptor = std::collections::HashMap::new();
        descriptor.insert((1, 2), "tuple keys are not JSON object keys");
        let err = list_key("users", 0, &descriptor).expect_err("no key");
        assert!(matches!(err, CacheError::Encode(_)));
    }

    #[test]
    fn take_drains_only_the_requested_table() {
        let tracker = tracker(8);
        assert_eq!(tracker.track("users", "users:list:1"), None);
        assert_eq!(tracker.track("users", "users:list:1"), None);
        tracker.track("users", "users:list:2");
        tracker.track("groups", "groups:list:1");

        let mut taken = tracker.take("users");
        taken.sort();
        assert_eq!(taken, vec!["users:list:1", "users:list:2"]);
        assert_eq!(tracker.tracked("users"), 0);
        assert_eq!(tracker.tracked("groups"), 1);
    }

    #[test]
    fn tracked_keys_stay_within_capacity() {
        let tracker = tracker(4);
        let mut evicted = Vec::new();
        for page in 0..500 {
            if let Some(key) = tracker.track("users", &format!("users:list:{page}")) {
                evicted.push(key);
            }
        }
        assert_eq!(tracker.tracked("users"), 4);
        assert_eq!(evicted.len(), 496);
        assert_eq!(evicted[0], "users:list:0");
    }

    #[test]
    fn generations_advance_per_table() {
        let generations = TableGenerations::default();
        assert_eq!(generations.current("users"), 0);
        assert_eq!(generations.advance("users"), 1);
        assert_eq!(generations.advance("users"), 2);
        assert_eq!(generations.current("users"), 2);
        assert_eq!(generations.current("groups"), 0);
    }
}
