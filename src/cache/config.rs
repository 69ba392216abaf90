//! Cache configuration.

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use super::CacheClass;

const DEFAULT_CAPACITY: usize = 1024;
const DEFAULT_MAX_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Backend used for every per-type cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    ShardedMap,
    #[default]
    Lru,
    Bytes,
    ExpiringLru,
    ExpiringBytes,
    TtlMap,
    Lfu,
    Redis,
}

impl CacheBackend {
    pub const ALL: [CacheBackend; 8] = [
        CacheBackend::ShardedMap,
        CacheBackend::Lru,
        CacheBackend::Bytes,
        CacheBackend::ExpiringLru,
        CacheBackend::ExpiringBytes,
        CacheBackend::TtlMap,
        CacheBackend::Lfu,
        CacheBackend::Redis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheBackend::ShardedMap => "sharded_map",
            CacheBackend::Lru => "lru",
            CacheBackend::Bytes => "bytes",
            CacheBackend::ExpiringLru => "expiring_lru",
            CacheBackend::ExpiringBytes => "expiring_bytes",
            CacheBackend::TtlMap => "ttl_map",
            CacheBackend::Lfu => "lfu",
            CacheBackend::Redis => "redis",
        }
    }

    pub fn class(&self) -> CacheClass {
        match self {
            CacheBackend::ShardedMap | CacheBackend::Lru | CacheBackend::Bytes => {
                CacheClass::NoExpiration
            }
            CacheBackend::ExpiringLru | CacheBackend::ExpiringBytes => CacheClass::GlobalExpiration,
            CacheBackend::TtlMap | CacheBackend::Lfu | CacheBackend::Redis => {
                CacheClass::PerEntryExpiration
            }
        }
    }
}

impl FromStr for CacheBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        CacheBackend::ALL
            .into_iter()
            .find(|backend| backend.as_str() == normalized)
            .ok_or_else(|| {
                let known: Vec<&str> = CacheBackend::ALL.iter().map(|b| b.as_str()).collect();
                format!("unknown cache backend `{value}` (expected one of {})", known.join(", "))
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve `with_cache` reads from the cache at all.
    pub enabled: bool,
    pub backend: CacheBackend,
    /// Entry limit for capacity-bounded backends.
    pub capacity: usize,
    /// Byte limit for byte-addressed backends.
    pub max_bytes: usize,
    /// Global TTL for global-expiration backends, default TTL for per-entry ones.
    pub ttl_seconds: u64,
    /// Background sweep cadence of the TTL map; zero disables sweeping.
    pub sweep_interval_seconds: u64,
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackend::default(),
            capacity: DEFAULT_CAPACITY,
            max_bytes: DEFAULT_MAX_BYTES,
            ttl_seconds: DEFAULT_TTL_SECS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECS,
            redis_url: None,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            backend: settings.backend,
            capacity: settings.capacity.get(),
            max_bytes: settings.max_bytes.get(),
            ttl_seconds: settings.ttl.as_secs(),
            sweep_interval_seconds: settings.sweep_interval.as_secs(),
            redis_url: settings.redis_url.clone(),
        }
    }
}

impl CacheConfig {
    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn max_bytes_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_bytes).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Default TTL for per-entry backends; zero means entries never expire.
    pub fn default_entry_ttl(&self) -> Option<Duration> {
        (self.ttl_seconds > 0).then(|| self.ttl())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.backend, CacheBackend::Lru);
        assert_eq!(config.capacity, 1024);
        assert_eq!(config.max_bytes, 16 * 1024 * 1024);
        assert_eq!(config.ttl(), Duration::from_secs(300));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            capacity: 0,
            max_bytes: 0,
            ..Default::default()
        };
        assert_eq!(config.capacity_non_zero().get(), 1);
        assert_eq!(config.max_bytes_non_zero().get(), 1);
    }

    #[test]
    fn zero_ttl_disables_default_entry_expiry() {
        let config = CacheConfig {
            ttl_seconds: 0,
            ..Default::default()
        };
        assert!(config.default_entry_ttl().is_none());
    }

    #[test]
    fn backend_names_parse_leniently() {
        assert_eq!("ttl-map".parse::<CacheBackend>(), Ok(CacheBackend::TtlMap));
        assert_eq!(" LFU ".parse::<CacheBackend>(), Ok(CacheBackend::Lfu));
        assert!("memcached".parse::<CacheBackend>().is_err());
    }

    #[test]
    fn backends_report_their_ttl_class() {
        assert_eq!(CacheBackend::Bytes.class(), CacheClass::NoExpiration);
        assert_eq!(CacheBackend::ExpiringBytes.class(), CacheClass::GlobalExpiration);
        assert_eq!(CacheBackend::Redis.class(), CacheClass::PerEntryExpiration);
    }
}
