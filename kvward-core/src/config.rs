//! Configuration types
//!
//! Every component receives its slice of [`KvwardConfig`] at construction.
//! Nothing here is global: two coordinators in one process may use disjoint
//! namespaces against the same store.

use crate::error::ConfigError;
use crate::identity::{UserId, VoucherId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

/// TTL of the empty sentinel written for records missing from the durable store.
pub const DEFAULT_CACHE_NULL_TTL_SECS: u64 = 120;

/// TTL of the lock guarding a logical-expiry rebuild.
pub const DEFAULT_REBUILD_LOCK_TTL_SECS: u64 = 10;

/// Maximum concurrently running cache rebuilds.
pub const DEFAULT_REBUILD_WORKERS: usize = 10;

/// 2022-01-01T00:00:00Z.
pub const DEFAULT_ID_EPOCH_SECS: i64 = 1_640_995_200;

/// Low bits of an id reserved for the per-day counter.
pub const DEFAULT_ID_COUNTER_BITS: u32 = 32;

/// Widest counter an id may carry; the timestamp keeps the remaining bits.
pub const MAX_ID_COUNTER_BITS: u32 = 40;

pub const DEFAULT_ORDER_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_ORDER_WORKERS: usize = 1;
pub const DEFAULT_ORDER_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_ORDER_RETRY_BACKOFF_MS: u64 = 200;
pub const DEFAULT_ORDER_LOCK_TTL_SECS: u64 = 10;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_REDIS_POOL_SIZE: usize = 16;

// ============================================================================
// KEY NAMESPACES
// ============================================================================

/// Key prefixes for every component. Each component writes only to its own
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyNamespaces {
    /// Prefix for mutex keys (`lock:{resource}`).
    pub lock_prefix: String,
    /// Prefix for id counters (`{prefix}:{tag}:{yyyy:MM:dd}`).
    pub counter_prefix: String,
    /// Prefix for per-voucher remaining stock.
    pub stock_prefix: String,
    /// Prefix for per-voucher purchaser sets.
    pub buyers_prefix: String,
    /// Prefix for published voucher windows.
    pub voucher_prefix: String,
    /// Lock resource prefix serializing one user's order persistence.
    pub order_lock_prefix: String,
}

impl Default for KeyNamespaces {
    fn default() -> Self {
        Self {
            lock_prefix: "lock:".to_string(),
            counter_prefix: "icr".to_string(),
            stock_prefix: "seckill:stock:".to_string(),
            buyers_prefix: "seckill:order:".to_string(),
            voucher_prefix: "seckill:voucher:".to_string(),
            order_lock_prefix: "order:".to_string(),
        }
    }
}

impl KeyNamespaces {
    /// `lock:{resource}`
    pub fn lock_key(&self, resource: &str) -> String {
        format!("{}{}", self.lock_prefix, resource)
    }

    /// `{counter_prefix}:{tag}:{day}` where `day` is formatted `yyyy:MM:dd`.
    pub fn counter_key(&self, tag: &str, day: &str) -> String {
        format!("{}:{}:{}", self.counter_prefix, tag, day)
    }

    pub fn stock_key(&self, voucher_id: VoucherId) -> String {
        format!("{}{}", self.stock_prefix, voucher_id)
    }

    pub fn buyers_key(&self, voucher_id: VoucherId) -> String {
        format!("{}{}", self.buyers_prefix, voucher_id)
    }

    pub fn voucher_key(&self, voucher_id: VoucherId) -> String {
        format!("{}{}", self.voucher_prefix, voucher_id)
    }

    /// Lock resource (not the full key) for a user's order persistence.
    pub fn order_lock_resource(&self, user_id: UserId) -> String {
        format!("{}{}", self.order_lock_prefix, user_id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("namespaces.lock_prefix", &self.lock_prefix),
            ("namespaces.counter_prefix", &self.counter_prefix),
            ("namespaces.stock_prefix", &self.stock_prefix),
            ("namespaces.buyers_prefix", &self.buyers_prefix),
            ("namespaces.voucher_prefix", &self.voucher_prefix),
            ("namespaces.order_lock_prefix", &self.order_lock_prefix),
        ];
        for (field, value) in fields {
            if value.is_empty() {
                return Err(ConfigError::invalid(field, "\"\"", "prefix must not be empty"));
            }
        }
        if self.stock_prefix == self.buyers_prefix || self.stock_prefix == self.voucher_prefix {
            return Err(ConfigError::invalid(
                "namespaces.stock_prefix",
                &self.stock_prefix,
                "must differ from the buyers and voucher prefixes",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// COMPONENT SETTINGS
// ============================================================================

/// Cache client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// TTL for the empty sentinel (negative caching).
    pub null_ttl: Duration,
    /// TTL of the single-flight rebuild lock.
    pub rebuild_lock_ttl: Duration,
    /// Size of the background rebuild pool.
    pub rebuild_workers: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            null_ttl: Duration::from_secs(DEFAULT_CACHE_NULL_TTL_SECS),
            rebuild_lock_ttl: Duration::from_secs(DEFAULT_REBUILD_LOCK_TTL_SECS),
            rebuild_workers: DEFAULT_REBUILD_WORKERS,
        }
    }
}

/// Id generator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSettings {
    /// Custom epoch in Unix seconds.
    pub epoch_seconds: i64,
    /// Number of low bits holding the daily counter.
    pub counter_bits: u32,
}

impl Default for IdSettings {
    fn default() -> Self {
        Self {
            epoch_seconds: DEFAULT_ID_EPOCH_SECS,
            counter_bits: DEFAULT_ID_COUNTER_BITS,
        }
    }
}

/// Flash-sale coordinator and order pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashSaleSettings {
    /// Bounded capacity of the order persistence queue.
    pub queue_capacity: usize,
    /// Number of persistence workers draining the queue.
    pub workers: usize,
    /// Attempts per order before it is dropped and logged.
    pub max_attempts: u32,
    /// Base backoff between attempts; attempt `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
    /// TTL of the per-user persistence lock.
    pub order_lock_ttl: Duration,
    /// Business tag passed to the id generator for orders.
    pub order_tag: String,
}

impl Default for FlashSaleSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_ORDER_QUEUE_CAPACITY,
            workers: DEFAULT_ORDER_WORKERS,
            max_attempts: DEFAULT_ORDER_MAX_ATTEMPTS,
            retry_backoff: Duration::from_millis(DEFAULT_ORDER_RETRY_BACKOFF_MS),
            order_lock_ttl: Duration::from_secs(DEFAULT_ORDER_LOCK_TTL_SECS),
            order_tag: "order".to_string(),
        }
    }
}

/// Connection settings for a networked store backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    pub url: String,
    pub pool_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            pool_size: DEFAULT_REDIS_POOL_SIZE,
        }
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvwardConfig {
    pub namespaces: KeyNamespaces,
    pub cache: CacheSettings,
    pub ids: IdSettings,
    pub flash: FlashSaleSettings,
    pub store: StoreSettings,
}

impl KvwardConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create KvwardConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `KVWARD_LOCK_PREFIX`: Mutex key prefix (default: `lock:`)
    /// - `KVWARD_COUNTER_PREFIX`: Id counter namespace (default: `icr`)
    /// - `KVWARD_CACHE_NULL_TTL_SECS`: Empty sentinel TTL (default: 120)
    /// - `KVWARD_CACHE_REBUILD_LOCK_TTL_SECS`: Rebuild lock TTL (default: 10)
    /// - `KVWARD_CACHE_REBUILD_WORKERS`: Rebuild pool size (default: 10)
    /// - `KVWARD_ID_EPOCH_SECS`: Id epoch in Unix seconds (default: 1640995200)
    /// - `KVWARD_ID_COUNTER_BITS`: Counter bits (default: 32)
    /// - `KVWARD_ORDER_QUEUE_CAPACITY`: Order queue capacity (default: 1024)
    /// - `KVWARD_ORDER_WORKERS`: Order persistence workers (default: 1)
    /// - `KVWARD_ORDER_MAX_ATTEMPTS`: Persistence attempts per order (default: 3)
    /// - `KVWARD_ORDER_RETRY_BACKOFF_MS`: Base retry backoff (default: 200)
    /// - `KVWARD_ORDER_LOCK_TTL_SECS`: Per-user order lock TTL (default: 10)
    /// - `KVWARD_REDIS_URL`: Store URL (default: `redis://127.0.0.1:6379`)
    /// - `KVWARD_REDIS_POOL_SIZE`: Store connection pool size (default: 16)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut namespaces = defaults.namespaces;
        if let Some(prefix) = lookup("KVWARD_LOCK_PREFIX") {
            namespaces.lock_prefix = prefix;
        }
        if let Some(prefix) = lookup("KVWARD_COUNTER_PREFIX") {
            namespaces.counter_prefix = prefix;
        }

        let cache = CacheSettings {
            null_ttl: env_parse::<u64>(&lookup, "KVWARD_CACHE_NULL_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache.null_ttl),
            rebuild_lock_ttl: env_parse::<u64>(&lookup, "KVWARD_CACHE_REBUILD_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache.rebuild_lock_ttl),
            rebuild_workers: env_parse(&lookup, "KVWARD_CACHE_REBUILD_WORKERS")
                .unwrap_or(defaults.cache.rebuild_workers),
        };

        let ids = IdSettings {
            epoch_seconds: env_parse(&lookup, "KVWARD_ID_EPOCH_SECS")
                .unwrap_or(defaults.ids.epoch_seconds),
            counter_bits: env_parse(&lookup, "KVWARD_ID_COUNTER_BITS")
                .unwrap_or(defaults.ids.counter_bits),
        };

        let flash = FlashSaleSettings {
            queue_capacity: env_parse(&lookup, "KVWARD_ORDER_QUEUE_CAPACITY")
                .unwrap_or(defaults.flash.queue_capacity),
            workers: env_parse(&lookup, "KVWARD_ORDER_WORKERS").unwrap_or(defaults.flash.workers),
            max_attempts: env_parse(&lookup, "KVWARD_ORDER_MAX_ATTEMPTS")
                .unwrap_or(defaults.flash.max_attempts),
            retry_backoff: env_parse::<u64>(&lookup, "KVWARD_ORDER_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.flash.retry_backoff),
            order_lock_ttl: env_parse::<u64>(&lookup, "KVWARD_ORDER_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.flash.order_lock_ttl),
            order_tag: defaults.flash.order_tag,
        };

        let store = StoreSettings {
            url: lookup("KVWARD_REDIS_URL").unwrap_or(defaults.store.url),
            pool_size: env_parse(&lookup, "KVWARD_REDIS_POOL_SIZE")
                .unwrap_or(defaults.store.pool_size),
        };

        Self {
            namespaces,
            cache,
            ids,
            flash,
            store,
        }
    }

    /// Replace the key namespaces.
    pub fn with_namespaces(mut self, namespaces: KeyNamespaces) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Replace the cache settings.
    pub fn with_cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the id generator settings.
    pub fn with_ids(mut self, ids: IdSettings) -> Self {
        self.ids = ids;
        self
    }

    /// Replace the flash-sale settings.
    pub fn with_flash(mut self, flash: FlashSaleSettings) -> Self {
        self.flash = flash;
        self
    }

    /// Replace the store settings.
    pub fn with_store(mut self, store: StoreSettings) -> Self {
        self.store = store;
        self
    }

    /// Check every setting that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.namespaces.validate()?;

        if self.cache.rebuild_workers == 0 {
            return Err(ConfigError::invalid("cache.rebuild_workers", 0, "must be positive"));
        }
        if self.cache.rebuild_lock_ttl.is_zero() {
            return Err(ConfigError::invalid(
                "cache.rebuild_lock_ttl",
                "0s",
                "a zero TTL lock is never held",
            ));
        }
        if !(1..=MAX_ID_COUNTER_BITS).contains(&self.ids.counter_bits) {
            return Err(ConfigError::invalid(
                "ids.counter_bits",
                self.ids.counter_bits,
                &format!("must be within 1..={MAX_ID_COUNTER_BITS}"),
            ));
        }
        if self.ids.epoch_seconds < 0 {
            return Err(ConfigError::invalid(
                "ids.epoch_seconds",
                self.ids.epoch_seconds,
                "must not be negative",
            ));
        }
        if self.flash.queue_capacity == 0 {
            return Err(ConfigError::invalid("flash.queue_capacity", 0, "must be positive"));
        }
        if self.flash.workers == 0 {
            return Err(ConfigError::invalid("flash.workers", 0, "must be positive"));
        }
        if self.flash.max_attempts == 0 {
            return Err(ConfigError::invalid("flash.max_attempts", 0, "must be positive"));
        }
        if self.flash.order_tag.is_empty() {
            return Err(ConfigError::invalid("flash.order_tag", "\"\"", "must not be empty"));
        }
        if self.store.pool_size == 0 {
            return Err(ConfigError::invalid("store.pool_size", 0, "must be positive"));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|s| s.trim().parse().ok())
}
