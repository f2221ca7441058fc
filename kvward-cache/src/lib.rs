//! KVWARD Cache - Cache-Aside Client
//!
//! Reads through a [`kvward_store::KvStore`] with two defenses:
//!
//! - **Penetration**: records absent from the durable store are cached as an
//!   empty sentinel for a short TTL ([`CacheClient::query_pass_through`]).
//! - **Breakdown**: hot entries carry a logical expiry and are rebuilt by a
//!   single background job while readers keep receiving the stale value
//!   ([`CacheClient::query_logical_expiry`]).
//!
//! # Example
//!
//! ```ignore
//! let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
//! let mutex = DistributedMutex::new(store.clone(), config.namespaces.clone());
//! let cache = CacheClient::new(
//!     store,
//!     mutex,
//!     RebuildPool::new(config.cache.rebuild_workers),
//!     CacheConfig::from(&config.cache),
//! );
//!
//! let shop = cache
//!     .query_pass_through("cache:shop:", &shop_id, Duration::from_secs(1800), &shops)
//!     .await?
//!     .into_option();
//! ```

pub mod client;
pub mod envelope;
pub mod loader;
pub mod lookup;
pub mod pool;
pub mod stats;

pub use client::{CacheClient, CacheConfig};
pub use envelope::LogicalExpiryEnvelope;
pub use loader::Loader;
pub use lookup::CacheLookup;
pub use pool::{PoolExhausted, RebuildPool};
pub use stats::{CacheMetrics, CacheStats};

use kvward_core::CacheError;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
