//! Cache-aside client.
//!
//! Two read paths over the same store:
//!
//! - [`CacheClient::query_pass_through`] defends against penetration. A
//!   record missing from the durable store is remembered with the empty
//!   sentinel for `null_ttl`, so repeated lookups of a nonexistent id stop
//!   at the cache. There is no mutual exclusion on this path.
//! - [`CacheClient::query_logical_expiry`] defends against breakdown. Entries
//!   carry their own expiry and are never evicted by the store; an expired
//!   entry is still served while a single background job, guarded by a
//!   distributed lock, rebuilds it.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use kvward_core::{CacheError, CacheSettings};
use kvward_coord::{DistributedMutex, LockLease};
use kvward_store::KvStore;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::envelope::LogicalExpiryEnvelope;
use crate::loader::Loader;
use crate::lookup::CacheLookup;
use crate::pool::RebuildPool;
use crate::stats::{CacheMetrics, CacheStats};
use crate::CacheResult;

// ============================================================================
// CONFIG
// ============================================================================

/// Configuration for the cache client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL of the empty sentinel written for missing records.
    pub null_ttl: Duration,
    /// TTL of the rebuild lock taken on an expired logical entry.
    pub rebuild_lock_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            null_ttl: settings.null_ttl,
            rebuild_lock_ttl: settings.rebuild_lock_ttl,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sentinel TTL.
    pub fn with_null_ttl(mut self, ttl: Duration) -> Self {
        self.null_ttl = ttl;
        self
    }

    /// Set the rebuild lock TTL.
    pub fn with_rebuild_lock_ttl(mut self, ttl: Duration) -> Self {
        self.rebuild_lock_ttl = ttl;
        self
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Cache-aside client over a [`KvStore`].
///
/// Cheap to clone; clones share the store, lock, pool and counters.
#[derive(Clone)]
pub struct CacheClient {
    store: Arc<dyn KvStore>,
    mutex: DistributedMutex,
    pool: RebuildPool,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
}

impl fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClient")
            .field("mutex", &self.mutex)
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CacheClient {
    pub fn new(
        store: Arc<dyn KvStore>,
        mutex: DistributedMutex,
        pool: RebuildPool,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            mutex,
            pool,
            config,
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn pool(&self) -> &RebuildPool {
        &self.pool
    }

    /// Current counter values.
    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot()
    }

    /// Serialize `value` as JSON and store it under `key` with `ttl`.
    pub async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = encode(value)?;
        self.store.set(key, &payload, Some(ttl)).await?;
        Ok(())
    }

    /// Store `value` in an envelope expiring `ttl` from now, with no store TTL.
    pub async fn set_with_logical_expiry<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = encode(&LogicalExpiryEnvelope::new(value, ttl, Utc::now()))?;
        self.store.set(key, &payload, None).await?;
        Ok(())
    }

    /// Read `{key_prefix}{id}`, loading and caching on a miss.
    ///
    /// - live entry: [`CacheLookup::Hit`]
    /// - empty sentinel: [`CacheLookup::NegativeHit`], loader not called
    /// - absent, loader finds the record: written with `ttl`, [`CacheLookup::Loaded`]
    /// - absent, loader finds nothing: sentinel written with `null_ttl`,
    ///   [`CacheLookup::Miss`]
    ///
    /// Loader errors propagate and leave the cache untouched.
    pub async fn query_pass_through<T, Id, L>(
        &self,
        key_prefix: &str,
        id: &Id,
        ttl: Duration,
        loader: &L,
    ) -> CacheResult<CacheLookup<T>>
    where
        T: Serialize + DeserializeOwned + Sync,
        Id: fmt::Display + Send + Sync,
        L: Loader<Id, T> + ?Sized,
    {
        let key = cache_key(key_prefix, id);

        match self.store.get(&key).await? {
            Some(payload) if !is_blank(&payload) => {
                let value = decode(&key, &payload)?;
                CacheMetrics::incr(&self.metrics.hits);
                tracing::debug!(key = %key, "Cache hit");
                return Ok(CacheLookup::Hit(value));
            }
            Some(_) => {
                CacheMetrics::incr(&self.metrics.negative_hits);
                tracing::debug!(key = %key, "Negative cache hit");
                return Ok(CacheLookup::NegativeHit);
            }
            None => {}
        }

        match loader.load(id).await? {
            Some(value) => {
                self.set(&key, &value, ttl).await?;
                CacheMetrics::incr(&self.metrics.loads);
                tracing::debug!(key = %key, "Cache miss, loaded from durable store");
                Ok(CacheLookup::Loaded(value))
            }
            None => {
                self.store.set(&key, "", Some(self.config.null_ttl)).await?;
                CacheMetrics::incr(&self.metrics.misses);
                tracing::debug!(key = %key, "Record not found, cached empty sentinel");
                Ok(CacheLookup::Miss)
            }
        }
    }

    /// Read `{key_prefix}{id}` from a logical-expiry envelope.
    ///
    /// The cache is assumed to be warmed; an absent key is a
    /// [`CacheLookup::Miss`] and the loader is not consulted. A fresh entry
    /// is a [`CacheLookup::Hit`].
    ///
    /// An expired entry is returned as [`CacheLookup::Stale`] without
    /// waiting. If this call wins the rebuild lock, a job on the rebuild
    /// pool reloads the record, rewrites the envelope with `ttl` and releases
    /// the lock. If the pool is full the lock is released and nothing is
    /// rebuilt. Failures inside the job are logged and counted, never
    /// returned.
    pub async fn query_logical_expiry<T, Id, L>(
        &self,
        key_prefix: &str,
        id: &Id,
        ttl: Duration,
        loader: Arc<L>,
    ) -> CacheResult<CacheLookup<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        Id: fmt::Display + Clone + Send + Sync + 'static,
        L: Loader<Id, T> + ?Sized + 'static,
    {
        let key = cache_key(key_prefix, id);

        let payload = match self.store.get(&key).await? {
            Some(payload) if !is_blank(&payload) => payload,
            _ => {
                CacheMetrics::incr(&self.metrics.misses);
                tracing::debug!(key = %key, "Logical cache miss");
                return Ok(CacheLookup::Miss);
            }
        };

        let envelope: LogicalExpiryEnvelope<T> = decode(&key, &payload)?;
        if !envelope.is_expired(Utc::now()) {
            CacheMetrics::incr(&self.metrics.hits);
            tracing::debug!(key = %key, "Cache hit");
            return Ok(CacheLookup::Hit(envelope.data));
        }

        CacheMetrics::incr(&self.metrics.stale_hits);
        match self.mutex.try_acquire(&key, self.config.rebuild_lock_ttl).await {
            Ok(Some(lease)) => {
                self.schedule_rebuild::<T, Id, L>(key, id.clone(), ttl, loader, lease)
                    .await
            }
            Ok(None) => {
                tracing::debug!(key = %key, "Rebuild already in flight, serving stale entry");
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Rebuild lock unavailable, serving stale entry");
            }
        }

        Ok(CacheLookup::Stale(envelope.data))
    }

    /// Load `{key_prefix}{id}` and write it as a logical-expiry envelope.
    ///
    /// Returns whether the record existed.
    pub async fn warm_logical<T, Id, L>(
        &self,
        key_prefix: &str,
        id: &Id,
        ttl: Duration,
        loader: &L,
    ) -> CacheResult<bool>
    where
        T: Serialize + Sync,
        Id: fmt::Display + Send + Sync,
        L: Loader<Id, T> + ?Sized,
    {
        let key = cache_key(key_prefix, id);
        match loader.load(id).await? {
            Some(value) => {
                self.set_with_logical_expiry(&key, &value, ttl).await?;
                tracing::info!(key = %key, ttl_secs = ttl.as_secs(), "Cache warmed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop `{key_prefix}{id}`. Call after writing the durable store.
    pub async fn invalidate<Id>(&self, key_prefix: &str, id: &Id) -> CacheResult<bool>
    where
        Id: fmt::Display + ?Sized,
    {
        let key = cache_key(key_prefix, id);
        let removed = self.store.delete(&key).await?;
        tracing::debug!(key = %key, removed, "Cache invalidated");
        Ok(removed)
    }

    async fn schedule_rebuild<T, Id, L>(
        &self,
        key: String,
        id: Id,
        ttl: Duration,
        loader: Arc<L>,
        lease: LockLease,
    ) where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        Id: fmt::Display + Send + Sync + 'static,
        L: Loader<Id, T> + ?Sized + 'static,
    {
        let client = self.clone();
        let job_key = key.clone();
        let job_lease = lease.clone();
        let job = async move {
            let rebuilt = AssertUnwindSafe(client.rebuild::<T, Id, L>(
                &job_key,
                &id,
                ttl,
                loader.as_ref(),
            ))
            .catch_unwind()
            .await;
            match rebuilt {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    CacheMetrics::incr(&client.metrics.rebuilds_failed);
                    tracing::error!(key = %job_key, error = %e, "Cache rebuild failed");
                }
                Err(_) => {
                    CacheMetrics::incr(&client.metrics.rebuilds_failed);
                    tracing::error!(key = %job_key, "Cache rebuild panicked");
                }
            }
            client.release_rebuild_lock(&job_lease).await;
        };

        match self.pool.try_spawn(job) {
            Ok(_) => {
                CacheMetrics::incr(&self.metrics.rebuilds_scheduled);
                tracing::debug!(key = %key, "Cache rebuild scheduled");
            }
            Err(e) => {
                CacheMetrics::incr(&self.metrics.rebuilds_dropped);
                tracing::warn!(key = %key, error = %e, "Cache rebuild dropped");
                self.release_rebuild_lock(&lease).await;
            }
        }
    }

    async fn rebuild<T, Id, L>(&self, key: &str, id: &Id, ttl: Duration, loader: &L) -> CacheResult<()>
    where
        T: Serialize + Send + Sync,
        Id: Send + Sync,
        L: Loader<Id, T> + ?Sized,
    {
        match loader.load(id).await? {
            Some(value) => {
                self.set_with_logical_expiry(key, &value, ttl).await?;
                tracing::info!(key = %key, "Cache rebuilt");
            }
            None => {
                tracing::warn!(key = %key, "Record gone from durable store, keeping stale entry");
            }
        }
        Ok(())
    }

    async fn release_rebuild_lock(&self, lease: &LockLease) {
        if let Err(e) = self.mutex.release(lease).await {
            tracing::error!(key = %lease.key(), error = %e, "Failed to release rebuild lock");
        }
    }
}

fn cache_key<Id: fmt::Display + ?Sized>(key_prefix: &str, id: &Id) -> String {
    format!("{key_prefix}{id}")
}

fn is_blank(payload: &str) -> bool {
    payload.trim().is_empty()
}

fn encode<T: Serialize + ?Sized>(value: &T) -> CacheResult<String> {
    serde_json::to_string(value).map_err(|e| CacheError::Serialization {
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, payload: &str) -> CacheResult<T> {
    serde_json::from_str(payload).map_err(|e| CacheError::CorruptEntry {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
