//! Token-owned, TTL-bound mutual exclusion over the store.
//!
//! ```text
//! (free) ─── try_acquire() ──→ held(token) ─── release(token) ──→ (free)
//!                                   │
//!                              ttl elapses ──→ (free, lease lapsed)
//! ```
//!
//! Acquisition is a single `set_if_absent`; it never spins or sleeps.
//! Release is a single `compare_and_delete` against the lease's token, so a
//! holder whose TTL lapsed can never delete a lock now owned by someone else.
//!
//! There is no lease renewal. A critical section that outlives its TTL loses
//! the lock silently; [`DistributedMutex::release`] then reports `false`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kvward_core::{CoordError, KeyNamespaces, OwnerToken, Timestamp};
use kvward_store::KvStore;
use serde::{Deserialize, Serialize};

use crate::CoordResult;

// ============================================================================
// LEASE
// ============================================================================

/// Proof of a successful acquisition.
///
/// Holds the owner token that must be presented to release the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    resource: String,
    key: String,
    token: OwnerToken,
    acquired_at: Timestamp,
    ttl: Duration,
}

impl LockLease {
    /// Resource name as passed to acquire (without the key prefix).
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Full store key of the lock.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &OwnerToken {
        &self.token
    }

    pub fn acquired_at(&self) -> Timestamp {
        self.acquired_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Local estimate of when the store will expire the key.
    pub fn expires_at(&self) -> Timestamp {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.acquired_at.checked_add_signed(ttl))
            .unwrap_or(Timestamp::MAX_UTC)
    }

    /// Whether the lease has lapsed by the local clock.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at()
    }

    /// Time left before the lease lapses, `None` once it has.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at() - now).to_std().ok()
        }
    }
}

// ============================================================================
// MUTEX
// ============================================================================

/// Distributed mutex keyed by resource name.
///
/// Cheap to clone; clones share the store handle.
#[derive(Clone)]
pub struct DistributedMutex {
    store: Arc<dyn KvStore>,
    namespaces: KeyNamespaces,
}

impl fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("lock_prefix", &self.namespaces.lock_prefix)
            .finish_non_exhaustive()
    }
}

impl DistributedMutex {
    pub fn new(store: Arc<dyn KvStore>, namespaces: KeyNamespaces) -> Self {
        Self { store, namespaces }
    }

    /// Store key guarding `resource`.
    pub fn key_for(&self, resource: &str) -> String {
        self.namespaces.lock_key(resource)
    }

    /// Attempt to take the lock once.
    ///
    /// Returns `Ok(None)` when another owner holds it. A fresh owner token is
    /// generated for every call.
    pub async fn try_acquire(&self, resource: &str, ttl: Duration) -> CoordResult<Option<LockLease>> {
        let key = self.key_for(resource);
        let token = OwnerToken::generate();
        let acquired_at = Utc::now();

        if !self.store.set_if_absent(&key, token.as_str(), ttl).await? {
            tracing::debug!(key = %key, "Lock contended");
            return Ok(None);
        }

        tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
        Ok(Some(LockLease {
            resource: resource.to_string(),
            key,
            token,
            acquired_at,
            ttl,
        }))
    }

    /// Like [`try_acquire`](Self::try_acquire), reporting contention as
    /// [`CoordError::LockNotAcquired`].
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> CoordResult<LockLease> {
        self.try_acquire(resource, ttl)
            .await?
            .ok_or_else(|| CoordError::LockNotAcquired {
                resource: resource.to_string(),
            })
    }

    /// Release a lease.
    ///
    /// Returns `false` if the lease had lapsed and the key is now absent or
    /// owned by someone else. That is reported, not treated as an error.
    pub async fn release(&self, lease: &LockLease) -> CoordResult<bool> {
        self.release_key(&lease.key, &lease.token).await
    }

    /// Release by resource name and raw token.
    pub async fn release_token(&self, resource: &str, token: &OwnerToken) -> CoordResult<bool> {
        self.release_key(&self.key_for(resource), token).await
    }

    async fn release_key(&self, key: &str, token: &OwnerToken) -> CoordResult<bool> {
        let released = self.store.compare_and_delete(key, token.as_str()).await?;
        if released {
            tracing::debug!(key = %key, "Lock released");
        } else {
            tracing::warn!(key = %key, "Lock lapsed before release; not deleting");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvward_store::InMemoryStore;

    fn mutex() -> (Arc<InMemoryStore>, DistributedMutex) {
        let store = Arc::new(InMemoryStore::new());
        let mutex = DistributedMutex::new(store.clone(), KeyNamespaces::default());
        (store, mutex)
    }

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_acquire_writes_token_under_prefixed_key() {
        let (store, mutex) = mutex();
        let lease = mutex.try_acquire("shop:1", TTL).await.unwrap().unwrap();

        assert_eq!(lease.key(), "lock:shop:1");
        assert_eq!(lease.resource(), "shop:1");
        assert_eq!(
            store.get("lock:shop:1").await.unwrap().as_deref(),
            Some(lease.token().as_str())
        );
        assert!(store.ttl_of("lock:shop:1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_acquire_fails_while_held() {
        let (_, mutex) = mutex();
        let _lease = mutex.try_acquire("r", TTL).await.unwrap().unwrap();
        assert!(mutex.try_acquire("r", TTL).await.unwrap().is_none());
        assert!(matches!(
            mutex.acquire("r", TTL).await,
            Err(CoordError::LockNotAcquired { resource }) if resource == "r"
        ));
    }

    #[tokio::test]
    async fn test_tokens_are_unique_per_acquisition() {
        let (_, mutex) = mutex();
        let first = mutex.try_acquire("r", TTL).await.unwrap().unwrap();
        assert!(mutex.release(&first).await.unwrap());
        let second = mutex.try_acquire("r", TTL).await.unwrap().unwrap();
        assert_ne!(first.token(), second.token());
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_keeps_lock() {
        let (store, mutex) = mutex();
        let _lease = mutex.try_acquire("r", TTL).await.unwrap().unwrap();
        let stranger = OwnerToken::generate();

        assert!(!mutex.release_token("r", &stranger).await.unwrap());
        assert!(store.get("lock:r").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lapsed_lease_cannot_release_new_owner() {
        let (store, mutex) = mutex();
        let stale = mutex
            .try_acquire("r", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let fresh = mutex.try_acquire("r", TTL).await.unwrap().unwrap();
        assert!(!mutex.release(&stale).await.unwrap());
        assert_eq!(
            store.get("lock:r").await.unwrap().as_deref(),
            Some(fresh.token().as_str())
        );
        assert!(mutex.release(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_single_shot() {
        let (_, mutex) = mutex();
        let lease = mutex.try_acquire("r", TTL).await.unwrap().unwrap();
        assert!(mutex.release(&lease).await.unwrap());
        assert!(!mutex.release(&lease).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_one_concurrent_acquirer_wins() {
        let (_, mutex) = mutex();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let mutex = mutex.clone();
            handles.push(tokio::spawn(async move {
                mutex.try_acquire("hot", TTL).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_lease_expiry_arithmetic() {
        let acquired_at = Utc::now();
        let lease = LockLease {
            resource: "r".to_string(),
            key: "lock:r".to_string(),
            token: OwnerToken::generate(),
            acquired_at,
            ttl: Duration::from_secs(10),
        };

        assert!(!lease.is_expired(acquired_at));
        assert_eq!(lease.remaining(acquired_at), Some(Duration::from_secs(10)));

        let later = acquired_at + chrono::Duration::seconds(10);
        assert!(lease.is_expired(later));
        assert_eq!(lease.remaining(later), None);
    }
}
