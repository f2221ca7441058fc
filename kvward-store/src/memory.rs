//! In-process store backend.
//!
//! Every operation runs under one mutex acquisition, so the scripted
//! operations are indivisible exactly as they are on Redis. Expiry is lazy:
//! an expired entry is dropped the next time its key is touched, and every
//! [`SWEEP_EVERY`] expiring writes the whole keyspace is swept.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kvward_core::{StoreError, StoreResult};

use crate::{KvStore, ReserveReply};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Expiring writes between full sweeps of expired entries.
pub const SWEEP_EVERY: u64 = 64;

/// In-memory [`KvStore`] implementation.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    expiring_writes: AtomicU64,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Remaining TTL of a key. `Ok(None)` if the key is absent or has no TTL.
    pub fn ttl_of(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        Ok(live(&mut entries, key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    /// Members of a set key, sorted. Empty if absent.
    pub fn members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut entries = self.lock()?;
        match live(&mut entries, key, Instant::now()) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    /// Count an expiring write and sweep when one is due.
    fn after_expiring_write(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        let writes = self.expiring_writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            entries.retain(|_, entry| !entry.is_expired(now));
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> StoreResult<usize> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(entries.len())
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// Deadline for a TTL, `None` when it lies beyond what `Instant` can hold.
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

/// Look up a key, evicting it first if it has expired.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn string_value(entry: &Entry, key: &str) -> StoreResult<String> {
    match &entry.value {
        Value::Str(s) => Ok(s.clone()),
        Value::Set(_) => Err(StoreError::WrongType {
            key: key.to_string(),
        }),
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.lock()?;
        live(&mut entries, key, Instant::now())
            .map(|entry| string_value(entry, key))
            .transpose()
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        let expires_at = ttl.and_then(|ttl| deadline(now, ttl));
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        if expires_at.is_some() {
            self.after_expiring_write(&mut entries, now);
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        if live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        let expires_at = deadline(now, ttl);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        if expires_at.is_some() {
            self.after_expiring_write(&mut entries, now);
        }
        Ok(true)
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut entries = self.lock()?;
        match live(&mut entries, key, Instant::now()) {
            Some(entry) => {
                let current: i64 = string_value(entry, key)?
                    .parse()
                    .map_err(|_| StoreError::WrongType {
                        key: key.to_string(),
                    })?;
                let next = current.checked_add(1).ok_or_else(|| StoreError::Backend {
                    reason: format!("increment would overflow at {key}"),
                })?;
                entry.value = Value::Str(next.to_string());
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str("1".to_string()),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.lock()?;
        let existed = live(&mut entries, key, Instant::now()).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut entries = self.lock()?;
        let matches = match live(&mut entries, key, Instant::now()) {
            Some(Entry {
                value: Value::Str(current),
                ..
            }) => current == expected,
            _ => false,
        };
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn reserve(
        &self,
        stock_key: &str,
        buyers_key: &str,
        member: &str,
    ) -> StoreResult<ReserveReply> {
        let mut entries = self.lock()?;
        let now = Instant::now();

        let stock = match live(&mut entries, stock_key, now) {
            None => return Ok(ReserveReply::SoldOut),
            Some(entry) => string_value(entry, stock_key)?
                .parse::<i64>()
                .map_err(|_| StoreError::WrongType {
                    key: stock_key.to_string(),
                })?,
        };
        if stock <= 0 {
            return Ok(ReserveReply::SoldOut);
        }

        match live(&mut entries, buyers_key, now) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) if set.contains(member) => return Ok(ReserveReply::Duplicate),
            Some(Entry {
                value: Value::Str(_),
                ..
            }) => {
                return Err(StoreError::WrongType {
                    key: buyers_key.to_string(),
                })
            }
            _ => {}
        }

        if let Some(entry) = entries.get_mut(stock_key) {
            entry.value = Value::Str((stock - 1).to_string());
        }
        let buyers = entries.entry(buyers_key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        if let Value::Set(set) = &mut buyers.value {
            set.insert(member.to_string());
        }
        Ok(ReserveReply::Reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_absent_returns_none() {
        let store = InMemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_without_ttl_has_no_expiry() {
        let store = InMemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.ttl_of("k").unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire_lazily() {
        let store = InMemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.ttl_of("k").unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_set_if_absent_only_writes_once() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.set_if_absent("lock:a", "t1", ttl).await.unwrap());
        assert!(!store.set_if_absent("lock:a", "t2", ttl).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_set_if_absent_succeeds_after_expiry() {
        let store = InMemoryStore::new();
        assert!(store
            .set_if_absent("lock:a", "t1", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store
            .set_if_absent("lock:a", "t2", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_keys_are_swept_without_being_touched() {
        let store = InMemoryStore::new();
        for i in 0..10 {
            let key = format!("cache:shop:{i}");
            assert!(store
                .set_if_absent(&key, "", Duration::from_millis(5))
                .await
                .unwrap());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..(SWEEP_EVERY - 10) {
            store
                .set("cache:shop:hot", "{}", Some(Duration::from_secs(60)))
                .await
                .unwrap();
        }
        assert_eq!(store.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_huge_ttl_means_no_expiry() {
        let store = InMemoryStore::new();
        store.set("k", "v", Some(Duration::MAX)).await.unwrap();
        assert!(store.set_if_absent("lock:k", "t", Duration::MAX).await.unwrap());

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.ttl_of("k").unwrap(), None);
        assert_eq!(store.get("lock:k").await.unwrap().as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_increment_starts_at_one() {
        let store = InMemoryStore::new();
        assert_eq!(store.increment("c").await.unwrap(), 1);
        assert_eq!(store.increment("c").await.unwrap(), 2);
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_increment_rejects_non_integer() {
        let store = InMemoryStore::new();
        store.set("c", "abc", None).await.unwrap();
        assert!(matches!(
            store.increment("c").await,
            Err(StoreError::WrongType { .. })
        ));
    }

    #[tokio::test]
    async fn test_compare_and_delete_requires_match() {
        let store = InMemoryStore::new();
        store.set("lock:a", "owner", None).await.unwrap();
        assert!(!store.compare_and_delete("lock:a", "other").await.unwrap());
        assert!(store.get("lock:a").await.unwrap().is_some());
        assert!(store.compare_and_delete("lock:a", "owner").await.unwrap());
        assert!(store.get("lock:a").await.unwrap().is_none());
        assert!(!store.compare_and_delete("lock:a", "owner").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = InMemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_reserve_missing_stock_is_sold_out() {
        let store = InMemoryStore::new();
        let reply = store.reserve("stock", "buyers", "1").await.unwrap();
        assert_eq!(reply, ReserveReply::SoldOut);
        assert!(store.members("buyers").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reserve_decrements_and_records() {
        let store = InMemoryStore::new();
        store.set("stock", "2", None).await.unwrap();

        assert_eq!(
            store.reserve("stock", "buyers", "1").await.unwrap(),
            ReserveReply::Reserved
        );
        assert_eq!(
            store.reserve("stock", "buyers", "1").await.unwrap(),
            ReserveReply::Duplicate
        );
        assert_eq!(
            store.reserve("stock", "buyers", "2").await.unwrap(),
            ReserveReply::Reserved
        );
        assert_eq!(
            store.reserve("stock", "buyers", "3").await.unwrap(),
            ReserveReply::SoldOut
        );

        assert_eq!(store.get("stock").await.unwrap().as_deref(), Some("0"));
        assert_eq!(store.members("buyers").unwrap(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_get_on_set_is_wrong_type() {
        let store = InMemoryStore::new();
        store.set("stock", "1", None).await.unwrap();
        store.reserve("stock", "buyers", "1").await.unwrap();
        assert!(matches!(
            store.get("buyers").await,
            Err(StoreError::WrongType { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserve_never_oversells() {
        let store = Arc::new(InMemoryStore::new());
        store.set("stock", "5", None).await.unwrap();

        let mut handles = Vec::new();
        for user in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .reserve("stock", "buyers", &user.to_string())
                    .await
                    .unwrap()
            }));
        }

        let mut reserved = 0;
        for handle in handles {
            if handle.await.unwrap() == ReserveReply::Reserved {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 5);
        assert_eq!(store.get("stock").await.unwrap().as_deref(), Some("0"));
        assert_eq!(store.members("buyers").unwrap().len(), 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: set followed by get returns the written value
        #[test]
        fn prop_set_get_roundtrip(key in "[a-z:]{1,16}", value in ".*") {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let store = InMemoryStore::new();
            let read = rt.block_on(async {
                store.set(&key, &value, Some(Duration::from_secs(60))).await.unwrap();
                store.get(&key).await.unwrap()
            });
            prop_assert_eq!(read, Some(value));
        }
    }
}
