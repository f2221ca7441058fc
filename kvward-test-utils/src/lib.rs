//! KVWARD Test Utilities
//!
//! Shared test infrastructure for the KVWARD workspace:
//! - Tracing setup for test output
//! - A scriptable record source implementing [`Loader`]
//! - Proptest generators for ids and vouchers
//! - Fixtures wiring components over one in-memory store
//! - Assertions for KVWARD error variants

pub use kvward_cache::{CacheClient, CacheConfig, CacheLookup, Loader, RebuildPool};
pub use kvward_coord::{DistributedMutex, IdGenerator};
pub use kvward_core::{
    CoordError, FlashSaleError, FlashVoucher, IdSettings, KeyNamespaces, KvwardConfig,
    LoaderError, OrderId, SalePhase, StoreError, Timestamp, UserId, VoucherId, VoucherOrder,
};
pub use kvward_store::{InMemoryStore, KvStore};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber for test output.
///
/// Filtered by `RUST_LOG`, defaulting to `warn`. Safe to call from every test.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// MOCK LOADER
// ============================================================================

/// In-memory durable source for cache tests.
///
/// Counts every load, can be told to fail, and can be slowed down to widen
/// race windows.
#[derive(Debug)]
pub struct MockLoader<T> {
    records: Mutex<HashMap<i64, T>>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Duration,
}

impl<T> Default for MockLoader<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }
}

impl<T: Clone> MockLoader<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, id: i64, record: T) -> Self {
        self.insert(id, record);
        self
    }

    /// Sleep this long inside every load.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Write a record, as a durable update would.
    pub fn insert(&self, id: i64, record: T) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(id, record);
        }
    }

    pub fn remove(&self, id: i64) -> Option<T> {
        self.records.lock().ok().and_then(|mut records| records.remove(&id))
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of loads so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T> Loader<i64, T> for MockLoader<T>
where
    T: Clone + Send + Sync,
{
    async fn load(&self, id: &i64) -> Result<Option<T>, LoaderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(LoaderError::new(format!("source unavailable for {id}")));
        }
        let records = self
            .records
            .lock()
            .map_err(|_| LoaderError::new("records lock poisoned"))?;
        Ok(records.get(id).cloned())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for KVWARD types.

    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    pub fn arb_voucher_id() -> impl Strategy<Value = VoucherId> {
        (1_i64..1_000_000).prop_map(VoucherId)
    }

    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        (1_i64..10_000_000).prop_map(UserId)
    }

    /// A timestamp between 2022-01-01 and 2030-01-01.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_640_995_200_i64..1_893_456_000_i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
        })
    }

    /// A voucher with a well-formed window of up to a week.
    pub fn arb_flash_voucher() -> impl Strategy<Value = FlashVoucher> {
        (arb_voucher_id(), 0_i64..1_000, arb_timestamp(), 0_i64..604_800).prop_map(
            |(voucher_id, stock, begin, window_secs)| {
                FlashVoucher::new(
                    voucher_id,
                    stock,
                    begin,
                    begin + ChronoDuration::seconds(window_secs),
                )
            },
        )
    }

    /// Id settings that pass validation and leave room for decades of
    /// timestamps.
    pub fn arb_id_settings() -> impl Strategy<Value = IdSettings> {
        (1_600_000_000_i64..1_640_995_200, 8_u32..=32).prop_map(|(epoch_seconds, counter_bits)| {
            IdSettings {
                epoch_seconds,
                counter_bits,
            }
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Components wired over one shared [`InMemoryStore`].

    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    /// Voucher whose window started an hour ago and ends in an hour.
    pub fn active_voucher(voucher_id: i64, stock: i64) -> FlashVoucher {
        let now = Utc::now();
        FlashVoucher::new(
            VoucherId(voucher_id),
            stock,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
        )
    }

    /// Voucher whose window opens in an hour.
    pub fn upcoming_voucher(voucher_id: i64, stock: i64) -> FlashVoucher {
        let now = Utc::now();
        FlashVoucher::new(
            VoucherId(voucher_id),
            stock,
            now + ChronoDuration::hours(1),
            now + ChronoDuration::hours(2),
        )
    }

    /// Voucher whose window closed an hour ago.
    pub fn ended_voucher(voucher_id: i64, stock: i64) -> FlashVoucher {
        let now = Utc::now();
        FlashVoucher::new(
            VoucherId(voucher_id),
            stock,
            now - ChronoDuration::hours(2),
            now - ChronoDuration::hours(1),
        )
    }

    pub fn shared_store() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore::new())
    }

    pub fn mutex(store: &Arc<InMemoryStore>) -> DistributedMutex {
        DistributedMutex::new(store.clone(), KeyNamespaces::default())
    }

    pub fn id_generator(store: &Arc<InMemoryStore>) -> IdGenerator {
        IdGenerator::new(store.clone(), KeyNamespaces::default(), IdSettings::default())
    }

    /// A cache client as one process would build it, with a small rebuild
    /// pool.
    pub fn cache_client(store: &Arc<InMemoryStore>) -> CacheClient {
        CacheClient::new(
            store.clone(),
            mutex(store),
            RebuildPool::new(4),
            CacheConfig::default(),
        )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for KVWARD-specific outcomes.

    use super::*;

    #[track_caller]
    pub fn assert_lock_not_acquired<T: std::fmt::Debug>(result: &Result<T, CoordError>) {
        match result {
            Err(CoordError::LockNotAcquired { .. }) => {}
            other => panic!("Expected LockNotAcquired, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_unknown_voucher<T: std::fmt::Debug>(
        result: &Result<T, FlashSaleError>,
        expected: VoucherId,
    ) {
        match result {
            Err(FlashSaleError::UnknownVoucher { voucher_id }) if *voucher_id == expected => {}
            other => panic!("Expected UnknownVoucher({}), got: {:?}", expected, other),
        }
    }

    /// Assert that a key is absent from the store.
    pub async fn assert_key_absent(store: &InMemoryStore, key: &str) {
        let value = store.get(key).await;
        assert!(
            matches!(value, Ok(None)),
            "Expected {key} to be absent, got: {:?}",
            value
        );
    }

    /// Poll until `key` disappears, failing after `timeout`.
    pub async fn wait_for_key_absent(store: &InMemoryStore, key: &str, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if matches!(store.get(key).await, Ok(None)) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{key} still present after {:?}",
                timeout
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_voucher_fixtures_phases() {
        let now = chrono::Utc::now();
        assert_eq!(fixtures::active_voucher(1, 5).phase_at(now), SalePhase::Active);
        assert_eq!(fixtures::upcoming_voucher(1, 5).phase_at(now), SalePhase::NotStarted);
        assert_eq!(fixtures::ended_voucher(1, 5).phase_at(now), SalePhase::Ended);
    }

    #[tokio::test]
    async fn test_mock_loader_counts_and_fails() {
        let loader = MockLoader::new().with_record(1, "one".to_string());
        assert_eq!(loader.load(&1_i64).await.unwrap(), Some("one".to_string()));
        assert_eq!(loader.load(&2_i64).await.unwrap(), None);

        loader.set_failing(true);
        assert!(loader.load(&1_i64).await.is_err());
        assert_eq!(loader.calls(), 3);

        loader.set_failing(false);
        assert_eq!(loader.remove(1), Some("one".to_string()));
        assert_eq!(loader.load(&1_i64).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fixtures_share_one_store() {
        let store = fixtures::shared_store();
        let a = fixtures::mutex(&store);
        let b = fixtures::mutex(&store);

        let lease = a
            .acquire("shared", Duration::from_secs(5))
            .await
            .unwrap();
        assertions::assert_lock_not_acquired(&b.acquire("shared", Duration::from_secs(5)).await);
        assert!(a.release(&lease).await.unwrap());
        assertions::assert_key_absent(&store, "lock:shared").await;
    }

    #[test]
    fn test_init_test_tracing_is_idempotent() {
        init_test_tracing();
        init_test_tracing();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_vouchers_are_well_formed(voucher in generators::arb_flash_voucher()) {
            prop_assert!(voucher.begin_time <= voucher.end_time);
            prop_assert!(voucher.stock >= 0);
            prop_assert_eq!(voucher.phase_at(voucher.begin_time), SalePhase::Active);
            prop_assert_eq!(voucher.phase_at(voucher.end_time), SalePhase::Active);
        }

        #[test]
        fn prop_generated_id_settings_validate(ids in generators::arb_id_settings()) {
            let config = KvwardConfig::default().with_ids(ids);
            prop_assert!(config.validate().is_ok());
        }
    }
}
