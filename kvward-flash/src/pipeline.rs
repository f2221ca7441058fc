//! Asynchronous order persistence.
//!
//! Accepted reservations are pushed onto a bounded queue and drained by a
//! fixed set of workers. For each order a worker:
//!
//! 1. takes the per-user lock `{lock_prefix}{order_lock_prefix}{user_id}`,
//! 2. skips the order if one already exists for `(voucher, user)`,
//! 3. creates it in the [`OrderStore`] in one transaction,
//! 4. releases the lock.
//!
//! Failed attempts, including a busy user lock, are retried with linear
//! backoff up to `max_attempts`; after that the order is logged and dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use kvward_core::{FlashSaleError, FlashSaleSettings, KeyNamespaces, VoucherOrder};
use kvward_coord::DistributedMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::order_store::{OrderStore, PersistOutcome};
use crate::FlashSaleResult;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the order pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    pub max_attempts: u32,
    /// Attempt `n` waits `n * retry_backoff` before the next one.
    pub retry_backoff: Duration,
    pub order_lock_ttl: Duration,
    pub namespaces: KeyNamespaces,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(&FlashSaleSettings::default(), KeyNamespaces::default())
    }
}

impl PipelineConfig {
    pub fn new(settings: &FlashSaleSettings, namespaces: KeyNamespaces) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            workers: settings.workers,
            max_attempts: settings.max_attempts,
            retry_backoff: settings.retry_backoff,
            order_lock_ttl: settings.order_lock_ttl,
            namespaces,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_backoff = backoff;
        self
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for order persistence.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Orders accepted onto the queue
    pub enqueued: AtomicU64,

    /// Orders durably created
    pub persisted: AtomicU64,

    /// Orders skipped because one already existed for the same user
    pub duplicates_skipped: AtomicU64,

    /// Orders refused because durable stock ran out
    pub out_of_stock: AtomicU64,

    /// Attempts that failed and were retried
    pub retries: AtomicU64,

    /// Orders dropped after exhausting every attempt
    pub failures: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            out_of_stock: self.out_of_stock.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pipeline metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub enqueued: u64,
    pub persisted: u64,
    pub duplicates_skipped: u64,
    pub out_of_stock: u64,
    pub retries: u64,
    pub failures: u64,
}

impl PipelineStats {
    /// Orders that reached a final state.
    pub fn settled(&self) -> u64 {
        self.persisted + self.duplicates_skipped + self.out_of_stock + self.failures
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

struct Worker {
    order_store: Arc<dyn OrderStore>,
    mutex: DistributedMutex,
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
}

/// Bounded queue of accepted orders and the workers draining it.
pub struct OrderPipeline {
    sender: RwLock<Option<mpsc::Sender<VoucherOrder>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<PipelineMetrics>,
}

impl std::fmt::Debug for OrderPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderPipeline")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl OrderPipeline {
    /// Spawn `config.workers` workers on the current tokio runtime.
    pub fn start(
        order_store: Arc<dyn OrderStore>,
        mutex: DistributedMutex,
        config: PipelineConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let metrics = Arc::new(PipelineMetrics::new());

        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            max_attempts = config.max_attempts,
            "Order pipeline started"
        );

        let worker = Arc::new(Worker {
            order_store,
            mutex,
            config,
            metrics: metrics.clone(),
        });
        let handles = (0..worker.config.workers.max(1))
            .map(|index| {
                let worker = worker.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move { worker.run(index, receiver).await })
            })
            .collect();

        Self {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(handles),
            metrics,
        }
    }

    /// Queue an order for persistence, waiting for room if the queue is full.
    ///
    /// Fails with [`FlashSaleError::QueueClosed`] after [`shutdown`](Self::shutdown).
    pub async fn enqueue(&self, order: VoucherOrder) -> FlashSaleResult<()> {
        let sender = self
            .sender
            .read()
            .map_err(|_| FlashSaleError::QueueClosed)?
            .clone()
            .ok_or(FlashSaleError::QueueClosed)?;
        sender
            .send(order)
            .await
            .map_err(|_| FlashSaleError::QueueClosed)?;
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        self.metrics.snapshot()
    }

    /// Close the queue, let the workers drain it, and wait for them.
    ///
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) -> PipelineStats {
        if let Ok(mut sender) = self.sender.write() {
            sender.take();
        }
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Order worker panicked");
            }
        }

        let stats = self.stats();
        tracing::info!(
            persisted = stats.persisted,
            duplicates_skipped = stats.duplicates_skipped,
            out_of_stock = stats.out_of_stock,
            failures = stats.failures,
            "Order pipeline stopped"
        );
        stats
    }
}

impl Worker {
    async fn run(&self, index: usize, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<VoucherOrder>>>) {
        loop {
            let next = receiver.lock().await.recv().await;
            match next {
                Some(order) => self.process(order).await,
                None => break,
            }
        }
        tracing::debug!(worker = index, "Order worker exiting");
    }

    async fn process(&self, order: VoucherOrder) {
        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.persist_once(&order).await {
                Ok(outcome) => {
                    self.record(&order, outcome);
                    return;
                }
                Err(e) if attempt < max_attempts => {
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        order_id = %order.id,
                        user_id = %order.user_id,
                        attempt,
                        error = %e,
                        "Order persistence failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) => {
                    self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        order_id = %order.id,
                        user_id = %order.user_id,
                        voucher_id = %order.voucher_id,
                        attempts = max_attempts,
                        error = %e,
                        "Order dropped after exhausting retries"
                    );
                }
            }
        }
    }

    async fn persist_once(&self, order: &VoucherOrder) -> FlashSaleResult<PersistOutcome> {
        let resource = self.config.namespaces.order_lock_resource(order.user_id);
        let lease = self
            .mutex
            .acquire(&resource, self.config.order_lock_ttl)
            .await?;

        let result = match self
            .order_store
            .find_order(order.voucher_id, order.user_id)
            .await
        {
            Ok(Some(_)) => Ok(PersistOutcome::AlreadyExists),
            Ok(None) => self.order_store.create_order(order).await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.mutex.release(&lease).await {
            tracing::error!(resource = %resource, error = %e, "Failed to release order lock");
        }
        result
    }

    fn record(&self, order: &VoucherOrder, outcome: PersistOutcome) {
        match outcome {
            PersistOutcome::Created => {
                self.metrics.persisted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    voucher_id = %order.voucher_id,
                    "Order persisted"
                );
            }
            PersistOutcome::AlreadyExists => {
                self.metrics.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    voucher_id = %order.voucher_id,
                    "Duplicate order skipped"
                );
            }
            PersistOutcome::OutOfStock => {
                self.metrics.out_of_stock.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    order_id = %order.id,
                    voucher_id = %order.voucher_id,
                    "Durable stock exhausted for a reserved order"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_store::InMemoryOrderStore;
    use chrono::Utc;
    use kvward_core::{OrderId, UserId, VoucherId};
    use kvward_store::{InMemoryStore, KvStore};

    fn setup(config: PipelineConfig) -> (Arc<InMemoryStore>, Arc<InMemoryOrderStore>, OrderPipeline) {
        let store = Arc::new(InMemoryStore::new());
        let orders = Arc::new(InMemoryOrderStore::new());
        orders.seed_stock(VoucherId(1), 100).unwrap();
        let mutex = DistributedMutex::new(store.clone(), config.namespaces.clone());
        let pipeline = OrderPipeline::start(orders.clone(), mutex, config);
        (store, orders, pipeline)
    }

    fn fast() -> PipelineConfig {
        PipelineConfig::default().with_retry(3, Duration::from_millis(5))
    }

    fn order(id: i64, user: i64) -> VoucherOrder {
        VoucherOrder::new(OrderId(id), UserId(user), VoucherId(1), Utc::now())
    }

    #[tokio::test]
    async fn test_orders_are_persisted() {
        let (_, orders, pipeline) = setup(fast());
        for user in 1..=5 {
            pipeline.enqueue(order(100 + user, user)).await.unwrap();
        }
        let stats = pipeline.shutdown().await;

        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.persisted, 5);
        assert_eq!(orders.orders().unwrap().len(), 5);
        assert_eq!(orders.stock_of(VoucherId(1)).unwrap(), Some(95));
    }

    #[tokio::test]
    async fn test_same_order_twice_persists_once() {
        let (_, orders, pipeline) = setup(fast().with_workers(4));
        pipeline.enqueue(order(7, 1)).await.unwrap();
        pipeline.enqueue(order(7, 1)).await.unwrap();
        let stats = pipeline.shutdown().await;

        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.duplicates_skipped, 1);
        assert_eq!(orders.orders().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (_, orders, pipeline) = setup(fast());
        orders.fail_next_creates(2);
        pipeline.enqueue(order(7, 1)).await.unwrap();
        let stats = pipeline.shutdown().await;

        assert_eq!(stats.retries, 2);
        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_order_dropped_after_max_attempts() {
        let (store, orders, pipeline) = setup(fast());
        orders.fail_next_creates(10);
        pipeline.enqueue(order(7, 1)).await.unwrap();
        let stats = pipeline.shutdown().await;

        assert_eq!(stats.failures, 1);
        assert_eq!(stats.retries, 2);
        assert!(orders.orders().unwrap().is_empty());
        assert_eq!(store.get("lock:order:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_busy_user_lock_is_retried() {
        let config = PipelineConfig::default().with_retry(5, Duration::from_millis(20));
        let (store, orders, pipeline) = setup(config);
        let mutex = DistributedMutex::new(store.clone(), KeyNamespaces::default());
        let held = mutex
            .try_acquire("order:1", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        pipeline.enqueue(order(7, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(orders.orders().unwrap().is_empty());
        assert!(mutex.release(&held).await.unwrap());

        let stats = pipeline.shutdown().await;
        assert_eq!(stats.persisted, 1);
        assert!(stats.retries >= 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let (_, _, pipeline) = setup(fast());
        pipeline.shutdown().await;
        assert_eq!(
            pipeline.enqueue(order(7, 1)).await,
            Err(FlashSaleError::QueueClosed)
        );
        pipeline.shutdown().await;
    }

    #[test]
    fn test_config_from_settings() {
        let settings = FlashSaleSettings {
            workers: 3,
            queue_capacity: 8,
            ..FlashSaleSettings::default()
        };
        let config = PipelineConfig::new(&settings, KeyNamespaces::default());
        assert_eq!(config.workers, 3);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.max_attempts, settings.max_attempts);
    }
}
