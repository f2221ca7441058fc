//! Durable order persistence boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kvward_core::{FlashSaleError, UserId, VoucherId, VoucherOrder};

use crate::FlashSaleResult;

/// Result of one transactional order insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistOutcome {
    /// Durable stock decremented and the order inserted.
    Created,
    /// An order for the same `(voucher, user)` already exists; nothing changed.
    AlreadyExists,
    /// Durable stock was not positive; nothing changed.
    OutOfStock,
}

/// The relational side of a flash sale.
///
/// `create_order` must be one transaction: decrement durable stock where it
/// is still positive and insert the order, unique on `(voucher_id, user_id)`.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_order(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> FlashSaleResult<Option<VoucherOrder>>;

    async fn create_order(&self, order: &VoucherOrder) -> FlashSaleResult<PersistOutcome>;
}

#[derive(Debug, Default)]
struct Tables {
    stock: HashMap<VoucherId, i64>,
    orders: HashMap<(VoucherId, UserId), VoucherOrder>,
}

/// In-memory [`OrderStore`] with a stock table and an order table.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    tables: Mutex<Tables>,
    failures_pending: AtomicU32,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> FlashSaleResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| FlashSaleError::Persistence {
            reason: "order tables lock poisoned".to_string(),
        })
    }

    /// Set the durable stock of a voucher.
    pub fn seed_stock(&self, voucher_id: VoucherId, stock: i64) -> FlashSaleResult<()> {
        self.tables()?.stock.insert(voucher_id, stock);
        Ok(())
    }

    pub fn stock_of(&self, voucher_id: VoucherId) -> FlashSaleResult<Option<i64>> {
        Ok(self.tables()?.stock.get(&voucher_id).copied())
    }

    /// All persisted orders, ordered by id.
    pub fn orders(&self) -> FlashSaleResult<Vec<VoucherOrder>> {
        let mut orders: Vec<VoucherOrder> = self.tables()?.orders.values().cloned().collect();
        orders.sort_by_key(|order| order.id);
        Ok(orders)
    }

    /// Make the next `count` calls to `create_order` fail before touching
    /// any table.
    pub fn fail_next_creates(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn find_order(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> FlashSaleResult<Option<VoucherOrder>> {
        Ok(self.tables()?.orders.get(&(voucher_id, user_id)).cloned())
    }

    async fn create_order(&self, order: &VoucherOrder) -> FlashSaleResult<PersistOutcome> {
        if self.take_injected_failure() {
            return Err(FlashSaleError::Persistence {
                reason: "injected failure".to_string(),
            });
        }

        let mut tables = self.tables()?;
        if tables.orders.contains_key(&order.dedup_key()) {
            return Ok(PersistOutcome::AlreadyExists);
        }
        match tables.stock.get_mut(&order.voucher_id) {
            Some(stock) if *stock > 0 => *stock -= 1,
            _ => return Ok(PersistOutcome::OutOfStock),
        }
        tables.orders.insert(order.dedup_key(), order.clone());
        Ok(PersistOutcome::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kvward_core::OrderId;

    fn order(id: i64, user: i64) -> VoucherOrder {
        VoucherOrder::new(OrderId(id), UserId(user), VoucherId(1), Utc::now())
    }

    #[tokio::test]
    async fn test_create_decrements_durable_stock() {
        let store = InMemoryOrderStore::new();
        store.seed_stock(VoucherId(1), 1).unwrap();

        assert_eq!(store.create_order(&order(10, 1)).await.unwrap(), PersistOutcome::Created);
        assert_eq!(store.stock_of(VoucherId(1)).unwrap(), Some(0));
        assert_eq!(
            store.create_order(&order(11, 2)).await.unwrap(),
            PersistOutcome::OutOfStock
        );
        assert_eq!(store.orders().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_is_unique_per_voucher_and_user() {
        let store = InMemoryOrderStore::new();
        store.seed_stock(VoucherId(1), 5).unwrap();

        store.create_order(&order(10, 1)).await.unwrap();
        assert_eq!(
            store.create_order(&order(12, 1)).await.unwrap(),
            PersistOutcome::AlreadyExists
        );
        assert_eq!(store.stock_of(VoucherId(1)).unwrap(), Some(4));
        assert_eq!(
            store.find_order(VoucherId(1), UserId(1)).await.unwrap().map(|o| o.id),
            Some(OrderId(10))
        );
    }

    #[tokio::test]
    async fn test_unknown_voucher_is_out_of_stock() {
        let store = InMemoryOrderStore::new();
        assert_eq!(
            store.create_order(&order(10, 1)).await.unwrap(),
            PersistOutcome::OutOfStock
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = InMemoryOrderStore::new();
        store.seed_stock(VoucherId(1), 5).unwrap();
        store.fail_next_creates(2);

        assert!(store.create_order(&order(10, 1)).await.is_err());
        assert!(store.create_order(&order(10, 1)).await.is_err());
        assert_eq!(store.create_order(&order(10, 1)).await.unwrap(), PersistOutcome::Created);
    }
}
