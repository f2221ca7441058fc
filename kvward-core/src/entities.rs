//! Domain records shared between the cache, coordination and flash-sale crates.

use crate::identity::{OrderId, Timestamp, UserId, VoucherId};
use serde::{Deserialize, Serialize};

// ============================================================================
// FLASH VOUCHER
// ============================================================================

/// Where a point in time falls relative to a voucher's sale window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SalePhase {
    /// Before `begin_time`.
    NotStarted,
    /// Inside `[begin_time, end_time]`.
    Active,
    /// After `end_time`.
    Ended,
}

/// A time-windowed, stock-limited voucher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashVoucher {
    pub voucher_id: VoucherId,
    /// Units available when the voucher is published.
    pub stock: i64,
    pub begin_time: Timestamp,
    pub end_time: Timestamp,
}

impl FlashVoucher {
    /// Create a voucher with the given stock and window.
    pub fn new(voucher_id: VoucherId, stock: i64, begin_time: Timestamp, end_time: Timestamp) -> Self {
        Self {
            voucher_id,
            stock,
            begin_time,
            end_time,
        }
    }

    /// Classify `now` against the sale window. Both bounds are inclusive.
    pub fn phase_at(&self, now: Timestamp) -> SalePhase {
        if now < self.begin_time {
            SalePhase::NotStarted
        } else if now > self.end_time {
            SalePhase::Ended
        } else {
            SalePhase::Active
        }
    }
}

// ============================================================================
// VOUCHER ORDER
// ============================================================================

/// A durable order created after a successful reservation.
///
/// Unique per `(voucher_id, user_id)`; immutable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherOrder {
    pub id: OrderId,
    pub user_id: UserId,
    pub voucher_id: VoucherId,
    pub created_at: Timestamp,
}

impl VoucherOrder {
    pub fn new(id: OrderId, user_id: UserId, voucher_id: VoucherId, created_at: Timestamp) -> Self {
        Self {
            id,
            user_id,
            voucher_id,
            created_at,
        }
    }

    /// The idempotency key for persistence.
    pub fn dedup_key(&self) -> (VoucherId, UserId) {
        (self.voucher_id, self.user_id)
    }
}
