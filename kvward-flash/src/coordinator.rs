//! Flash-sale admission.
//!
//! The hot path touches only the key-value store: one read of the published
//! voucher, one counter increment, one atomic reserve. The order id is taken
//! before the reserve, so a failed allocation leaves stock and purchasers
//! untouched. Durable persistence happens later on the [`OrderPipeline`].

use std::sync::Arc;

use chrono::Utc;
use kvward_core::{
    FlashSaleError, FlashVoucher, KeyNamespaces, OrderId, SalePhase, Timestamp, UserId,
    VoucherId, VoucherOrder,
};
use kvward_coord::IdGenerator;
use kvward_store::{KvStore, ReserveReply};
use serde::Serialize;

use crate::pipeline::{OrderPipeline, PipelineStats};
use crate::FlashSaleResult;

/// Answer to a purchase attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReservationOutcome {
    /// A unit was reserved and an order queued under `order_id`.
    Accepted { order_id: OrderId },
    /// No stock remains.
    SoldOut,
    /// The user already holds a reservation for this voucher.
    Duplicate,
    /// The sale window has not opened.
    NotStarted,
    /// The sale window has closed.
    Ended,
}

impl ReservationOutcome {
    /// Numeric reason code: 0 accepted, 1 sold out, 2 duplicate,
    /// 3 not started, 4 ended.
    pub fn code(&self) -> u8 {
        match self {
            Self::Accepted { .. } => 0,
            Self::SoldOut => 1,
            Self::Duplicate => 2,
            Self::NotStarted => 3,
            Self::Ended => 4,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            Self::Accepted { order_id } => Some(*order_id),
            _ => None,
        }
    }
}

/// Outcome for a reserve reply that did not reserve anything.
fn rejection(reply: ReserveReply) -> Option<ReservationOutcome> {
    match reply {
        ReserveReply::Reserved => None,
        ReserveReply::SoldOut => Some(ReservationOutcome::SoldOut),
        ReserveReply::Duplicate => Some(ReservationOutcome::Duplicate),
    }
}

/// Admits purchase attempts against published vouchers.
pub struct FlashSaleCoordinator {
    store: Arc<dyn KvStore>,
    ids: IdGenerator,
    pipeline: OrderPipeline,
    namespaces: KeyNamespaces,
    order_tag: String,
}

impl std::fmt::Debug for FlashSaleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashSaleCoordinator")
            .field("namespaces", &self.namespaces)
            .field("order_tag", &self.order_tag)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl FlashSaleCoordinator {
    pub fn new(
        store: Arc<dyn KvStore>,
        ids: IdGenerator,
        pipeline: OrderPipeline,
        namespaces: KeyNamespaces,
        order_tag: impl Into<String>,
    ) -> Self {
        Self {
            store,
            ids,
            pipeline,
            namespaces,
            order_tag: order_tag.into(),
        }
    }

    pub fn pipeline(&self) -> &OrderPipeline {
        &self.pipeline
    }

    /// Make a voucher purchasable.
    ///
    /// Writes the window and the remaining stock without expiry and clears
    /// any purchaser set left from an earlier publication.
    pub async fn publish(&self, voucher: &FlashVoucher) -> FlashSaleResult<()> {
        if voucher.stock < 0 {
            return Err(FlashSaleError::InvalidVoucher {
                voucher_id: voucher.voucher_id,
                reason: format!("negative stock {}", voucher.stock),
            });
        }
        if voucher.begin_time > voucher.end_time {
            return Err(FlashSaleError::InvalidVoucher {
                voucher_id: voucher.voucher_id,
                reason: "begin_time is after end_time".to_string(),
            });
        }

        let record = serde_json::to_string(voucher).map_err(|e| FlashSaleError::InvalidVoucher {
            voucher_id: voucher.voucher_id,
            reason: e.to_string(),
        })?;
        let id = voucher.voucher_id;
        self.store
            .set(&self.namespaces.voucher_key(id), &record, None)
            .await?;
        self.store
            .set(&self.namespaces.stock_key(id), &voucher.stock.to_string(), None)
            .await?;
        self.store.delete(&self.namespaces.buyers_key(id)).await?;

        tracing::info!(
            voucher_id = %id,
            stock = voucher.stock,
            begin = %voucher.begin_time,
            end = %voucher.end_time,
            "Voucher published"
        );
        Ok(())
    }

    /// The published voucher, if any.
    pub async fn voucher(&self, voucher_id: VoucherId) -> FlashSaleResult<Option<FlashVoucher>> {
        let Some(raw) = self.store.get(&self.namespaces.voucher_key(voucher_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| FlashSaleError::CorruptVoucher {
                voucher_id,
                reason: e.to_string(),
            })
    }

    /// Units still reservable, `None` if the voucher was never published.
    pub async fn remaining_stock(&self, voucher_id: VoucherId) -> FlashSaleResult<Option<i64>> {
        let Some(raw) = self.store.get(&self.namespaces.stock_key(voucher_id)).await? else {
            return Ok(None);
        };
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|_| FlashSaleError::CorruptVoucher {
                voucher_id,
                reason: format!("stock is not an integer: {raw:?}"),
            })
    }

    /// Attempt a purchase now.
    pub async fn submit(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> FlashSaleResult<ReservationOutcome> {
        self.submit_at(voucher_id, user_id, Utc::now()).await
    }

    /// Attempt a purchase as if the clock read `now`.
    ///
    /// If the order cannot be queued after a unit was reserved the error is
    /// returned and the reserved unit is not handed back.
    pub async fn submit_at(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
        now: Timestamp,
    ) -> FlashSaleResult<ReservationOutcome> {
        let voucher = self
            .voucher(voucher_id)
            .await?
            .ok_or(FlashSaleError::UnknownVoucher { voucher_id })?;
        match voucher.phase_at(now) {
            SalePhase::NotStarted => return Ok(ReservationOutcome::NotStarted),
            SalePhase::Ended => return Ok(ReservationOutcome::Ended),
            SalePhase::Active => {}
        }

        let order_id = OrderId(self.ids.next_id_at(&self.order_tag, now).await?);
        let reply = self
            .store
            .reserve(
                &self.namespaces.stock_key(voucher_id),
                &self.namespaces.buyers_key(voucher_id),
                &user_id.to_string(),
            )
            .await?;
        if let Some(rejected) = rejection(reply) {
            tracing::debug!(
                voucher_id = %voucher_id,
                user_id = %user_id,
                code = rejected.code(),
                "Reservation rejected"
            );
            return Ok(rejected);
        }

        let order = VoucherOrder::new(order_id, user_id, voucher_id, now);
        if let Err(e) = self.pipeline.enqueue(order).await {
            tracing::error!(
                voucher_id = %voucher_id,
                user_id = %user_id,
                order_id = %order_id,
                error = %e,
                "Reserved unit could not be queued for persistence"
            );
            return Err(e);
        }

        tracing::debug!(
            voucher_id = %voucher_id,
            user_id = %user_id,
            order_id = %order_id,
            "Reservation accepted"
        );
        Ok(ReservationOutcome::Accepted { order_id })
    }

    /// Stop accepting orders and drain the pipeline.
    pub async fn shutdown(&self) -> PipelineStats {
        self.pipeline.shutdown().await
    }
}
