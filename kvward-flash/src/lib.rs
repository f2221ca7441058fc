//! KVWARD Flash - Flash-Sale Coordination
//!
//! Admits purchase attempts for time-windowed, stock-limited vouchers using
//! one atomic reserve in the key-value store, then persists the resulting
//! orders asynchronously.
//!
//! - [`FlashSaleCoordinator`]: publish vouchers and answer purchase attempts
//! - [`OrderPipeline`]: bounded queue and workers writing orders durably
//! - [`OrderStore`]: the durable side, with [`InMemoryOrderStore`] for tests
//!   and single-process use

pub mod coordinator;
pub mod order_store;
pub mod pipeline;

pub use coordinator::{FlashSaleCoordinator, ReservationOutcome};
pub use order_store::{InMemoryOrderStore, OrderStore, PersistOutcome};
pub use pipeline::{OrderPipeline, PipelineConfig, PipelineMetrics, PipelineStats};

use kvward_core::FlashSaleError;

/// Result type alias for flash-sale operations.
pub type FlashSaleResult<T> = Result<T, FlashSaleError>;
