//! KVWARD Core - Shared Types
//!
//! Identity newtypes, domain records, the error taxonomy and configuration.
//! All other crates depend on this. No store access happens here.

pub mod config;
pub mod entities;
pub mod error;
pub mod identity;

pub use config::{
    CacheSettings, FlashSaleSettings, IdSettings, KeyNamespaces, KvwardConfig, StoreSettings,
};
pub use entities::{FlashVoucher, SalePhase, VoucherOrder};
pub use error::{
    CacheError, ConfigError, CoordError, FlashSaleError, KvwardError, KvwardResult, LoaderError,
    StoreError, StoreResult,
};
pub use identity::{OrderId, OwnerToken, Timestamp, UserId, VoucherId};
