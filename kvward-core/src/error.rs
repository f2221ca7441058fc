//! Error types for KVWARD operations

use crate::identity::VoucherId;
use std::fmt;
use thiserror::Error;

/// Key-value store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store command failed: {reason}")]
    Backend { reason: String },

    #[error("Store connection pool error: {reason}")]
    Pool { reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Wrong value type stored under key {key}")]
    WrongType { key: String },

    #[error("Unexpected store reply: {reason}")]
    UnexpectedReply { reason: String },
}

/// Failure reported by a caller-supplied loader while reaching the durable store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Loader failed: {reason}")]
pub struct LoaderError {
    pub reason: String,
}

impl LoaderError {
    pub fn new(reason: impl fmt::Display) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

/// Cache client errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Corrupt cache entry at {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Lock and id generator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordError {
    #[error("Lock not acquired: {resource}")]
    LockNotAcquired { resource: String },

    #[error("Clock reads {now_secs}s, before the id epoch {epoch_secs}s")]
    ClockBeforeEpoch { now_secs: i64, epoch_secs: i64 },

    #[error("Sequence exhausted for {tag}: counter {counter} exceeds {bits} bits")]
    SequenceExhausted { tag: String, counter: i64, bits: u32 },

    #[error("{elapsed_secs}s since the id epoch no longer fit beside {bits} counter bits")]
    TimestampOverflow { elapsed_secs: i64, bits: u32 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Flash-sale coordinator errors.
///
/// Sold-out, duplicate and window outcomes are not errors; they are
/// reported as ordinary reservation outcomes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlashSaleError {
    #[error("Voucher {voucher_id} is not published")]
    UnknownVoucher { voucher_id: VoucherId },

    #[error("Invalid voucher {voucher_id}: {reason}")]
    InvalidVoucher { voucher_id: VoucherId, reason: String },

    #[error("Corrupt voucher record for {voucher_id}: {reason}")]
    CorruptVoucher { voucher_id: VoucherId, reason: String },

    #[error("Order queue is closed")]
    QueueClosed,

    #[error("Order persistence failed: {reason}")]
    Persistence { reason: String },

    #[error("Coordination error: {0}")]
    Coord(#[from] CoordError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, value: impl fmt::Display, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Master error type for all KVWARD errors.
#[derive(Debug, Clone, Error)]
pub enum KvwardError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Coordination error: {0}")]
    Coord(#[from] CoordError),

    #[error("Flash sale error: {0}")]
    FlashSale(#[from] FlashSaleError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for KVWARD operations.
pub type KvwardResult<T> = Result<T, KvwardError>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// TESTS
// =============================================================================
