//! KVWARD Store - Key-Value Store Boundary
//!
//! Defines the [`KvStore`] trait every other crate talks to, plus two
//! backends:
//!
//! - [`InMemoryStore`]: a single-process store for tests and embedding.
//! - [`RedisStore`] (feature `redis`): a pooled Redis client whose scripted
//!   operations run as Lua, so each executes as one indivisible unit.
//!
//! The store is the sole arbiter of atomicity. Components never guard
//! store-backed invariants with in-process locks.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod scripts;

pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_backend::RedisStore;

use async_trait::async_trait;
use kvward_core::StoreResult;
use std::time::Duration;

/// Result of the atomic reserve step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReserveReply {
    /// Stock decremented and member recorded.
    Reserved,
    /// Stock missing or exhausted; nothing changed.
    SoldOut,
    /// Member already present in the purchaser set; nothing changed.
    Duplicate,
}

impl ReserveReply {
    /// Decode the integer returned by the reserve script.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Reserved),
            1 => Some(Self::SoldOut),
            2 => Some(Self::Duplicate),
            _ => None,
        }
    }

    /// Integer code used by the reserve script.
    pub fn code(&self) -> i64 {
        match self {
            Self::Reserved => 0,
            Self::SoldOut => 1,
            Self::Duplicate => 2,
        }
    }
}

/// Key-value store used by every component.
///
/// Values are strings; serialization happens above this boundary.
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a string value. `None` if absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a value, replacing any previous one.
    ///
    /// `ttl = None` stores without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Write a value with a TTL only if the key is absent.
    ///
    /// Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomically increment an integer value, creating it at 0 first.
    ///
    /// Returns the value after the increment.
    async fn increment(&self, key: &str) -> StoreResult<i64>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete `key` only if it currently holds `expected`, as one
    /// indivisible step.
    ///
    /// Returns whether the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Atomically check stock and membership, then decrement and record.
    ///
    /// - stock missing or `<= 0` -> [`ReserveReply::SoldOut`]
    /// - `member` already in `buyers_key` -> [`ReserveReply::Duplicate`]
    /// - otherwise decrement `stock_key`, add `member`, [`ReserveReply::Reserved`]
    async fn reserve(
        &self,
        stock_key: &str,
        buyers_key: &str,
        member: &str,
    ) -> StoreResult<ReserveReply>;
}
