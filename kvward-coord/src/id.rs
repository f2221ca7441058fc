//! Roughly time-ordered 64-bit ids.
//!
//! Layout, with the default 32 counter bits:
//!
//! ```text
//!  63        32 31         0
//! +------------+------------+
//! | secs since |   daily    |
//! |   epoch    |  counter   |
//! +------------+------------+
//! ```
//!
//! The counter lives at `{counter_prefix}:{tag}:{yyyy:MM:dd}` and restarts
//! when the date rolls over. The timestamp half dominates ordering, so ids
//! for one tag are non-decreasing across seconds.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use kvward_core::config::MAX_ID_COUNTER_BITS;
use kvward_core::{CoordError, IdSettings, KeyNamespaces, Timestamp};
use kvward_store::KvStore;
use serde::{Deserialize, Serialize};

use crate::CoordResult;

/// The two halves of a generated id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdParts {
    pub elapsed_secs: i64,
    pub counter: i64,
}

/// Store-backed id generator.
#[derive(Clone)]
pub struct IdGenerator {
    store: Arc<dyn KvStore>,
    namespaces: KeyNamespaces,
    settings: IdSettings,
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator")
            .field("counter_prefix", &self.namespaces.counter_prefix)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl IdGenerator {
    /// `settings.counter_bits` is clamped to `1..=MAX_ID_COUNTER_BITS`.
    pub fn new(store: Arc<dyn KvStore>, namespaces: KeyNamespaces, mut settings: IdSettings) -> Self {
        let bits = settings.counter_bits.clamp(1, MAX_ID_COUNTER_BITS);
        if bits != settings.counter_bits {
            tracing::warn!(
                requested = settings.counter_bits,
                using = bits,
                "Id counter bits out of range, clamped"
            );
            settings.counter_bits = bits;
        }
        Self {
            store,
            namespaces,
            settings,
        }
    }

    pub fn settings(&self) -> &IdSettings {
        &self.settings
    }

    /// Allocate the next id for `tag` at the current time.
    pub async fn next_id(&self, tag: &str) -> CoordResult<i64> {
        self.next_id_at(tag, Utc::now()).await
    }

    /// Allocate the next id for `tag` as if the clock read `now`.
    pub async fn next_id_at(&self, tag: &str, now: Timestamp) -> CoordResult<i64> {
        let bits = self.settings.counter_bits;
        let now_secs = now.timestamp();
        let epoch_secs = self.settings.epoch_seconds;
        if now_secs < epoch_secs {
            return Err(CoordError::ClockBeforeEpoch {
                now_secs,
                epoch_secs,
            });
        }
        let elapsed_secs = now_secs - epoch_secs;
        if elapsed_secs >= 1_i64 << (63 - bits) {
            return Err(CoordError::TimestampOverflow { elapsed_secs, bits });
        }

        let key = self.counter_key(tag, now);
        let counter = self.store.increment(&key).await?;
        if counter >= 1_i64 << bits {
            tracing::error!(key = %key, counter, bits, "Daily id sequence exhausted");
            return Err(CoordError::SequenceExhausted {
                tag: tag.to_string(),
                counter,
                bits,
            });
        }

        Ok(self.compose(IdParts {
            elapsed_secs,
            counter,
        }))
    }

    /// Counter key for `tag` on the UTC date of `now`.
    pub fn counter_key(&self, tag: &str, now: Timestamp) -> String {
        let day = now.format("%Y:%m:%d").to_string();
        self.namespaces.counter_key(tag, &day)
    }

    /// Pack parts into an id. Parts must already fit their fields.
    pub fn compose(&self, parts: IdParts) -> i64 {
        (parts.elapsed_secs << self.settings.counter_bits) | parts.counter
    }

    /// Split an id into its parts.
    pub fn decompose(&self, id: i64) -> IdParts {
        let bits = self.settings.counter_bits;
        IdParts {
            elapsed_secs: id >> bits,
            counter: id & ((1_i64 << bits) - 1),
        }
    }

    /// Wall-clock second at which `id` was allocated.
    pub fn issued_at(&self, id: i64) -> Option<Timestamp> {
        let secs = self.decompose(id).elapsed_secs + self.settings.epoch_seconds;
        Timestamp::from_timestamp(secs, 0)
    }
}
