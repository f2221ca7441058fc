//! Logical-expiry wrapper stored under keys with no store TTL.

use std::time::Duration;

use kvward_core::Timestamp;
use serde::{Deserialize, Serialize};

/// `{ "data": ..., "expireAt": ... }`
///
/// The store never evicts these entries; staleness is judged by comparing
/// `expire_at` with the reader's clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalExpiryEnvelope<T> {
    pub data: T,
    pub expire_at: Timestamp,
}

impl<T> LogicalExpiryEnvelope<T> {
    /// Wrap `data` to expire `ttl` after `now`.
    pub fn new(data: T, ttl: Duration, now: Timestamp) -> Self {
        let expire_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(Timestamp::MAX_UTC);
        Self { data, expire_at }
    }

    /// An entry whose `expire_at` is not after `now` is stale.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expire_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_wire_field_names() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let envelope = LogicalExpiryEnvelope::new(7, Duration::from_secs(30), now);
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["data"], 7);
        assert_eq!(json["expireAt"], "2024-03-01T00:00:30Z");
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let envelope = LogicalExpiryEnvelope::new("x", Duration::from_secs(5), now);

        assert!(!envelope.is_expired(now));
        assert!(envelope.is_expired(now + chrono::Duration::seconds(5)));
        assert!(LogicalExpiryEnvelope::new("x", Duration::ZERO, now).is_expired(now));
    }
}
