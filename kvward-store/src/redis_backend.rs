//! Redis backend over a deadpool connection pool.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolSettings, Connection, Pool, PoolConfig, Runtime};
use kvward_core::{StoreError, StoreResult, StoreSettings};

use crate::scripts::{RESERVE_SCRIPT, UNLOCK_SCRIPT};
use crate::{KvStore, ReserveReply};

/// [`KvStore`] backed by Redis.
///
/// Plain commands map one to one (`GET`, `SET PX`, `SET NX PX`, `INCR`,
/// `DEL`). Compare-and-delete and reserve run as Lua scripts.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    unlock: redis::Script,
    reserve: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool", &self.pool.status())
            .finish()
    }
}

impl RedisStore {
    /// Build a pool from connection settings.
    pub fn new(settings: &StoreSettings) -> StoreResult<Self> {
        let mut config = PoolSettings::from_url(settings.url.as_str());
        config.pool = Some(PoolConfig::new(settings.pool_size));
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool {
                reason: e.to_string(),
            })?;
        tracing::debug!(url = %settings.url, pool_size = settings.pool_size, "Redis pool created");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            unlock: redis::Script::new(UNLOCK_SCRIPT),
            reserve: redis::Script::new(RESERVE_SCRIPT),
        }
    }

    async fn connection(&self) -> StoreResult<Connection> {
        self.pool.get().await.map_err(|e| {
            tracing::warn!(error = %e, "Redis connection checkout failed");
            StoreError::Pool {
                reason: e.to_string(),
            }
        })
    }
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend {
        reason: e.to_string(),
    }
}

fn millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis.
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(backend)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut *conn).await.map_err(backend)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        // Nil reply when the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut *conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        let value: i64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(backend)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(backend)?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .unlock
            .key(key)
            .arg(expected)
            .invoke_async(&mut *conn)
            .await
            .map_err(backend)?;
        Ok(removed > 0)
    }

    async fn reserve(
        &self,
        stock_key: &str,
        buyers_key: &str,
        member: &str,
    ) -> StoreResult<ReserveReply> {
        let mut conn = self.connection().await?;
        let code: i64 = self
            .reserve
            .key(stock_key)
            .key(buyers_key)
            .arg(member)
            .invoke_async(&mut *conn)
            .await
            .map_err(backend)?;
        ReserveReply::from_code(code).ok_or_else(|| StoreError::UnexpectedReply {
            reason: format!("reserve script returned {code}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_new_does_not_connect_eagerly() {
        let settings = StoreSettings {
            url: "redis://127.0.0.1:1".to_string(),
            pool_size: 2,
        };
        let store = RedisStore::new(&settings).unwrap();
        assert_eq!(store.pool.status().size, 0);
    }
}
