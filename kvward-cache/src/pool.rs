//! Bounded pool for background cache rebuilds.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Every permit is taken; the job was not started.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Rebuild pool exhausted ({max_in_flight} jobs in flight)")]
pub struct PoolExhausted {
    pub max_in_flight: usize,
}

/// Runs at most `max_in_flight` jobs at once and refuses the rest.
///
/// Refused jobs are not queued. Clones share the same permits.
#[derive(Debug, Clone)]
pub struct RebuildPool {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl RebuildPool {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Jobs currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// Spawn `job` on the current tokio runtime if a permit is free.
    ///
    /// The permit is held until the job finishes.
    pub fn try_spawn<F>(&self, job: F) -> Result<JoinHandle<()>, PoolExhausted>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| PoolExhausted {
                max_in_flight: self.max_in_flight,
            })?;
        Ok(tokio::spawn(async move {
            job.await;
            drop(permit);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_refuses_beyond_capacity() {
        let pool = RebuildPool::new(2);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (second_tx, second_rx) = oneshot::channel::<()>();

        let first = pool
            .try_spawn(async move {
                let _ = release_rx.await;
            })
            .unwrap();
        let second = pool
            .try_spawn(async move {
                let _ = second_rx.await;
            })
            .unwrap();

        assert_eq!(pool.in_flight(), 2);
        assert_eq!(
            pool.try_spawn(async {}).unwrap_err(),
            PoolExhausted { max_in_flight: 2 }
        );

        release_tx.send(()).unwrap();
        second_tx.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(pool.in_flight(), 0);
        pool.try_spawn(async {}).unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_permits() {
        let pool = RebuildPool::new(1);
        let clone = pool.clone();
        let (tx, rx) = oneshot::channel::<()>();

        let running = pool
            .try_spawn(async move {
                let _ = rx.await;
            })
            .unwrap();
        assert!(clone.try_spawn(async {}).is_err());

        tx.send(()).unwrap();
        running.await.unwrap();
    }
}
