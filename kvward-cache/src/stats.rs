//! Cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the client and its rebuild jobs.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Reads answered from a fresh entry
    pub hits: AtomicU64,

    /// Reads answered through the loader and written back
    pub loads: AtomicU64,

    /// Reads answered by the empty sentinel
    pub negative_hits: AtomicU64,

    /// Reads that found nothing
    pub misses: AtomicU64,

    /// Reads answered from a logically expired entry
    pub stale_hits: AtomicU64,

    pub rebuilds_scheduled: AtomicU64,

    /// Rebuilds refused because the pool was full
    pub rebuilds_dropped: AtomicU64,

    /// Rebuild jobs whose loader or write failed
    pub rebuilds_failed: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            rebuilds_scheduled: self.rebuilds_scheduled.load(Ordering::Relaxed),
            rebuilds_dropped: self.rebuilds_dropped.load(Ordering::Relaxed),
            rebuilds_failed: self.rebuilds_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub loads: u64,
    pub negative_hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub rebuilds_scheduled: u64,
    pub rebuilds_dropped: u64,
    pub rebuilds_failed: u64,
}

impl CacheStats {
    /// Fraction of reads answered without the durable store (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.negative_hits + self.stale_hits;
        let total = served + self.loads + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 6,
            negative_hits: 1,
            stale_hits: 1,
            loads: 1,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);
        assert!((CacheStats::default().hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_reads_counters() {
        let metrics = CacheMetrics::new();
        CacheMetrics::incr(&metrics.hits);
        CacheMetrics::incr(&metrics.hits);
        CacheMetrics::incr(&metrics.rebuilds_dropped);

        let stats = metrics.snapshot();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.rebuilds_dropped, 1);
        assert_eq!(stats.loads, 0);
    }
}
