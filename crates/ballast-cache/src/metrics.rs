//! Cache operation metrics (thread-safe counters).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lookup-level counters for cache behavior.
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    /// Lookups served from a live entry.
    pub hits: Arc<AtomicU64>,
    /// Lookups that found a cached failure (negative caching).
    pub negative_hits: Arc<AtomicU64>,
    /// Lookups that found nothing.
    pub misses: Arc<AtomicU64>,
    /// Lookups that found an entry past its TTL.
    pub expired: Arc<AtomicU64>,
    /// Entries evicted by the LRU capacity bound.
    pub evictions: Arc<AtomicU64>,
    /// Values written into the store.
    pub stores: Arc<AtomicU64>,
    /// Callers that waited on another caller's in-flight fetch.
    pub stampede_waits: Arc<AtomicU64>,
    /// Entries removed by invalidation patterns.
    pub invalidated: Arc<AtomicU64>,
}

impl CacheMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negative_hit(&self) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: u64) {
        if n > 0 {
            self.evictions.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stampede_wait(&self) {
        self.stampede_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidated(&self, n: u64) {
        if n > 0 {
            self.invalidated.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            stampede_waits: self.stampede_waits.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub negative_hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
    pub stores: u64,
    pub stampede_waits: u64,
    pub invalidated: u64,
}

impl MetricsSnapshot {
    /// Fraction of lookups served from cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.expired;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let metrics = CacheMetrics::default();
        assert_eq!(metrics.snapshot().hit_rate(), 0.0);

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        assert!((metrics.snapshot().hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
