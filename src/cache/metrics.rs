//! Cache Metrics Collection
//!
//! Per-namespace hit/miss counters for monitoring cache health.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheStats {
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    durable_hits: AtomicU64,
    durable_misses: AtomicU64,
    expirations: AtomicU64,
    corrupt_records: AtomicU64,
    storage_failures: AtomicU64,
    type_mismatches: AtomicU64,
    writes: AtomicU64,
}

impl CacheStats {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_miss(&self) {
        self.memory_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_hit(&self) {
        self.durable_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_durable_miss(&self) {
        self.durable_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_record(&self) {
        self.corrupt_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_failure(&self) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_type_mismatch(&self) {
        self.type_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let memory_hits = self.memory_hits.load(Ordering::Relaxed);
        let durable_hits = self.durable_hits.load(Ordering::Relaxed);
        let durable_misses = self.durable_misses.load(Ordering::Relaxed);

        // Every lookup either hits memory or goes on to the durable tier.
        let lookups = memory_hits + durable_hits + durable_misses;
        let hit_ratio = if lookups == 0 {
            0.0
        } else {
            (memory_hits + durable_hits) as f64 / lookups as f64
        };

        CacheStatsSnapshot {
            memory_hits,
            memory_misses: self.memory_misses.load(Ordering::Relaxed),
            durable_hits,
            durable_misses,
            expirations: self.expirations.load(Ordering::Relaxed),
            corrupt_records: self.corrupt_records.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            type_mismatches: self.type_mismatches.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            hit_ratio,
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.memory_misses,
            &self.durable_hits,
            &self.durable_misses,
            &self.expirations,
            &self.corrupt_records,
            &self.storage_failures,
            &self.type_mismatches,
            &self.writes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct CacheStatsSnapshot {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub durable_hits: u64,
    pub durable_misses: u64,
    pub expirations: u64,
    pub corrupt_records: u64,
    pub storage_failures: u64,
    pub type_mismatches: u64,
    pub writes: u64,
    /// Fraction of lookups answered by either tier
    pub hit_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStats::new();
        assert_eq!(stats.snapshot().hit_ratio, 0.0);

        stats.record_memory_hit();
        stats.record_memory_miss();
        stats.record_durable_hit();
        stats.record_memory_miss();
        stats.record_durable_miss();
        stats.record_memory_hit();

        let snap = stats.snapshot();
        assert_eq!(snap.memory_hits, 2);
        assert_eq!(snap.memory_misses, 2);
        assert_eq!(snap.hit_ratio, 0.75);
    }

    #[test]
    fn test_reset() {
        let stats = CacheStats::new();
        stats.record_write();
        stats.record_storage_failure();
        stats.reset();
        assert_eq!(stats.snapshot(), CacheStatsSnapshot::default());
    }
}
