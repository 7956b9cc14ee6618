//! Pool statistics
//!
//! Monotone counters maintained while `statistics_enabled` is on. Counters
//! are lock-free atomics; `snapshot` produces a serializable point-in-time
//! view with the derived ratios.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Live statistics counters for a pool
#[derive(Debug, Default)]
pub struct Statistics {
    connections_requested: AtomicU64,
    cumulative_wait_ns: AtomicU64,
    statements_prepared: AtomicU64,
    cumulative_prepare_ns: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment_connections_requested(&self) {
        self.connections_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_wait_time(&self, wait: Duration) {
        self.cumulative_wait_ns
            .fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_statement_prepared(&self, elapsed: Duration) {
        self.statements_prepared.fetch_add(1, Ordering::Relaxed);
        self.cumulative_prepare_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn increment_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_requested(&self) -> u64 {
        self.connections_requested.load(Ordering::Relaxed)
    }

    pub fn statements_prepared(&self) -> u64 {
        self.statements_prepared.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Take a point-in-time snapshot of all counters
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            connections_requested: self.connections_requested.load(Ordering::Relaxed),
            cumulative_wait_ns: self.cumulative_wait_ns.load(Ordering::Relaxed),
            statements_prepared: self.statements_prepared.load(Ordering::Relaxed),
            cumulative_prepare_ns: self.cumulative_prepare_ns.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters
    pub fn reset(&self) {
        self.connections_requested.store(0, Ordering::Relaxed);
        self.cumulative_wait_ns.store(0, Ordering::Relaxed);
        self.statements_prepared.store(0, Ordering::Relaxed);
        self.cumulative_prepare_ns.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of the pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Connections requested from the pool
    pub connections_requested: u64,
    /// Total time spent waiting for checkouts, in nanoseconds
    pub cumulative_wait_ns: u64,
    /// Statements prepared (cache hits included)
    pub statements_prepared: u64,
    /// Total time spent preparing statements, in nanoseconds
    pub cumulative_prepare_ns: u64,
    /// Statement cache hits
    pub cache_hits: u64,
    /// Statement cache misses
    pub cache_misses: u64,
}

impl StatisticsSnapshot {
    /// Fraction of cache lookups that hit, in 0.0..=1.0.
    ///
    /// Returns 0.0 when no lookups were made.
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    /// Average checkout wait time.
    ///
    /// Returns zero when no connections were requested.
    pub fn average_wait(&self) -> Duration {
        if self.connections_requested == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.cumulative_wait_ns / self.connections_requested)
        }
    }

    /// Average statement preparation time.
    pub fn average_prepare_time(&self) -> Duration {
        if self.statements_prepared == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.cumulative_prepare_ns / self.statements_prepared)
        }
    }
}

/// Occupancy of one partition, for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionUsage {
    /// Partition index
    pub partition: usize,
    /// Connections sitting in the free queue
    pub free: usize,
    /// Live connections (free + checked out)
    pub created: usize,
    /// Partition ceiling
    pub max: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Statistics::new();
        stats.increment_connections_requested();
        stats.increment_connections_requested();
        stats.add_wait_time(Duration::from_millis(10));
        stats.record_statement_prepared(Duration::from_micros(250));
        stats.increment_cache_hits();
        stats.increment_cache_misses();

        let snap = stats.snapshot();
        assert_eq!(snap.connections_requested, 2);
        assert_eq!(snap.statements_prepared, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.cumulative_wait_ns, 10_000_000);
    }

    #[test]
    fn reset_zeroes_everything() {
        let stats = Statistics::new();
        stats.increment_connections_requested();
        stats.increment_cache_hits();
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.connections_requested, 0);
        assert_eq!(snap.cache_hits, 0);
    }

    #[test]
    fn derived_ratios() {
        let snap = StatisticsSnapshot {
            connections_requested: 4,
            cumulative_wait_ns: 4_000_000,
            statements_prepared: 2,
            cumulative_prepare_ns: 500_000,
            cache_hits: 3,
            cache_misses: 1,
        };
        assert!((snap.cache_hit_ratio() - 0.75).abs() < 1e-9);
        assert_eq!(snap.average_wait(), Duration::from_millis(1));
        assert_eq!(snap.average_prepare_time(), Duration::from_nanos(250_000));
    }

    #[test]
    fn ratios_with_no_activity() {
        let snap = Statistics::new().snapshot();
        assert_eq!(snap.cache_hit_ratio(), 0.0);
        assert_eq!(snap.average_wait(), Duration::ZERO);
    }

    #[test]
    fn snapshot_serialization() {
        let stats = Statistics::new();
        stats.increment_cache_hits();
        let snap = stats.snapshot();
        let json = serde_json::to_string(&snap).expect("serialize");
        let back: StatisticsSnapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(snap, back);
    }
}
