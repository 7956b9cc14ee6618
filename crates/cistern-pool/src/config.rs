//! Pool configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a connection pool
///
/// Controls partitioning, pool sizing, timeouts, statement caching and the
/// debugging aids. Construct with [`PoolConfig::new`] and refine with the
/// `with_*` methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of partitions (shards) the pool is split into
    partition_count: usize,
    /// Connections created per partition at startup, and the floor the
    /// maintenance worker tops the partition back up to
    min_connections_per_partition: usize,
    /// Hard ceiling of connections per partition
    max_connections_per_partition: usize,
    /// Batch size when growing a partition on demand
    acquire_increment: usize,
    /// Timeout in milliseconds when checking a connection out of the pool
    connection_timeout_ms: u64,
    /// Idle time in milliseconds after which a pooled connection is retired
    idle_max_age_ms: u64,
    /// Cadence in milliseconds of the per-partition keep-alive worker
    idle_connection_test_period_ms: u64,
    /// Hard age cap in milliseconds on any connection (0 = disabled)
    max_connection_age_ms: u64,
    /// Per-handle statement cache bound (0 disables caching)
    statements_cache_size: usize,
    /// Connection acquisition retries before giving up (-1 = retry forever)
    acquire_retry_attempts: i32,
    /// Delay in milliseconds between acquisition attempts
    acquire_retry_delay_ms: u64,
    /// Number of workers draining the release queue
    release_helper_count: usize,
    /// Statement run once on each newly created physical connection
    init_sql: Option<String>,
    /// SQL used by the keep-alive probe; falls back to the driver's
    /// validity check when unset
    connection_test_statement: Option<String>,
    /// Record operations for transaction replay on connection failure
    transaction_recovery_enabled: bool,
    /// Debug mode: double-close stacks, statement-leak audit and
    /// per-checkout watchdogs
    close_connection_watch: bool,
    /// How long a checkout may live before the watchdog complains
    close_connection_watch_timeout_ms: u64,
    /// Route executed SQL through the log
    log_statements_enabled: bool,
    /// Maintain the pool statistics counters
    statistics_enabled: bool,
    /// Skip registration of handles in the leak-tracking table
    disable_connection_tracking: bool,
}

impl PoolConfig {
    /// Create a pool configuration with the given per-partition min and
    /// max connection counts.
    ///
    /// # Panics
    ///
    /// Panics if `min > max` or if `max` is 0.
    pub fn new(min_connections_per_partition: usize, max_connections_per_partition: usize) -> Self {
        assert!(
            max_connections_per_partition > 0,
            "max_connections_per_partition must be greater than 0"
        );
        assert!(
            min_connections_per_partition <= max_connections_per_partition,
            "min_connections_per_partition ({}) cannot exceed max_connections_per_partition ({})",
            min_connections_per_partition,
            max_connections_per_partition
        );

        Self {
            partition_count: 1,
            min_connections_per_partition,
            max_connections_per_partition,
            acquire_increment: 2,
            connection_timeout_ms: 30_000,
            idle_max_age_ms: 600_000,
            idle_connection_test_period_ms: 120_000,
            max_connection_age_ms: 0,
            statements_cache_size: 0,
            acquire_retry_attempts: 5,
            acquire_retry_delay_ms: 1_000,
            release_helper_count: 3,
            init_sql: None,
            connection_test_statement: None,
            transaction_recovery_enabled: false,
            close_connection_watch: false,
            close_connection_watch_timeout_ms: 60_000,
            log_statements_enabled: false,
            statistics_enabled: false,
            disable_connection_tracking: false,
        }
    }

    /// Set the number of partitions.
    ///
    /// # Panics
    ///
    /// Panics if `count` is 0.
    pub fn with_partition_count(mut self, count: usize) -> Self {
        assert!(count > 0, "partition_count must be greater than 0");
        self.partition_count = count;
        self
    }

    /// Set the growth batch size.
    ///
    /// # Panics
    ///
    /// Panics if `increment` is 0.
    pub fn with_acquire_increment(mut self, increment: usize) -> Self {
        assert!(increment > 0, "acquire_increment must be greater than 0");
        self.acquire_increment = increment;
        self
    }

    /// Set the checkout timeout in milliseconds
    pub fn with_connection_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connection_timeout_ms = timeout_ms;
        self
    }

    /// Set the idle retirement threshold in milliseconds
    pub fn with_idle_max_age_ms(mut self, age_ms: u64) -> Self {
        self.idle_max_age_ms = age_ms;
        self
    }

    /// Set the keep-alive cadence in milliseconds
    pub fn with_idle_connection_test_period_ms(mut self, period_ms: u64) -> Self {
        self.idle_connection_test_period_ms = period_ms;
        self
    }

    /// Set the hard connection age cap in milliseconds (0 disables it)
    pub fn with_max_connection_age_ms(mut self, age_ms: u64) -> Self {
        self.max_connection_age_ms = age_ms;
        self
    }

    /// Set the per-handle statement cache bound (0 disables caching)
    pub fn with_statements_cache_size(mut self, size: usize) -> Self {
        self.statements_cache_size = size;
        self
    }

    /// Set the acquisition retry policy. `attempts` of -1 retries forever.
    pub fn with_acquire_retry(mut self, attempts: i32, delay_ms: u64) -> Self {
        self.acquire_retry_attempts = attempts;
        self.acquire_retry_delay_ms = delay_ms;
        self
    }

    /// Set the number of release-queue workers.
    ///
    /// # Panics
    ///
    /// Panics if `count` is 0.
    pub fn with_release_helper_count(mut self, count: usize) -> Self {
        assert!(count > 0, "release_helper_count must be greater than 0");
        self.release_helper_count = count;
        self
    }

    /// Set SQL to run once on each newly created physical connection
    pub fn with_init_sql(mut self, sql: impl Into<String>) -> Self {
        self.init_sql = Some(sql.into());
        self
    }

    /// Set the keep-alive probe statement
    pub fn with_connection_test_statement(mut self, sql: impl Into<String>) -> Self {
        self.connection_test_statement = Some(sql.into());
        self
    }

    /// Enable recording of operations for transaction replay
    pub fn with_transaction_recovery(mut self, enabled: bool) -> Self {
        self.transaction_recovery_enabled = enabled;
        self
    }

    /// Enable the close-watch debugging aids
    pub fn with_close_connection_watch(mut self, enabled: bool) -> Self {
        self.close_connection_watch = enabled;
        self
    }

    /// Set how long a checkout may live before the watchdog complains
    pub fn with_close_connection_watch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.close_connection_watch_timeout_ms = timeout_ms;
        self
    }

    /// Route executed SQL through the log
    pub fn with_log_statements(mut self, enabled: bool) -> Self {
        self.log_statements_enabled = enabled;
        self
    }

    /// Maintain the pool statistics counters
    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    /// Skip registration of handles in the leak-tracking table
    pub fn with_connection_tracking_disabled(mut self, disabled: bool) -> Self {
        self.disable_connection_tracking = disabled;
        self
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    pub fn min_connections_per_partition(&self) -> usize {
        self.min_connections_per_partition
    }

    pub fn max_connections_per_partition(&self) -> usize {
        self.max_connections_per_partition
    }

    pub fn acquire_increment(&self) -> usize {
        self.acquire_increment
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn idle_max_age(&self) -> Duration {
        Duration::from_millis(self.idle_max_age_ms)
    }

    pub fn idle_max_age_ms(&self) -> u64 {
        self.idle_max_age_ms
    }

    pub fn idle_connection_test_period(&self) -> Duration {
        Duration::from_millis(self.idle_connection_test_period_ms)
    }

    pub fn idle_connection_test_period_ms(&self) -> u64 {
        self.idle_connection_test_period_ms
    }

    pub fn max_connection_age_ms(&self) -> u64 {
        self.max_connection_age_ms
    }

    pub fn statements_cache_size(&self) -> usize {
        self.statements_cache_size
    }

    pub fn acquire_retry_attempts(&self) -> i32 {
        self.acquire_retry_attempts
    }

    pub fn acquire_retry_delay(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_delay_ms)
    }

    pub fn release_helper_count(&self) -> usize {
        self.release_helper_count
    }

    pub fn init_sql(&self) -> Option<&str> {
        self.init_sql.as_deref()
    }

    pub fn connection_test_statement(&self) -> Option<&str> {
        self.connection_test_statement.as_deref()
    }

    pub fn transaction_recovery_enabled(&self) -> bool {
        self.transaction_recovery_enabled
    }

    pub fn close_connection_watch(&self) -> bool {
        self.close_connection_watch
    }

    pub fn close_connection_watch_timeout(&self) -> Duration {
        Duration::from_millis(self.close_connection_watch_timeout_ms)
    }

    pub fn log_statements_enabled(&self) -> bool {
        self.log_statements_enabled
    }

    pub fn statistics_enabled(&self) -> bool {
        self.statistics_enabled
    }

    pub fn connection_tracking_disabled(&self) -> bool {
        self.disable_connection_tracking
    }

    /// Total connection capacity across all partitions
    pub fn total_max_connections(&self) -> usize {
        self.partition_count * self.max_connections_per_partition
    }
}

impl Default for PoolConfig {
    /// Default configuration: one partition of 1..10 connections, 30s
    /// checkout timeout, caching and debug aids off.
    fn default() -> Self {
        Self::new(1, 10)
    }
}
