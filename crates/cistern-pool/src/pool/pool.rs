//! Pool implementation

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use cistern_core::{DbError, RawConnection, Result};

use crate::config::PoolConfig;
use crate::handle::{ConnectionHandle, HandleInner, SharedHook};
use crate::hooks::{AcquireFailConfig, ConnectionHook, default_on_acquire_fail};
use crate::stats::{PartitionUsage, Statistics, StatisticsSnapshot};

use super::partition::ConnectionPartition;
use super::workers;

/// Timeout handed to the driver's validity check when no test statement
/// is configured.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Factory trait for creating new physical connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Create a new connection
    async fn create(&self) -> Result<Arc<dyn RawConnection>>;

    /// Validate that a connection is still usable
    ///
    /// Default implementation only checks the closed flag.
    async fn validate(&self, conn: &dyn RawConnection) -> bool {
        !conn.is_closed()
    }
}

#[async_trait]
impl<T: ConnectionFactory> ConnectionFactory for Arc<T> {
    async fn create(&self) -> Result<Arc<dyn RawConnection>> {
        (**self).create().await
    }

    async fn validate(&self, conn: &dyn RawConnection) -> bool {
        (**self).validate(conn).await
    }
}

pub(crate) struct PoolInner {
    /// Back-reference to this pool's own Arc, handed to new handles
    self_weak: Weak<PoolInner>,
    pub(crate) config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    pub(crate) partitions: Vec<Arc<ConnectionPartition>>,
    /// Dropped at shutdown so the release workers see the channel close
    release_tx: Mutex<Option<mpsc::UnboundedSender<Arc<HandleInner>>>>,
    shutdown: AtomicBool,
    pub(crate) shutdown_signal: Arc<Notify>,
    /// All handle timestamps are milliseconds relative to this instant
    epoch: Instant,
    stats: Arc<Statistics>,
    hook: SharedHook,
    /// Weak view of every live handle, keyed by handle id. Lets
    /// `terminate_all_connections` flag checked-out handles and `shutdown`
    /// close leaked ones.
    tracking: Mutex<HashMap<Uuid, Weak<HandleInner>>>,
    /// Release workers: awaited at shutdown so the queue drains
    pub(crate) release_workers: Mutex<Vec<JoinHandle<()>>>,
    /// Keep-alive and growth workers: aborted at shutdown
    pub(crate) maintenance_workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolInner {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn hook(&self) -> Option<Arc<dyn ConnectionHook>> {
        self.hook.read().clone()
    }

    pub(crate) fn enqueue_release(&self, inner: Arc<HandleInner>) -> Result<()> {
        match self.release_tx.lock().as_ref() {
            Some(tx) if tx.send(inner).is_ok() => Ok(()),
            _ => Err(DbError::ShutdownInProgress),
        }
    }

    pub(crate) fn untrack(&self, id: Uuid) {
        self.tracking.lock().remove(&id);
    }

    fn partition_for_current_thread(&self) -> &Arc<ConnectionPartition> {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.partitions.len();
        &self.partitions[index]
    }

    /// Obtain a raw connection from the driver, retrying per the
    /// configured policy and running the init SQL on success.
    pub(crate) async fn obtain_raw(&self) -> Result<Arc<dyn RawConnection>> {
        let initial_attempts = self.config.acquire_retry_attempts();
        let mut acquire = AcquireFailConfig::new(
            initial_attempts,
            self.config.acquire_retry_delay(),
            "failed to acquire connection",
        );
        loop {
            if self.is_shutting_down() {
                return Err(DbError::ShutdownInProgress);
            }
            match self.try_connect().await {
                Ok(raw) => {
                    if acquire.attempts_remaining() != initial_attempts {
                        tracing::info!("successfully re-established connection to the database");
                    }
                    return Ok(raw);
                }
                Err(e) => {
                    let retry = match self.hook() {
                        Some(hook) => hook.on_acquire_fail(&e, &mut acquire),
                        None => default_on_acquire_fail(&e, &mut acquire),
                    };
                    if !retry {
                        return Err(DbError::AcquisitionFailed(format!(
                            "retries exhausted; last error: {e}"
                        )));
                    }
                    tokio::time::sleep(acquire.delay()).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<Arc<dyn RawConnection>> {
        let raw = self.factory.create().await?;
        if let Some(sql) = self.config.init_sql()
            && let Err(e) = raw.execute(sql, &[]).await
        {
            let _ = raw.close().await;
            return Err(e);
        }
        Ok(raw)
    }

    /// Create and register a handle around a freshly acquired connection.
    /// Does not touch the partition's counters or queue.
    pub(crate) async fn create_handle(
        &self,
        partition_index: usize,
    ) -> Result<Arc<HandleInner>> {
        let raw = self.obtain_raw().await?;
        let inner = HandleInner::new(
            raw,
            self.self_weak.clone(),
            partition_index,
            self.epoch,
            &self.config,
            Arc::clone(&self.stats),
            Arc::clone(&self.hook),
        );
        if !self.config.connection_tracking_disabled() {
            self.tracking
                .lock()
                .insert(inner.id(), Arc::downgrade(&inner));
        }
        if let Some(hook) = self.hook() {
            hook.on_acquire(&ConnectionHandle::view(Arc::clone(&inner)));
        }
        tracing::debug!(
            connection_id = %inner.id(),
            partition = partition_index,
            "created new physical connection"
        );
        Ok(inner)
    }

    pub(crate) async fn checkout(&self) -> Result<ConnectionHandle> {
        if self.is_shutting_down() {
            return Err(DbError::ShutdownInProgress);
        }
        let started = Instant::now();
        if self.config.statistics_enabled() {
            self.stats.increment_connections_requested();
        }
        let timeout = self.config.connection_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let partition = Arc::clone(self.partition_for_current_thread());

        let inner = loop {
            let candidate = match partition.try_take() {
                Some(handle) => Some(handle),
                None => {
                    if !partition.is_saturated() {
                        partition.signal_growth();
                    }
                    let remaining =
                        deadline.saturating_duration_since(tokio::time::Instant::now());
                    partition.take(remaining).await
                }
            };
            match candidate {
                Some(handle) => {
                    // Handles flagged between release and checkout (e.g. by
                    // terminate_all_connections) never reach a client.
                    if handle.possibly_broken.load(Ordering::Acquire)
                        || !self.factory.validate(handle.raw().as_ref()).await
                    {
                        self.destroy(handle, "unusable handle found in free queue").await;
                        continue;
                    }
                    break handle;
                }
                None => {
                    return Err(if self.is_shutting_down() {
                        DbError::ShutdownInProgress
                    } else {
                        DbError::AcquisitionTimedOut(timeout)
                    });
                }
            }
        };

        inner.renew(current_thread_label());
        if self.config.close_connection_watch() {
            self.spawn_watchdog(&inner);
        }
        if let Some(hook) = self.hook() {
            hook.on_check_out(&ConnectionHandle::view(Arc::clone(&inner)));
        }
        if self.config.statistics_enabled() {
            self.stats.add_wait_time(started.elapsed());
        }
        tracing::debug!(
            connection_id = %inner.id(),
            partition = partition.index(),
            "connection checked out"
        );
        Ok(ConnectionHandle::owned(inner))
    }

    fn spawn_watchdog(&self, inner: &Arc<HandleInner>) {
        let weak = Arc::downgrade(inner);
        let timeout = self.config.close_connection_watch_timeout();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade()
                && !inner.is_logically_closed()
            {
                tracing::error!(
                    connection_id = %inner.id(),
                    owner = inner.owner().as_deref().unwrap_or("<unknown>"),
                    checkout_stack = inner.checkout_stack().as_deref().unwrap_or("<not captured>"),
                    timeout_ms = timeout.as_millis() as u64,
                    "connection has been checked out longer than the close watch timeout"
                );
            }
        });
        inner.set_watchdog(task);
    }

    /// Return a released handle to its partition, or retire it if it is
    /// broken, expired, or the pool is going away.
    pub(crate) async fn internal_release(&self, inner: Arc<HandleInner>) {
        inner.leak_audit();
        if self.is_shutting_down() {
            self.destroy(inner, "pool shutting down").await;
            return;
        }
        let now = inner.now_ms();
        if inner.possibly_broken.load(Ordering::Acquire) {
            self.destroy(inner, "connection flagged broken").await;
            return;
        }
        if inner.is_expired_at(now) {
            self.destroy(inner, "max connection age reached").await;
            return;
        }
        inner.touch_used();
        let partition = &self.partitions[inner.partition_index()];
        partition.put(inner);
    }

    /// Physically retire a handle and update the partition bookkeeping.
    pub(crate) async fn destroy(&self, inner: Arc<HandleInner>, reason: &str) {
        tracing::debug!(connection_id = %inner.id(), reason, "destroying connection");
        if let Some(hook) = self.hook() {
            hook.on_destroy(&ConnectionHandle::view(Arc::clone(&inner)));
        }
        let partition = &self.partitions[inner.partition_index()];
        partition.decrement_created();
        if let Err(e) = inner.internal_close().await {
            tracing::warn!(
                connection_id = %inner.id(),
                error = %e,
                "error while closing retired connection"
            );
        }
        if !self.is_shutting_down() && partition.created() < partition.min_connections() {
            partition.signal_growth();
        }
    }

    /// Keep-alive probe used by the maintenance workers and by
    /// `ConnectionHandle::is_connection_alive`.
    pub(crate) async fn is_connection_alive(&self, inner: &Arc<HandleInner>) -> bool {
        let raw = inner.raw();
        let alive = match self.config.connection_test_statement() {
            Some(sql) => raw.query(sql, &[]).await.is_ok(),
            None => raw.is_valid(PROBE_TIMEOUT).await.unwrap_or(false),
        };
        if alive {
            inner.touch_reset();
        }
        alive
    }

    /// One pass of the per-partition keep-alive and eviction worker.
    pub(crate) async fn keepalive_pass(&self, partition: &Arc<ConnectionPartition>) {
        let mut keep = Vec::new();
        while let Some(inner) = partition.try_take() {
            let now = inner.now_ms();
            if inner.is_expired_at(now) {
                self.destroy(inner, "max connection age reached").await;
                continue;
            }
            if self.config.idle_max_age_ms() > 0
                && inner.idle_ms(now) >= self.config.idle_max_age_ms()
            {
                self.destroy(inner, "idle for longer than idle max age").await;
                continue;
            }
            if inner.since_reset_ms(now) >= self.config.idle_connection_test_period_ms() {
                if self.is_connection_alive(&inner).await {
                    keep.push(inner);
                } else {
                    inner.possibly_broken.store(true, Ordering::Release);
                    self.destroy(inner, "keep-alive probe failed").await;
                }
            } else {
                keep.push(inner);
            }
        }
        for inner in keep {
            partition.put(inner);
        }
        if partition.created() < partition.min_connections() {
            partition.signal_growth();
        }
    }

    /// Grow a partition by up to its acquire increment, never past max.
    pub(crate) async fn grow_partition(&self, partition: &Arc<ConnectionPartition>) {
        let mut added = 0;
        while added < partition.acquire_increment()
            && partition.created() < partition.max_connections()
        {
            if self.is_shutting_down() {
                return;
            }
            match self.create_handle(partition.index()).await {
                Ok(inner) => {
                    partition.increment_created();
                    partition.put(inner);
                    added += 1;
                }
                Err(e) => {
                    tracing::error!(
                        partition = partition.index(),
                        error = %e,
                        "failed to grow partition"
                    );
                    break;
                }
            }
        }
        if added > 0 {
            tracing::debug!(
                partition = partition.index(),
                added,
                total = partition.created(),
                "partition grown"
            );
        }
    }

    /// Flag every live handle broken and destroy everything idle. Invoked
    /// when a failure is classified as the database being down.
    pub(crate) async fn terminate_all_connections(&self) {
        tracing::error!("terminating all connections in the pool");
        {
            let tracking = self.tracking.lock();
            for weak in tracking.values() {
                if let Some(inner) = weak.upgrade() {
                    inner.possibly_broken.store(true, Ordering::Release);
                }
            }
        }
        for partition in &self.partitions {
            for inner in partition.drain() {
                self.destroy(inner, "database down").await;
            }
        }
    }

    pub(crate) async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("shutting down connection pool");

        // Closing the channel is what actually stops the release workers;
        // the notify is a hint so nobody waits out a long recv.
        self.release_tx.lock().take();
        self.shutdown_signal.notify_waiters();
        for partition in &self.partitions {
            partition.close();
        }

        let release_workers: Vec<JoinHandle<()>> =
            self.release_workers.lock().drain(..).collect();
        for worker in release_workers {
            let _ = worker.await;
        }
        let maintenance_workers: Vec<JoinHandle<()>> =
            self.maintenance_workers.lock().drain(..).collect();
        for worker in maintenance_workers {
            worker.abort();
        }

        for partition in &self.partitions {
            for inner in partition.drain() {
                self.destroy(inner, "pool shutdown").await;
            }
        }

        // Anything still tracked was checked out or leaked; close it.
        let leftovers: Vec<Arc<HandleInner>> = {
            let tracking = self.tracking.lock();
            tracking.values().filter_map(|weak| weak.upgrade()).collect()
        };
        for inner in leftovers {
            tracing::warn!(
                connection_id = %inner.id(),
                "connection still live at shutdown; closing it"
            );
            if let Err(e) = inner.internal_close().await {
                tracing::debug!(connection_id = %inner.id(), error = %e, "error closing leftover connection");
            }
        }
        self.tracking.lock().clear();
        tracing::info!("connection pool shut down");
    }
}

fn current_thread_label() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}

/// A partitioned connection pool.
///
/// Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Start a pool: creates the minimum number of connections per
    /// partition (retrying per the configured policy) and spawns the
    /// background workers.
    pub async fn new<F: ConnectionFactory>(config: PoolConfig, factory: F) -> Result<Self> {
        Self::build(config, factory, None).await
    }

    /// Start a pool with a connection hook already installed, so the hook
    /// observes the initial acquisitions too.
    pub async fn with_hook<F: ConnectionFactory>(
        config: PoolConfig,
        factory: F,
        hook: Arc<dyn ConnectionHook>,
    ) -> Result<Self> {
        Self::build(config, factory, Some(hook)).await
    }

    async fn build<F: ConnectionFactory>(
        config: PoolConfig,
        factory: F,
        hook: Option<Arc<dyn ConnectionHook>>,
    ) -> Result<Self> {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let partitions = (0..config.partition_count())
            .map(|index| {
                Arc::new(ConnectionPartition::new(
                    index,
                    config.min_connections_per_partition(),
                    config.max_connections_per_partition(),
                    config.acquire_increment(),
                ))
            })
            .collect();

        let inner = Arc::new_cyclic(|self_weak| PoolInner {
            self_weak: self_weak.clone(),
            config,
            factory: Arc::new(factory),
            partitions,
            release_tx: Mutex::new(Some(release_tx)),
            shutdown: AtomicBool::new(false),
            shutdown_signal: Arc::new(Notify::new()),
            epoch: Instant::now(),
            stats: Arc::new(Statistics::new()),
            hook: Arc::new(RwLock::new(hook)),
            tracking: Mutex::new(HashMap::new()),
            release_workers: Mutex::new(Vec::new()),
            maintenance_workers: Mutex::new(Vec::new()),
        });

        for partition in &inner.partitions {
            for _ in 0..partition.min_connections() {
                let handle = inner.create_handle(partition.index()).await?;
                partition.increment_created();
                partition.put(handle);
            }
        }

        workers::spawn_workers(&inner, release_rx);
        tracing::info!(
            partitions = inner.config.partition_count(),
            min_per_partition = inner.config.min_connections_per_partition(),
            max_per_partition = inner.config.max_connections_per_partition(),
            "connection pool started"
        );
        Ok(Self { inner })
    }

    /// Check a connection out of the pool.
    ///
    /// Picks a partition by thread affinity, blocks up to the configured
    /// connection timeout when the partition is empty, and fails with
    /// [`DbError::AcquisitionTimedOut`] when the deadline passes.
    pub async fn get_connection(&self) -> Result<ConnectionHandle> {
        self.inner.checkout().await
    }

    /// Install (or replace) the pool's connection hook.
    pub fn set_connection_hook(&self, hook: Arc<dyn ConnectionHook>) {
        *self.inner.hook.write() = Some(hook);
    }

    /// Snapshot of the statistics counters.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Per-partition occupancy, for monitoring.
    pub fn partition_usage(&self) -> Vec<PartitionUsage> {
        self.inner
            .partitions
            .iter()
            .map(|partition| PartitionUsage {
                partition: partition.index(),
                free: partition.free_count(),
                created: partition.created(),
                max: partition.max_connections(),
            })
            .collect()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Flag every live handle broken and destroy everything idle. New
    /// checkouts block until the growth workers manage to reprovision.
    pub async fn terminate_all_connections(&self) {
        self.inner.terminate_all_connections().await;
    }

    /// Shut the pool down: stop the workers (draining pending releases),
    /// destroy every pooled connection and close any that are still
    /// checked out. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("partitions", &self.inner.partitions.len())
            .field("shutting_down", &self.inner.is_shutting_down())
            .finish()
    }
}
