//! The logical connection handle

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use cistern_core::{
    DatabaseMetadata, DbError, Holdability, IsolationLevel, QueryResult, RawConnection, Result,
    Savepoint, SqlState, SqlWarning, StatementResult, StatementSpec, Value,
};

use crate::cache::{StatementCache, StatementKey};
use crate::config::PoolConfig;
use crate::hooks::{ConnectionHook, ConnectionState};
use crate::pool::PoolInner;
use crate::replay::{RecordedOp, ReplayLog, replay_operations};
use crate::sqlstate::{FailureClass, classify};
use crate::stats::Statistics;

use super::statement::{StatementHandle, StatementInner, StatementKind};

/// Hook slot shared between the pool and every handle, so a hook installed
/// after startup is seen by existing connections.
pub(crate) type SharedHook = Arc<RwLock<Option<Arc<dyn ConnectionHook>>>>;

/// Capture the current call stack under a one-line header.
pub(crate) fn capture_stack(header: &str) -> String {
    format!("{header}\n{}", std::backtrace::Backtrace::force_capture())
}

/// Immutable per-handle copies of the config bits the hot path needs.
struct HandleFlags {
    watch: bool,
    log_statements: AtomicBool,
    statistics: bool,
    recovery: bool,
    max_age_ms: u64,
}

/// State shared between a client-held [`ConnectionHandle`], its statements
/// and the pool machinery.
pub(crate) struct HandleInner {
    id: Uuid,
    /// Back-reference to this handle's own Arc, so hook views and
    /// statement handles can be minted from `&self`
    self_weak: Weak<HandleInner>,
    raw: RwLock<Arc<dyn RawConnection>>,
    pub(crate) pool: Weak<PoolInner>,
    partition: usize,
    /// Pool epoch; all millisecond timestamps below are relative to it
    epoch: Instant,
    created_at_ms: u64,
    last_used_ms: AtomicU64,
    last_reset_ms: AtomicU64,
    pub(crate) possibly_broken: AtomicBool,
    pub(crate) logically_closed: AtomicBool,
    in_replay: AtomicBool,
    prepared_cache: Option<StatementCache>,
    callable_cache: Option<StatementCache>,
    /// Statements handed out while close-watch is on, for the leak audit
    open_statements: Mutex<Vec<std::sync::Weak<StatementInner>>>,
    replay: Option<Mutex<ReplayLog>>,
    /// Name of the thread that checked the handle out (debugging)
    owner: Mutex<Option<String>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    /// Stack captured at the first close, for the double-close diagnostic
    close_stack: Mutex<Option<String>>,
    /// Stack captured at checkout, reported by the watchdog
    checkout_stack: Mutex<Option<String>>,
    debug_handle: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    slot_counter: AtomicU64,
    flags: HandleFlags,
    stats: Arc<Statistics>,
    hook: SharedHook,
}

impl HandleInner {
    pub(crate) fn new(
        raw: Arc<dyn RawConnection>,
        pool: Weak<PoolInner>,
        partition: usize,
        epoch: Instant,
        config: &PoolConfig,
        stats: Arc<Statistics>,
        hook: SharedHook,
    ) -> Arc<Self> {
        let now_ms = epoch.elapsed().as_millis() as u64;
        let cache_stats = config.statistics_enabled().then(|| Arc::clone(&stats));
        let cache_size = config.statements_cache_size();
        Arc::new_cyclic(|self_weak| Self {
            id: Uuid::new_v4(),
            self_weak: self_weak.clone(),
            raw: RwLock::new(raw),
            pool,
            partition,
            epoch,
            created_at_ms: now_ms,
            last_used_ms: AtomicU64::new(now_ms),
            last_reset_ms: AtomicU64::new(now_ms),
            possibly_broken: AtomicBool::new(false),
            logically_closed: AtomicBool::new(false),
            in_replay: AtomicBool::new(false),
            prepared_cache: (cache_size > 0)
                .then(|| StatementCache::new(cache_size, cache_stats.clone())),
            callable_cache: (cache_size > 0)
                .then(|| StatementCache::new(cache_size, cache_stats.clone())),
            open_statements: Mutex::new(Vec::new()),
            replay: config
                .transaction_recovery_enabled()
                .then(|| Mutex::new(ReplayLog::new())),
            owner: Mutex::new(None),
            watchdog: Mutex::new(None),
            close_stack: Mutex::new(None),
            checkout_stack: Mutex::new(None),
            debug_handle: Mutex::new(None),
            slot_counter: AtomicU64::new(0),
            flags: HandleFlags {
                watch: config.close_connection_watch(),
                log_statements: AtomicBool::new(config.log_statements_enabled()),
                statistics: config.statistics_enabled(),
                recovery: config.transaction_recovery_enabled(),
                max_age_ms: config.max_connection_age_ms(),
            },
            stats,
            hook,
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn partition_index(&self) -> usize {
        self.partition
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.logically_closed.load(Ordering::Acquire) {
            Err(DbError::ClosedHandle)
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_logically_closed(&self) -> bool {
        self.logically_closed.load(Ordering::Acquire)
    }

    pub(crate) fn raw(&self) -> Arc<dyn RawConnection> {
        Arc::clone(&self.raw.read())
    }

    /// Swap in a fresh physical connection, returning the old one.
    pub(crate) fn install_raw(&self, raw: Arc<dyn RawConnection>) -> Arc<dyn RawConnection> {
        std::mem::replace(&mut *self.raw.write(), raw)
    }

    pub(crate) fn hook(&self) -> Option<Arc<dyn ConnectionHook>> {
        self.hook.read().clone()
    }

    pub(crate) fn touch_used(&self) {
        self.last_used_ms.store(self.now_ms(), Ordering::Release);
    }

    pub(crate) fn touch_reset(&self) {
        self.last_reset_ms.store(self.now_ms(), Ordering::Release);
    }

    pub(crate) fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_used_ms.load(Ordering::Acquire))
    }

    pub(crate) fn since_reset_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_reset_ms.load(Ordering::Acquire))
    }

    pub(crate) fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    /// True once the handle has outlived the configured max connection age.
    pub(crate) fn is_expired_at(&self, now_ms: u64) -> bool {
        self.flags.max_age_ms > 0 && self.age_ms(now_ms) > self.flags.max_age_ms
    }

    pub(crate) fn log_statement(&self, sql: &str) {
        if self.flags.log_statements.load(Ordering::Relaxed) {
            tracing::debug!(connection_id = %self.id, sql, "executing statement");
        }
    }

    fn next_slot(&self) -> u64 {
        self.slot_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn cache_for(&self, kind: StatementKind) -> Option<&StatementCache> {
        match kind {
            StatementKind::Prepared => self.prepared_cache.as_ref(),
            StatementKind::Callable => self.callable_cache.as_ref(),
        }
    }

    /// Append an operation to the replay log, unless replaying or recovery
    /// is off. The closure keeps op construction off the disabled path.
    pub(crate) fn record(&self, op: impl FnOnce() -> RecordedOp) {
        if let Some(log) = &self.replay
            && !self.in_replay.load(Ordering::Acquire)
        {
            log.lock().record(op());
        }
    }

    pub(crate) fn clear_replay(&self) {
        if let Some(log) = &self.replay {
            log.lock().clear();
        }
    }

    /// Make the handle usable again at checkout.
    pub(crate) fn renew(&self, owner: String) {
        self.logically_closed.store(false, Ordering::Release);
        *self.owner.lock() = Some(owner);
        *self.close_stack.lock() = None;
        if self.flags.watch {
            *self.checkout_stack.lock() =
                Some(capture_stack("Stack trace of connection checkout follows:"));
        }
        self.touch_used();
    }

    pub(crate) fn clear_owner(&self) {
        *self.owner.lock() = None;
    }

    pub(crate) fn owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    pub(crate) fn checkout_stack(&self) -> Option<String> {
        self.checkout_stack.lock().clone()
    }

    pub(crate) fn set_watchdog(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.watchdog.lock().replace(task) {
            previous.abort();
        }
    }

    pub(crate) fn abort_watchdog(&self) {
        if let Some(task) = self.watchdog.lock().take() {
            task.abort();
        }
    }

    fn register_open_statement(&self, statement: &Arc<StatementInner>) {
        if self.flags.watch {
            let mut open = self.open_statements.lock();
            open.retain(|weak| weak.strong_count() > 0);
            open.push(Arc::downgrade(statement));
        }
    }

    /// Log every statement the client never closed (close-watch mode).
    pub(crate) fn leak_audit(&self) {
        if !self.flags.watch {
            return;
        }
        let open: Vec<Arc<StatementInner>> = {
            let mut registry = self.open_statements.lock();
            let live: Vec<_> = registry.iter().filter_map(|weak| weak.upgrade()).collect();
            registry.clear();
            live
        };
        for statement in open.into_iter().filter(|s| s.is_open()) {
            tracing::warn!(
                connection_id = %self.id,
                sql = statement.sql(),
                open_stack = statement.open_stack().as_deref().unwrap_or("<not captured>"),
                "statement was never closed by the application"
            );
        }
    }

    pub(crate) fn recovery_possible(&self) -> bool {
        self.flags.recovery && !self.in_replay.load(Ordering::Acquire)
    }

    /// View of this handle for hook callbacks. Only `None` mid-teardown.
    fn as_view(&self) -> Option<ConnectionHandle> {
        self.self_weak.upgrade().map(ConnectionHandle::view)
    }

    /// Classify a driver error, flag the handle (or the whole pool) and
    /// hand the error back for rethrowing. Returns the error plus whether
    /// this call left the handle flagged broken.
    pub(crate) async fn classify_failure(&self, err: DbError) -> (DbError, bool) {
        if !err.is_driver_error() {
            return (err, false);
        }
        let state = err
            .sql_state()
            .cloned()
            .unwrap_or_else(|| SqlState::new(SqlState::UNKNOWN));
        let hook = self.hook();
        let view = self.as_view();
        let hook_state = match (hook.as_ref(), view.as_ref()) {
            (Some(h), Some(v)) => h.on_mark_possibly_broken(v, &state, &err),
            _ => ConnectionState::Nop,
        };

        let class = classify(&state, hook_state);
        if class == FailureClass::DatabaseDown {
            tracing::error!(
                connection_id = %self.id,
                sql_state = %state,
                "database access problem; terminating all connections in the pool"
            );
            if let Some(pool) = self.pool.upgrade() {
                pool.terminate_all_connections().await;
            }
        }

        let mut flagged = false;
        if matches!(
            class,
            FailureClass::DatabaseDown | FailureClass::ConnectionBroken
        ) {
            self.possibly_broken.store(true, Ordering::Release);
            flagged = true;
            // The hook gets the last word on whether the flag sticks.
            if let (Some(h), Some(v)) = (hook.as_ref(), view.as_ref()) {
                let keep = h.on_connection_exception(v, &state, &err);
                self.possibly_broken.store(keep, Ordering::Release);
                flagged = keep;
            }
        }
        (err, flagged)
    }

    /// Replay the recorded transaction onto a fresh physical connection
    /// and swap it (plus remapped statements) into this handle.
    pub(crate) async fn recover(&self) -> Result<()> {
        if self.in_replay.swap(true, Ordering::AcqRel) {
            return Err(DbError::driver("transaction replay already in progress"));
        }
        let result = self.recover_inner().await;
        self.in_replay.store(false, Ordering::Release);
        result
    }

    async fn recover_inner(&self) -> Result<()> {
        let pool = self.pool.upgrade().ok_or(DbError::ShutdownInProgress)?;
        tracing::warn!(
            connection_id = %self.id,
            "connection failed mid-transaction; replaying onto a fresh connection"
        );
        let fresh = pool.obtain_raw().await?;
        let (ops, slots) = match &self.replay {
            Some(log) => log.lock().snapshot(),
            None => (Vec::new(), Vec::new()),
        };
        let mut recovered = replay_operations(&ops, fresh.as_ref()).await?;
        let remapped_statements = recovered.statement_count();

        let old = self.install_raw(Arc::clone(&fresh));
        if let Err(e) = old.close().await {
            tracing::debug!(connection_id = %self.id, error = %e, "failed to close broken connection");
        }
        for (slot, weak) in slots {
            if let (Some(statement), Some(new_raw)) = (weak.upgrade(), recovered.take_statement(slot))
            {
                statement.install_raw(new_raw);
            }
        }
        self.possibly_broken.store(false, Ordering::Release);
        tracing::info!(
            connection_id = %self.id,
            replayed_ops = ops.len(),
            remapped_statements,
            "transaction replayed successfully"
        );
        Ok(())
    }

    /// The cache-aware preparation procedure shared by `prepare_statement`
    /// and `prepare_call`.
    pub(crate) async fn prepare_with(
        &self,
        spec: StatementSpec,
        kind: StatementKind,
    ) -> Result<StatementHandle> {
        self.check_open()?;
        let started = self.flags.statistics.then(Instant::now);

        let cache = self.cache_for(kind);
        let key = cache.map(|_| StatementKey::from_spec(&spec));

        let inner = match (cache, &key) {
            (Some(cache), Some(key)) => cache.take(key),
            _ => None,
        };

        let inner = match inner {
            Some(cached) => {
                cached.set_open(true);
                let slot = self.next_slot();
                cached.set_slot(slot);
                self.record(|| RecordedOp::Prepare {
                    spec: spec.clone(),
                    kind,
                    slot,
                });
                self.register_replay_statement(slot, &cached);
                cached
            }
            None => {
                let raw = self.raw();
                let prepared = match kind {
                    StatementKind::Prepared => raw.prepare(&spec).await,
                    StatementKind::Callable => raw.prepare_call(&spec).await,
                };
                let prepared = match prepared {
                    Ok(statement) => statement,
                    Err(e) => {
                        let (e, _) = self.classify_failure(e).await;
                        return Err(e);
                    }
                };
                let slot = self.next_slot();
                let statement = Arc::new(StatementInner::new(
                    Arc::from(prepared),
                    spec.clone(),
                    kind,
                    key,
                    slot,
                ));
                self.record(|| RecordedOp::Prepare {
                    spec: spec.clone(),
                    kind,
                    slot,
                });
                self.register_replay_statement(slot, &statement);
                statement
            }
        };

        if self.flags.watch {
            inner.set_open_stack(Some(capture_stack(
                "Stack trace of location where statement was opened follows:",
            )));
            self.register_open_statement(&inner);
        }
        if let Some(started) = started {
            self.stats.record_statement_prepared(started.elapsed());
        }
        self.touch_used();
        let conn = self.self_weak.upgrade().ok_or(DbError::ClosedHandle)?;
        Ok(StatementHandle::new(inner, conn))
    }

    fn register_replay_statement(&self, slot: u64, statement: &Arc<StatementInner>) {
        if let Some(log) = &self.replay
            && !self.in_replay.load(Ordering::Acquire)
        {
            log.lock().register_statement(slot, Arc::downgrade(statement));
        }
    }

    /// Physically close the connection: drain both statement caches
    /// (closing every cached statement), close the raw connection and drop
    /// the tracking entry. Close failures of cached statements are logged
    /// and suppressed so retirement itself never leaks.
    pub(crate) async fn internal_close(&self) -> Result<()> {
        self.logically_closed.store(true, Ordering::Release);
        self.abort_watchdog();
        for cache in [self.prepared_cache.as_ref(), self.callable_cache.as_ref()]
            .into_iter()
            .flatten()
        {
            for statement in cache.drain() {
                if let Err(e) = statement.close_raw().await {
                    tracing::warn!(
                        connection_id = %self.id,
                        sql = statement.sql(),
                        error = %e,
                        "failed to close cached statement during retirement"
                    );
                }
            }
        }
        let raw = self.raw();
        let result = raw.close().await;
        if let Some(pool) = self.pool.upgrade() {
            pool.untrack(self.id);
        }
        result
    }
}

/// A logical connection checked out of the pool.
///
/// The full database capability set is exposed here; every call is
/// forwarded to the wrapped physical connection with failure
/// classification in between. `close()` returns the connection to the
/// pool; the physical connection stays open.
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
    /// Only the handle actually given to a client participates in the
    /// drop-without-close safety net; hook callback views do not.
    owned: bool,
}

impl ConnectionHandle {
    pub(crate) fn owned(inner: Arc<HandleInner>) -> Self {
        Self { inner, owned: true }
    }

    pub(crate) fn view(inner: Arc<HandleInner>) -> Self {
        Self {
            inner,
            owned: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<HandleInner> {
        &self.inner
    }

    /// Pool-unique id of this handle
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// True once the client has closed this handle
    pub fn is_closed(&self) -> bool {
        self.inner.is_logically_closed()
    }

    /// True if a driver error has flagged this connection as broken
    pub fn possibly_broken(&self) -> bool {
        self.inner.possibly_broken.load(Ordering::Acquire)
    }

    /// Time since this physical connection was created
    pub fn age(&self) -> Duration {
        Duration::from_millis(self.inner.age_ms(self.inner.now_ms()))
    }

    /// Time since the last client operation
    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.inner.idle_ms(self.inner.now_ms()))
    }

    /// Time since the pool last probed this connection
    pub fn time_since_reset(&self) -> Duration {
        Duration::from_millis(self.inner.since_reset_ms(self.inner.now_ms()))
    }

    /// True once the handle has outlived the configured max connection age
    pub fn is_expired(&self) -> bool {
        self.inner.is_expired_at(self.inner.now_ms())
    }

    /// The wrapped driver connection. Escape hatch for driver-specific
    /// capabilities the trait does not cover.
    pub fn raw_connection(&self) -> Arc<dyn RawConnection> {
        self.inner.raw()
    }

    /// Attach an opaque application object to this handle. The pool never
    /// looks at it.
    pub fn set_debug_handle(&self, value: Arc<dyn Any + Send + Sync>) {
        *self.inner.debug_handle.lock() = Some(value);
    }

    pub fn debug_handle(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.debug_handle.lock().clone()
    }

    /// Toggle statement logging for this handle only
    pub fn set_log_statements(&self, enabled: bool) {
        self.inner
            .flags
            .log_statements
            .store(enabled, Ordering::Relaxed);
    }

    pub fn log_statements_enabled(&self) -> bool {
        self.inner.flags.log_statements.load(Ordering::Relaxed)
    }

    /// Run the pool's keep-alive probe against this connection.
    pub async fn is_connection_alive(&self) -> bool {
        match self.inner.pool.upgrade() {
            Some(pool) => pool.is_connection_alive(&self.inner).await,
            None => false,
        }
    }

    /// Close the handle and return the connection to the pool.
    ///
    /// Idempotent: a second close is a no-op (with a diagnostic log when
    /// close-watch is enabled) and never fails.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.logically_closed.swap(true, Ordering::AcqRel) {
            self.inner.clear_owner();
            self.inner.abort_watchdog();
            if self.inner.flags.watch {
                *self.inner.close_stack.lock() = Some(capture_stack(
                    "Stack trace of location where connection was first closed follows:",
                ));
            }
            if let Some(hook) = self.inner.hook() {
                hook.on_check_in(self);
            }
            match self.inner.pool.upgrade() {
                Some(pool) if pool.enqueue_release(Arc::clone(&self.inner)).is_ok() => {}
                _ => {
                    // No pool to return to; close for real.
                    if let Err(e) = self.inner.internal_close().await {
                        tracing::warn!(connection_id = %self.id(), error = %e, "failed to close connection");
                    }
                }
            }
        } else if self.inner.flags.watch {
            if let Some(first) = self.inner.close_stack.lock().clone() {
                let second = capture_stack("Stack trace of the second close follows:");
                tracing::error!(
                    connection_id = %self.id(),
                    first_close = %first,
                    second_close = %second,
                    "connection closed twice"
                );
            }
        }
        Ok(())
    }

    /// Prepare a statement, consulting the per-handle cache first.
    pub async fn prepare_statement(&self, spec: impl Into<StatementSpec>) -> Result<StatementHandle> {
        self.inner
            .prepare_with(spec.into(), StatementKind::Prepared)
            .await
    }

    /// Prepare a stored-procedure call, consulting the callable cache first.
    pub async fn prepare_call(&self, spec: impl Into<StatementSpec>) -> Result<StatementHandle> {
        self.inner
            .prepare_with(spec.into(), StatementKind::Callable)
            .await
    }

    /// Execute one-off SQL that modifies data.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        self.inner.check_open()?;
        self.inner.log_statement(sql);
        let raw = self.inner.raw();
        match raw.execute(sql, params).await {
            Ok(result) => {
                self.inner.record(|| RecordedOp::Execute {
                    sql: sql.to_string(),
                    params: params.to_vec(),
                });
                self.inner.touch_used();
                Ok(result)
            }
            Err(e) => {
                let (e, flagged) = self.inner.classify_failure(e).await;
                if flagged && self.inner.recovery_possible() {
                    match self.inner.recover().await {
                        Ok(()) => {
                            let raw = self.inner.raw();
                            match raw.execute(sql, params).await {
                                Ok(result) => {
                                    self.inner.record(|| RecordedOp::Execute {
                                        sql: sql.to_string(),
                                        params: params.to_vec(),
                                    });
                                    self.inner.touch_used();
                                    Ok(result)
                                }
                                Err(e2) => {
                                    let (e2, _) =
                                        self.inner.classify_failure(e2).await;
                                    Err(e2)
                                }
                            }
                        }
                        Err(replay_err) => {
                            tracing::error!(
                                connection_id = %self.id(),
                                error = %replay_err,
                                "transaction replay failed"
                            );
                            Err(e)
                        }
                    }
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Execute one-off SQL that returns rows.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.inner.check_open()?;
        self.inner.log_statement(sql);
        let raw = self.inner.raw();
        match raw.query(sql, params).await {
            Ok(result) => {
                self.inner.record(|| RecordedOp::Query {
                    sql: sql.to_string(),
                    params: params.to_vec(),
                });
                self.inner.touch_used();
                Ok(result)
            }
            Err(e) => {
                let (e, flagged) = self.inner.classify_failure(e).await;
                if flagged && self.inner.recovery_possible() {
                    match self.inner.recover().await {
                        Ok(()) => {
                            let raw = self.inner.raw();
                            match raw.query(sql, params).await {
                                Ok(result) => {
                                    self.inner.record(|| RecordedOp::Query {
                                        sql: sql.to_string(),
                                        params: params.to_vec(),
                                    });
                                    self.inner.touch_used();
                                    Ok(result)
                                }
                                Err(e2) => {
                                    let (e2, _) =
                                        self.inner.classify_failure(e2).await;
                                    Err(e2)
                                }
                            }
                        }
                        Err(replay_err) => {
                            tracing::error!(
                                connection_id = %self.id(),
                                error = %replay_err,
                                "transaction replay failed"
                            );
                            Err(e)
                        }
                    }
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Commit the current transaction. Clears the replay log.
    pub async fn commit(&self) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.commit().await {
            Ok(()) => {
                self.inner.clear_replay();
                self.inner.touch_used();
                Ok(())
            }
            Err(e) => {
                let (e, flagged) = self.inner.classify_failure(e).await;
                if flagged && self.inner.recovery_possible() {
                    match self.inner.recover().await {
                        Ok(()) => {
                            let raw = self.inner.raw();
                            match raw.commit().await {
                                Ok(()) => {
                                    self.inner.clear_replay();
                                    self.inner.touch_used();
                                    Ok(())
                                }
                                Err(e2) => {
                                    let (e2, _) =
                                        self.inner.classify_failure(e2).await;
                                    Err(e2)
                                }
                            }
                        }
                        Err(replay_err) => {
                            tracing::error!(
                                connection_id = %self.id(),
                                error = %replay_err,
                                "transaction replay failed"
                            );
                            Err(e)
                        }
                    }
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Roll back the current transaction. Clears the replay log.
    pub async fn rollback(&self) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.rollback().await {
            Ok(()) => {
                self.inner.clear_replay();
                self.inner.touch_used();
                Ok(())
            }
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    /// Create a savepoint; `None` asks the driver to generate a name.
    pub async fn set_savepoint(&self, name: Option<&str>) -> Result<Savepoint> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.set_savepoint(name).await {
            Ok(savepoint) => {
                self.inner.record(|| RecordedOp::SetSavepoint {
                    name: Some(savepoint.name().to_string()),
                });
                self.inner.touch_used();
                Ok(savepoint)
            }
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    /// Roll back to a previously created savepoint.
    pub async fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.rollback_to_savepoint(savepoint).await {
            Ok(()) => {
                self.inner
                    .record(|| RecordedOp::RollbackToSavepoint(savepoint.name().to_string()));
                self.inner.touch_used();
                Ok(())
            }
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    /// Release (delete) a savepoint.
    pub async fn release_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.release_savepoint(savepoint).await {
            Ok(()) => {
                self.inner
                    .record(|| RecordedOp::ReleaseSavepoint(savepoint.name().to_string()));
                self.inner.touch_used();
                Ok(())
            }
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.set_auto_commit(auto_commit).await {
            Ok(()) => {
                self.inner.record(|| RecordedOp::SetAutoCommit(auto_commit));
                self.inner.touch_used();
                Ok(())
            }
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn auto_commit(&self) -> Result<bool> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.auto_commit().await {
            Ok(value) => Ok(value),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.set_read_only(read_only).await {
            Ok(()) => {
                self.inner.record(|| RecordedOp::SetReadOnly(read_only));
                self.inner.touch_used();
                Ok(())
            }
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn is_read_only(&self) -> Result<bool> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.is_read_only().await {
            Ok(value) => Ok(value),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn set_catalog(&self, catalog: &str) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.set_catalog(catalog).await {
            Ok(()) => {
                self.inner
                    .record(|| RecordedOp::SetCatalog(catalog.to_string()));
                self.inner.touch_used();
                Ok(())
            }
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn catalog(&self) -> Result<Option<String>> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.catalog().await {
            Ok(value) => Ok(value),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn set_holdability(&self, holdability: Holdability) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.set_holdability(holdability).await {
            Ok(()) => {
                self.inner.record(|| RecordedOp::SetHoldability(holdability));
                self.inner.touch_used();
                Ok(())
            }
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn holdability(&self) -> Result<Holdability> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.holdability().await {
            Ok(value) => Ok(value),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.set_transaction_isolation(level).await {
            Ok(()) => {
                self.inner
                    .record(|| RecordedOp::SetTransactionIsolation(level));
                self.inner.touch_used();
                Ok(())
            }
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn transaction_isolation(&self) -> Result<IsolationLevel> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.transaction_isolation().await {
            Ok(value) => Ok(value),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn set_type_map(&self, map: HashMap<String, String>) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.set_type_map(map.clone()).await {
            Ok(()) => {
                self.inner.record(|| RecordedOp::SetTypeMap(map));
                self.inner.touch_used();
                Ok(())
            }
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn type_map(&self) -> Result<HashMap<String, String>> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.type_map().await {
            Ok(value) => Ok(value),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn warnings(&self) -> Result<Vec<SqlWarning>> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.warnings().await {
            Ok(value) => Ok(value),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn clear_warnings(&self) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.clear_warnings().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn metadata(&self) -> Result<DatabaseMetadata> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.metadata().await {
            Ok(value) => Ok(value),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn client_info(&self) -> Result<HashMap<String, String>> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.client_info().await {
            Ok(value) => Ok(value),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    pub async fn set_client_info(&self, key: &str, value: &str) -> Result<()> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.set_client_info(key, value).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }

    /// Driver-level validity check, bounded by `timeout`.
    pub async fn is_valid(&self, timeout: Duration) -> Result<bool> {
        self.inner.check_open()?;
        let raw = self.inner.raw();
        match raw.is_valid(timeout).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let (e, _) = self.inner.classify_failure(e).await;
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("partition", &self.inner.partition)
            .field("closed", &self.inner.is_logically_closed())
            .field("possibly_broken", &self.possibly_broken())
            .finish()
    }
}

impl Drop for ConnectionHandle {
    /// Safety net for leaked handles: a client-owned handle dropped
    /// without `close()` is returned to the pool anyway.
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if self.inner.logically_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.clear_owner();
        self.inner.abort_watchdog();
        if let Some(pool) = self.inner.pool.upgrade() {
            tracing::warn!(
                connection_id = %self.inner.id,
                "connection handle dropped without close(); returning it to the pool"
            );
            let _ = pool.enqueue_release(Arc::clone(&self.inner));
        }
    }
}
