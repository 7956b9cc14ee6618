//! Statement handles
//!
//! A `StatementHandle` is the client-facing wrapper around one prepared
//! driver statement. Closing it does not deallocate the driver statement:
//! the wrapper offers itself back to the owning connection's cache, and
//! only an evicted victim (or handle retirement) closes the statement for
//! real.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use cistern_core::{QueryResult, RawStatement, Result, StatementResult, StatementSpec, Value};

use crate::cache::StatementKey;
use crate::replay::RecordedOp;

use super::handle::HandleInner;

/// Whether a statement came from `prepare` or `prepare_call`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Prepared,
    Callable,
}

/// Shared state behind a statement handle. Lives on between uses while
/// parked in the statement cache.
pub(crate) struct StatementInner {
    raw: RwLock<Arc<dyn RawStatement>>,
    spec: StatementSpec,
    kind: StatementKind,
    key: Option<StatementKey>,
    /// Replay slot of the most recent preparation of this statement
    slot: AtomicU64,
    logically_open: AtomicBool,
    /// Call site of the preparation, captured in close-watch mode
    open_stack: Mutex<Option<String>>,
}

impl StatementInner {
    pub(crate) fn new(
        raw: Arc<dyn RawStatement>,
        spec: StatementSpec,
        kind: StatementKind,
        key: Option<StatementKey>,
        slot: u64,
    ) -> Self {
        Self {
            raw: RwLock::new(raw),
            spec,
            kind,
            key,
            slot: AtomicU64::new(slot),
            logically_open: AtomicBool::new(true),
            open_stack: Mutex::new(None),
        }
    }

    pub(crate) fn raw(&self) -> Arc<dyn RawStatement> {
        Arc::clone(&self.raw.read())
    }

    /// Swap in a freshly prepared driver statement (transaction replay).
    pub(crate) fn install_raw(&self, raw: Arc<dyn RawStatement>) {
        *self.raw.write() = raw;
    }

    pub(crate) fn sql(&self) -> &str {
        self.spec.sql()
    }

    pub(crate) fn kind(&self) -> StatementKind {
        self.kind
    }

    pub(crate) fn key(&self) -> Option<&StatementKey> {
        self.key.as_ref()
    }

    pub(crate) fn slot(&self) -> u64 {
        self.slot.load(Ordering::Acquire)
    }

    pub(crate) fn set_slot(&self, slot: u64) {
        self.slot.store(slot, Ordering::Release);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.logically_open.load(Ordering::Acquire)
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.logically_open.store(open, Ordering::Release);
    }

    pub(crate) fn set_open_stack(&self, stack: Option<String>) {
        *self.open_stack.lock() = stack;
    }

    pub(crate) fn open_stack(&self) -> Option<String> {
        self.open_stack.lock().clone()
    }

    /// Close the underlying driver statement.
    pub(crate) async fn close_raw(&self) -> Result<()> {
        self.logically_open.store(false, Ordering::Release);
        let raw = self.raw();
        raw.close().await
    }
}

/// A prepared (or callable) statement checked out from a connection handle
pub struct StatementHandle {
    inner: Arc<StatementInner>,
    conn: Arc<HandleInner>,
}

impl StatementHandle {
    pub(crate) fn new(inner: Arc<StatementInner>, conn: Arc<HandleInner>) -> Self {
        Self { inner, conn }
    }

    pub fn sql(&self) -> &str {
        self.inner.sql()
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.is_open()
    }

    fn check_usable(&self) -> Result<()> {
        if !self.inner.is_open() {
            return Err(cistern_core::DbError::ClosedHandle);
        }
        self.conn.check_open()
    }

    /// Execute the statement, returning the update count.
    pub async fn execute(&self, params: &[Value]) -> Result<StatementResult> {
        self.check_usable()?;
        self.conn.log_statement(self.inner.sql());
        let raw = self.inner.raw();
        match raw.execute(params).await {
            Ok(result) => {
                self.conn.record(|| RecordedOp::StatementExecute {
                    slot: self.inner.slot(),
                    params: params.to_vec(),
                });
                self.conn.touch_used();
                Ok(result)
            }
            Err(e) => {
                let (e, flagged) = self.conn.classify_failure(e).await;
                if flagged && self.conn.recovery_possible() {
                    self.redispatch_execute(params, e).await
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Execute the statement, returning rows.
    pub async fn query(&self, params: &[Value]) -> Result<QueryResult> {
        self.check_usable()?;
        self.conn.log_statement(self.inner.sql());
        let raw = self.inner.raw();
        match raw.query(params).await {
            Ok(result) => {
                self.conn.record(|| RecordedOp::StatementQuery {
                    slot: self.inner.slot(),
                    params: params.to_vec(),
                });
                self.conn.touch_used();
                Ok(result)
            }
            Err(e) => {
                let (e, flagged) = self.conn.classify_failure(e).await;
                if flagged && self.conn.recovery_possible() {
                    self.redispatch_query(params, e).await
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Keys generated by the last execution, when requested at prepare time.
    pub async fn generated_keys(&self) -> Result<QueryResult> {
        self.check_usable()?;
        let raw = self.inner.raw();
        match raw.generated_keys().await {
            Ok(result) => Ok(result),
            Err(e) => {
                let (e, _) = self.conn.classify_failure(e).await;
                Err(e)
            }
        }
    }

    /// Replay the transaction on a fresh connection and run the failed
    /// execute once more against the remapped statement.
    async fn redispatch_execute(
        &self,
        params: &[Value],
        original: cistern_core::DbError,
    ) -> Result<StatementResult> {
        match self.conn.recover().await {
            Ok(()) => {
                let raw = self.inner.raw();
                match raw.execute(params).await {
                    Ok(result) => {
                        self.conn.record(|| RecordedOp::StatementExecute {
                            slot: self.inner.slot(),
                            params: params.to_vec(),
                        });
                        self.conn.touch_used();
                        Ok(result)
                    }
                    Err(e) => {
                        let (e, _) = self.conn.classify_failure(e).await;
                        Err(e)
                    }
                }
            }
            Err(replay_err) => {
                tracing::error!(
                    connection_id = %self.conn.id(),
                    error = %replay_err,
                    "transaction replay failed"
                );
                Err(original)
            }
        }
    }

    async fn redispatch_query(
        &self,
        params: &[Value],
        original: cistern_core::DbError,
    ) -> Result<QueryResult> {
        match self.conn.recover().await {
            Ok(()) => {
                let raw = self.inner.raw();
                match raw.query(params).await {
                    Ok(result) => {
                        self.conn.record(|| RecordedOp::StatementQuery {
                            slot: self.inner.slot(),
                            params: params.to_vec(),
                        });
                        self.conn.touch_used();
                        Ok(result)
                    }
                    Err(e) => {
                        let (e, _) = self.conn.classify_failure(e).await;
                        Err(e)
                    }
                }
            }
            Err(replay_err) => {
                tracing::error!(
                    connection_id = %self.conn.id(),
                    error = %replay_err,
                    "transaction replay failed"
                );
                Err(original)
            }
        }
    }

    /// Close the statement handle.
    ///
    /// Idempotent. When caching is on, the underlying driver statement is
    /// offered back to the connection's cache; a displaced victim is closed
    /// physically (failures logged and suppressed so the close itself never
    /// leaks an error).
    pub async fn close(&self) -> Result<()> {
        if !self.inner.logically_open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        match (self.conn.cache_for(self.inner.kind()), self.inner.key()) {
            (Some(cache), Some(key)) => {
                if let Some(victim) = cache.put(key.clone(), Arc::clone(&self.inner)) {
                    if let Err(e) = victim.close_raw().await {
                        tracing::warn!(
                            connection_id = %self.conn.id(),
                            sql = victim.sql(),
                            error = %e,
                            "failed to close statement evicted from cache"
                        );
                    }
                }
                Ok(())
            }
            _ => match self.inner.close_raw().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    let (e, _) = self.conn.classify_failure(e).await;
                    Err(e)
                }
            },
        }
    }
}
