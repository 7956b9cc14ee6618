//! Tests for the connection handle

use std::sync::Arc;
use std::time::Duration;

use cistern_core::{DbError, SqlState, Value};

use crate::config::PoolConfig;
use crate::hooks::{ConnectionHook, ConnectionState};
use crate::pool::Pool;
use crate::testing::{StubFactory, StubFailure};

use super::ConnectionHandle;

async fn pool_with(config: PoolConfig) -> (Pool, Arc<StubFactory>) {
    let factory = StubFactory::new();
    let pool = Pool::new(config, Arc::clone(&factory))
        .await
        .expect("pool starts");
    (pool, factory)
}

/// Give the async release workers a moment to drain.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn operations_fail_after_close() {
    let (pool, _factory) = pool_with(PoolConfig::new(1, 1)).await;
    let conn = pool.get_connection().await.expect("checkout");

    conn.execute("INSERT INTO t VALUES (1)", &[]).await.expect("execute");
    conn.close().await.expect("close");

    assert!(conn.is_closed());
    assert!(matches!(
        conn.execute("INSERT INTO t VALUES (2)", &[]).await,
        Err(DbError::ClosedHandle)
    ));
    assert!(matches!(conn.commit().await, Err(DbError::ClosedHandle)));
    assert!(matches!(
        conn.prepare_statement("SELECT 1").await,
        Err(DbError::ClosedHandle)
    ));
    // Closing again is a no-op.
    conn.close().await.expect("second close");
    pool.shutdown().await;
}

#[tokio::test]
async fn double_close_with_watch_never_errors() {
    let config = PoolConfig::new(1, 1).with_close_connection_watch(true);
    let (pool, _factory) = pool_with(config).await;
    let conn = pool.get_connection().await.expect("checkout");

    conn.close().await.expect("first close");
    conn.close().await.expect("second close");
    conn.close().await.expect("third close");
    pool.shutdown().await;
}

#[tokio::test]
async fn operations_delegate_to_raw_connection() {
    let (pool, factory) = pool_with(PoolConfig::new(1, 1)).await;
    let conn = pool.get_connection().await.expect("checkout");

    conn.set_catalog("app").await.expect("set catalog");
    assert_eq!(conn.catalog().await.expect("catalog"), Some("app".into()));

    conn.set_auto_commit(false).await.expect("set auto commit");
    assert!(!conn.auto_commit().await.expect("auto commit"));

    conn.set_read_only(true).await.expect("set read only");
    assert!(conn.is_read_only().await.expect("read only"));

    let savepoint = conn.set_savepoint(Some("before")).await.expect("savepoint");
    conn.rollback_to_savepoint(&savepoint).await.expect("rollback to");
    conn.release_savepoint(&savepoint).await.expect("release");

    assert!(conn.warnings().await.expect("warnings").is_empty());
    assert!(conn.is_valid(Duration::from_secs(1)).await.expect("valid"));

    let raw = factory.connection(0).expect("connection");
    let ops = raw.operations();
    assert!(ops.contains(&"set_catalog:app".to_string()));
    assert!(ops.contains(&"savepoint:before".to_string()));

    conn.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn data_errors_keep_the_connection_poolable() {
    let (pool, factory) = pool_with(PoolConfig::new(1, 1)).await;
    let conn = pool.get_connection().await.expect("checkout");
    let raw = factory.connection(0).expect("connection");

    raw.fail_next(StubFailure::with_state("duplicate key", "23505"));
    let err = conn
        .execute("INSERT INTO t VALUES (1)", &[])
        .await
        .expect_err("injected failure surfaces");
    assert_eq!(err.sql_state().map(SqlState::as_str), Some("23505"));
    assert!(!conn.possibly_broken());

    conn.close().await.expect("close");
    settle().await;

    // The physical connection survived and gets reused.
    assert_eq!(raw.close_count(), 0);
    let again = pool.get_connection().await.expect("checkout again");
    again.close().await.expect("close");
    assert_eq!(factory.created(), 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn connection_class_errors_retire_on_release() {
    let (pool, factory) = pool_with(PoolConfig::new(1, 2)).await;
    let conn = pool.get_connection().await.expect("checkout");
    let raw = factory.connection(0).expect("connection");

    raw.fail_next(StubFailure::with_state("connection does not exist", "08003"));
    conn.clear_warnings().await.expect_err("injected failure surfaces");
    assert!(conn.possibly_broken());

    conn.close().await.expect("close");
    settle().await;

    // Retired physically, exactly once.
    assert_eq!(raw.close_count(), 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn database_down_terminates_every_connection() {
    let (pool, factory) = pool_with(PoolConfig::new(2, 2)).await;
    let conn = pool.get_connection().await.expect("checkout");

    let backing_id = conn_stub_id(&conn).await;
    let raw = factory
        .connections()
        .into_iter()
        .find(|c| c.id() == backing_id)
        .expect("backing connection");
    raw.fail_next(StubFailure::with_state("communication link failure", "08S01"));
    conn.commit().await.expect_err("injected failure surfaces");
    assert!(conn.possibly_broken());

    conn.close().await.expect("close");
    settle().await;

    // Both initial connections were closed, each exactly once.
    for stub in factory.connections().into_iter().take(2) {
        assert_eq!(stub.close_count(), 1, "connection {} close count", stub.id());
    }

    // The growth worker reprovisions, so checkouts work again.
    let recovered = pool.get_connection().await.expect("checkout after termination");
    recovered.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn statement_cache_reuses_driver_statements() {
    let config = PoolConfig::new(1, 1)
        .with_statements_cache_size(4)
        .with_statistics(true);
    let (pool, factory) = pool_with(config).await;
    let conn = pool.get_connection().await.expect("checkout");
    let raw = factory.connection(0).expect("connection");

    let stmt = conn
        .prepare_statement("SELECT * FROM users WHERE id = ?")
        .await
        .expect("prepare");
    stmt.execute(&[Value::Int(1)]).await.expect("execute");
    stmt.close().await.expect("close statement");
    assert_eq!(raw.prepare_count(), 1);

    let stmt = conn
        .prepare_statement("SELECT * FROM users WHERE id = ?")
        .await
        .expect("prepare again");
    stmt.execute(&[Value::Int(2)]).await.expect("execute");
    stmt.close().await.expect("close statement");
    assert_eq!(raw.prepare_count(), 1, "second prepare must hit the cache");

    let stats = pool.statistics();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.statements_prepared, 2);

    conn.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn cache_evicts_least_recently_inserted_statement() {
    let config = PoolConfig::new(1, 1).with_statements_cache_size(4);
    let (pool, factory) = pool_with(config).await;
    let conn = pool.get_connection().await.expect("checkout");
    let raw = factory.connection(0).expect("connection");

    for i in 1..=5 {
        let stmt = conn
            .prepare_statement(format!("SELECT {i}"))
            .await
            .expect("prepare");
        stmt.close().await.expect("close");
    }
    assert_eq!(raw.prepare_count(), 5);

    // SELECT 2..=5 are still cached.
    for i in 2..=5 {
        let stmt = conn
            .prepare_statement(format!("SELECT {i}"))
            .await
            .expect("prepare");
        stmt.close().await.expect("close");
    }
    assert_eq!(raw.prepare_count(), 5, "cached statements must not re-prepare");

    // SELECT 1 was the eviction victim.
    let stmt = conn.prepare_statement("SELECT 1").await.expect("prepare");
    stmt.close().await.expect("close");
    assert_eq!(raw.prepare_count(), 6);

    conn.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn closed_statement_refuses_use() {
    let config = PoolConfig::new(1, 1).with_statements_cache_size(4);
    let (pool, _factory) = pool_with(config).await;
    let conn = pool.get_connection().await.expect("checkout");

    let stmt = conn.prepare_statement("SELECT 1").await.expect("prepare");
    stmt.close().await.expect("close");
    assert!(stmt.is_closed());
    assert!(matches!(stmt.execute(&[]).await, Err(DbError::ClosedHandle)));
    // Closing twice is fine.
    stmt.close().await.expect("second close");

    conn.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn expiry_is_a_strict_age_comparison() {
    let config = PoolConfig::new(1, 1).with_max_connection_age_ms(10_000);
    let (pool, _factory) = pool_with(config).await;
    let conn = pool.get_connection().await.expect("checkout");

    let inner = conn.inner();
    let now = inner.now_ms();
    let created = now - inner.age_ms(now);
    assert!(!inner.is_expired_at(created + 10_000));
    assert!(inner.is_expired_at(created + 10_001));

    conn.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn zero_max_age_never_expires() {
    let (pool, _factory) = pool_with(PoolConfig::new(1, 1)).await;
    let conn = pool.get_connection().await.expect("checkout");
    assert!(!conn.inner().is_expired_at(u64::MAX));
    conn.close().await.expect("close");
    pool.shutdown().await;
}

struct VetoHook;

impl ConnectionHook for VetoHook {
    fn on_connection_exception(
        &self,
        _connection: &ConnectionHandle,
        _sql_state: &SqlState,
        _error: &DbError,
    ) -> bool {
        false
    }
}

#[tokio::test]
async fn hook_can_veto_the_broken_flag() {
    let factory = StubFactory::new();
    let pool = Pool::with_hook(
        PoolConfig::new(1, 1),
        Arc::clone(&factory),
        Arc::new(VetoHook),
    )
    .await
    .expect("pool starts");
    let conn = pool.get_connection().await.expect("checkout");
    let raw = factory.connection(0).expect("connection");

    raw.fail_next(StubFailure::with_state("connection does not exist", "08003"));
    conn.clear_warnings().await.expect_err("error still surfaces");
    assert!(!conn.possibly_broken(), "hook veto must clear the flag");

    conn.close().await.expect("close");
    settle().await;
    assert_eq!(raw.close_count(), 0, "vetoed connection stays pooled");
    pool.shutdown().await;
}

struct EscalatingHook;

impl ConnectionHook for EscalatingHook {
    fn on_mark_possibly_broken(
        &self,
        _connection: &ConnectionHandle,
        _sql_state: &SqlState,
        _error: &DbError,
    ) -> ConnectionState {
        ConnectionState::TerminateAllConnections
    }
}

#[tokio::test]
async fn hook_can_escalate_to_termination() {
    let factory = StubFactory::new();
    let pool = Pool::with_hook(
        PoolConfig::new(2, 2),
        Arc::clone(&factory),
        Arc::new(EscalatingHook),
    )
    .await
    .expect("pool starts");
    let conn = pool.get_connection().await.expect("checkout");

    let backing_id = conn_stub_id(&conn).await;
    let raw = factory
        .connections()
        .into_iter()
        .find(|c| c.id() == backing_id)
        .expect("backing connection");
    // A harmless SQLSTATE, escalated by the hook.
    raw.fail_next(StubFailure::with_state("duplicate key", "23505"));
    conn.execute("INSERT INTO t VALUES (1)", &[])
        .await
        .expect_err("error surfaces");

    settle().await;
    let idle_closed = factory
        .connections()
        .iter()
        .take(2)
        .filter(|c| c.close_count() > 0)
        .count();
    assert!(idle_closed >= 1, "termination must close the idle connection");

    conn.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn dropped_handle_returns_to_the_pool() {
    let (pool, factory) = pool_with(PoolConfig::new(1, 1)).await;
    let conn = pool.get_connection().await.expect("checkout");
    drop(conn);
    settle().await;

    let again = pool.get_connection().await.expect("checkout after drop");
    again.close().await.expect("close");
    assert_eq!(factory.created(), 1, "the leaked handle was re-pooled");
    pool.shutdown().await;
}

/// Recover the stub id backing a handle, via the metadata url.
async fn conn_stub_id(conn: &ConnectionHandle) -> usize {
    let url = conn.metadata().await.expect("metadata").url;
    url.rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .expect("stub url ends in the id")
}
