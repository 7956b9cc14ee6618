//! End-to-end transaction replay scenarios

use std::sync::Arc;
use std::time::Duration;

use cistern_pool::testing::{StubFactory, StubFailure};
use cistern_pool::{Pool, PoolConfig, Value};

const UPDATE: &str = "UPDATE accounts SET balance = balance - ? WHERE id = ?";

#[tokio::test]
async fn broken_connection_mid_transaction_replays_onto_a_fresh_one() {
    let factory = StubFactory::new();
    let config = PoolConfig::new(1, 2).with_transaction_recovery(true);
    let pool = Pool::new(config, Arc::clone(&factory))
        .await
        .expect("pool starts");

    let conn = pool.get_connection().await.expect("checkout");
    conn.set_auto_commit(false).await.expect("begin transaction");

    let stmt = conn.prepare_statement(UPDATE).await.expect("prepare");
    stmt.execute(&[Value::Int(100), Value::Int(1)])
        .await
        .expect("first execute");

    // The connection dies between the two executes.
    let original = factory.connection(0).expect("original stub");
    original.fail_next(StubFailure::with_state("connection does not exist", "08003"));

    stmt.execute(&[Value::Int(100), Value::Int(2)])
        .await
        .expect("second execute succeeds via replay");

    // A fresh physical connection was obtained and the transaction
    // replayed onto it before the failed execute was re-dispatched.
    assert_eq!(factory.created(), 2);
    let fresh = factory.connection(1).expect("fresh stub");
    assert_eq!(
        fresh.operations(),
        vec![
            "set_auto_commit:false".to_string(),
            format!("prepare:{UPDATE}"),
            format!("stmt_execute:{UPDATE}"),
            format!("stmt_execute:{UPDATE}"),
        ]
    );

    // The statement handle now fronts the freshly prepared statement.
    let fresh_statement = fresh.statements().into_iter().next().expect("statement");
    assert_eq!(fresh_statement.executes(), 2);
    let original_statement = original.statements().into_iter().next().expect("statement");
    assert_eq!(original_statement.executes(), 1);

    // The broken physical connection was closed, and the handle is
    // healthy again.
    assert_eq!(original.close_count(), 1);
    assert!(!conn.possibly_broken());

    // Committing goes to the fresh connection.
    conn.commit().await.expect("commit");
    assert_eq!(fresh.commits(), 1);
    assert_eq!(original.commits(), 0);

    conn.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn commit_clears_the_replay_log() {
    let factory = StubFactory::new();
    let config = PoolConfig::new(1, 2).with_transaction_recovery(true);
    let pool = Pool::new(config, Arc::clone(&factory))
        .await
        .expect("pool starts");

    let conn = pool.get_connection().await.expect("checkout");
    conn.set_auto_commit(false).await.expect("begin");
    conn.execute("INSERT INTO audit VALUES (1)", &[])
        .await
        .expect("execute");
    conn.commit().await.expect("commit");

    // Fail the next operation; recovery must not replay the committed
    // transaction onto the fresh connection.
    let original = factory.connection(0).expect("original stub");
    original.fail_next(StubFailure::with_state("connection lost", "08003"));
    conn.execute("INSERT INTO audit VALUES (2)", &[])
        .await
        .expect("execute succeeds via recovery");

    let fresh = factory.connection(1).expect("fresh stub");
    assert_eq!(
        fresh.operations(),
        vec!["execute:INSERT INTO audit VALUES (2)".to_string()],
        "a committed transaction must not be replayed"
    );

    conn.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn rollback_clears_the_replay_log() {
    let factory = StubFactory::new();
    let config = PoolConfig::new(1, 2).with_transaction_recovery(true);
    let pool = Pool::new(config, Arc::clone(&factory))
        .await
        .expect("pool starts");

    let conn = pool.get_connection().await.expect("checkout");
    conn.set_auto_commit(false).await.expect("begin");
    conn.execute("INSERT INTO audit VALUES (1)", &[])
        .await
        .expect("execute");
    conn.rollback().await.expect("rollback");

    let original = factory.connection(0).expect("original stub");
    original.fail_next(StubFailure::with_state("connection lost", "08003"));
    conn.execute("INSERT INTO audit VALUES (2)", &[])
        .await
        .expect("execute succeeds via recovery");

    let fresh = factory.connection(1).expect("fresh stub");
    assert_eq!(
        fresh.operations(),
        vec!["execute:INSERT INTO audit VALUES (2)".to_string()],
        "a rolled-back transaction must not be replayed"
    );

    conn.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn failed_replay_surfaces_the_original_error() {
    let factory = StubFactory::new();
    let config = PoolConfig::new(1, 2)
        .with_transaction_recovery(true)
        .with_acquire_retry(0, 1);
    let pool = Pool::new(config, Arc::clone(&factory))
        .await
        .expect("pool starts");

    let conn = pool.get_connection().await.expect("checkout");
    conn.set_auto_commit(false).await.expect("begin");

    // Break the live connection and make reacquisition impossible.
    let original = factory.connection(0).expect("original stub");
    factory.fail_first(usize::MAX);
    original.fail_next(StubFailure::with_state("connection lost", "08003"));

    let err = conn
        .execute("INSERT INTO audit VALUES (1)", &[])
        .await
        .expect_err("recovery cannot succeed");
    assert_eq!(
        err.sql_state().map(|s| s.as_str().to_string()),
        Some("08003".to_string()),
        "the caller sees the original driver error"
    );
    assert!(conn.possibly_broken());

    conn.close().await.expect("close");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(original.close_count(), 1, "broken connection retired on release");
    pool.shutdown().await;
}
