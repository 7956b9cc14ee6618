//! End-to-end pool lifecycle scenarios against the stub driver

use std::sync::Arc;
use std::time::{Duration, Instant};

use cistern_core::RawConnection;
use cistern_pool::testing::{StubFactory, StubFailure};
use cistern_pool::{DbError, Pool, PoolConfig, Value};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn exhausted_pool_times_out_the_third_checkout() {
    let factory = StubFactory::new();
    let config = PoolConfig::new(2, 2)
        .with_partition_count(1)
        .with_connection_timeout_ms(100);
    let pool = Pool::new(config, Arc::clone(&factory))
        .await
        .expect("pool starts");

    let (first, second) = tokio::join!(pool.get_connection(), pool.get_connection());
    let first = first.expect("first checkout");
    let second = second.expect("second checkout");

    let started = Instant::now();
    let third = pool.get_connection().await;
    assert!(matches!(third, Err(DbError::AcquisitionTimedOut(_))));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(90), "waited {waited:?}");
    assert!(waited < Duration::from_millis(1_000), "waited {waited:?}");

    first.close().await.expect("close");
    second.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn statement_cache_round_trip_with_eviction() {
    let factory = StubFactory::new();
    let config = PoolConfig::new(1, 1).with_statements_cache_size(4);
    let pool = Pool::new(config, Arc::clone(&factory))
        .await
        .expect("pool starts");
    let conn = pool.get_connection().await.expect("checkout");
    let raw = factory.connection(0).expect("stub connection");

    // Five distinct statements, each closed in turn: five driver prepares.
    for i in 1..=5 {
        let stmt = conn
            .prepare_statement(format!("SELECT {i}"))
            .await
            .expect("prepare");
        stmt.execute(&[]).await.expect("execute");
        stmt.close().await.expect("close");
    }
    assert_eq!(raw.prepare_count(), 5);

    // Statements 2..=5 are cached: no new driver prepares.
    for i in 2..=5 {
        let stmt = conn
            .prepare_statement(format!("SELECT {i}"))
            .await
            .expect("prepare");
        stmt.close().await.expect("close");
    }
    assert_eq!(raw.prepare_count(), 5);

    // Statement 1 was the eviction victim: exactly one new prepare.
    let stmt = conn.prepare_statement("SELECT 1").await.expect("prepare");
    stmt.close().await.expect("close");
    assert_eq!(raw.prepare_count(), 6);

    conn.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn acquisition_retry_policy_recovers_from_transient_failures() {
    let factory = StubFactory::new();
    factory.fail_first(2);
    let config = PoolConfig::new(1, 1).with_acquire_retry(3, 10);

    let started = Instant::now();
    let pool = Pool::new(config, Arc::clone(&factory))
        .await
        .expect("pool starts on the third attempt");
    let waited = started.elapsed();

    assert!(waited >= Duration::from_millis(20), "waited {waited:?}");
    assert_eq!(factory.attempts(), 3);

    let conn = pool.get_connection().await.expect("checkout");
    conn.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn database_down_kills_the_pool_until_it_reprovisions() {
    let factory = StubFactory::new();
    let config = PoolConfig::new(2, 2).with_connection_timeout_ms(2_000);
    let pool = Pool::new(config, Arc::clone(&factory))
        .await
        .expect("pool starts");

    let conn = pool.get_connection().await.expect("checkout");
    let backing_url = conn.metadata().await.expect("metadata").url;
    let raw = factory
        .connections()
        .into_iter()
        .find(|c| backing_url.ends_with(&format!("/{}", c.id())))
        .expect("backing stub");

    raw.fail_next(StubFailure::with_state("communication link failure", "08S01"));
    conn.commit().await.expect_err("failure surfaces to the caller");

    conn.close().await.expect("close");
    settle().await;

    // Every original connection was physically closed exactly once.
    for stub in factory.connections().into_iter().take(2) {
        assert_eq!(stub.close_count(), 1, "stub {}", stub.id());
    }

    // Growth reprovisions the partition; checkouts succeed again.
    let recovered = pool
        .get_connection()
        .await
        .expect("checkout after reprovisioning");
    recovered.close().await.expect("close");
    pool.shutdown().await;
}

#[tokio::test]
async fn double_close_under_watch_is_silent_to_the_caller() {
    let factory = StubFactory::new();
    let config = PoolConfig::new(1, 1).with_close_connection_watch(true);
    let pool = Pool::new(config, Arc::clone(&factory))
        .await
        .expect("pool starts");

    let conn = pool.get_connection().await.expect("checkout");
    conn.close().await.expect("first close");
    conn.close().await.expect("second close must not propagate anything");
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_never_exceed_pool_capacity() {
    let factory = StubFactory::new();
    let config = PoolConfig::new(1, 4)
        .with_partition_count(2)
        .with_acquire_increment(2)
        .with_connection_timeout_ms(1_000);
    let pool = Pool::new(config, Arc::clone(&factory))
        .await
        .expect("pool starts");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                match pool.get_connection().await {
                    Ok(conn) => {
                        conn.execute("SELECT 1", &[Value::Int(1)])
                            .await
                            .expect("execute");
                        conn.close().await.expect("close");
                    }
                    Err(DbError::AcquisitionTimedOut(_)) => {}
                    Err(other) => panic!("unexpected checkout error: {other}"),
                }
            }
        }));
    }
    for task in tasks {
        task.await.expect("worker task");
    }

    for usage in pool.partition_usage() {
        assert!(
            usage.created <= usage.max,
            "partition {} exceeded its ceiling",
            usage.partition
        );
        assert!(usage.free <= usage.created);
    }
    // Total live connections never exceeded the pool-wide capacity.
    assert!(factory.connections().iter().filter(|c| !c.is_closed()).count() <= 8);
    pool.shutdown().await;
}

#[tokio::test]
async fn hooks_observe_the_connection_lifecycle() {
    use cistern_pool::{ConnectionHandle, ConnectionHook};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHook {
        acquired: AtomicUsize,
        checked_out: AtomicUsize,
        checked_in: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl ConnectionHook for CountingHook {
        fn on_acquire(&self, _connection: &ConnectionHandle) {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }
        fn on_check_out(&self, _connection: &ConnectionHandle) {
            self.checked_out.fetch_add(1, Ordering::SeqCst);
        }
        fn on_check_in(&self, _connection: &ConnectionHandle) {
            self.checked_in.fetch_add(1, Ordering::SeqCst);
        }
        fn on_destroy(&self, _connection: &ConnectionHandle) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    let factory = StubFactory::new();
    let hook = Arc::new(CountingHook::default());
    let pool = Pool::with_hook(PoolConfig::new(2, 2), Arc::clone(&factory), hook.clone())
        .await
        .expect("pool starts");

    assert_eq!(hook.acquired.load(Ordering::SeqCst), 2);

    let conn = pool.get_connection().await.expect("checkout");
    assert_eq!(hook.checked_out.load(Ordering::SeqCst), 1);
    conn.close().await.expect("close");
    settle().await;
    assert_eq!(hook.checked_in.load(Ordering::SeqCst), 1);

    pool.shutdown().await;
    assert_eq!(hook.destroyed.load(Ordering::SeqCst), 2);
}
