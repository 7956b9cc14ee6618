//! Background maintenance workers
//!
//! Three kinds of worker keep the pool healthy:
//!
//! - *Release workers* drain the pool-wide release queue and return
//!   handles to their partitions. A failed release is logged and the
//!   worker keeps going, so release capacity never degrades silently.
//! - A *keep-alive worker* per partition retires expired and over-idle
//!   handles and probes the rest on the configured cadence.
//! - A *growth worker* per partition creates connections in acquire-
//!   increment batches whenever checkout or maintenance signals demand.
//!
//! Graceful shutdown: the pool closes the release channel and notifies;
//! release workers drain what is left and exit, the periodic workers are
//! aborted.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;

use crate::handle::HandleInner;

use super::partition::ConnectionPartition;
use super::pool::PoolInner;

pub(crate) fn spawn_workers(
    pool: &Arc<PoolInner>,
    release_rx: mpsc::UnboundedReceiver<Arc<HandleInner>>,
) {
    let shutdown = Arc::clone(&pool.shutdown_signal);

    let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));
    let mut release_workers = pool.release_workers.lock();
    for index in 0..pool.config.release_helper_count() {
        release_workers.push(tokio::spawn(release_worker(
            index,
            Arc::downgrade(pool),
            Arc::clone(&release_rx),
            Arc::clone(&shutdown),
        )));
    }
    drop(release_workers);

    let period = pool.config.idle_connection_test_period();
    let mut maintenance_workers = pool.maintenance_workers.lock();
    for partition in &pool.partitions {
        maintenance_workers.push(tokio::spawn(keepalive_worker(
            Arc::downgrade(pool),
            Arc::clone(partition),
            period,
            Arc::clone(&shutdown),
        )));
        maintenance_workers.push(tokio::spawn(growth_worker(
            Arc::downgrade(pool),
            Arc::clone(partition),
            Arc::clone(&shutdown),
        )));
    }
}

/// Consumes the pool-wide release queue.
async fn release_worker(
    index: usize,
    pool: Weak<PoolInner>,
    release_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<HandleInner>>>>,
    shutdown: Arc<Notify>,
) {
    loop {
        let message = {
            let mut rx = release_rx.lock().await;
            tokio::select! {
                _ = shutdown.notified() => None,
                message = rx.recv() => message,
            }
        };
        match message {
            Some(inner) => {
                let Some(pool) = pool.upgrade() else { break };
                pool.internal_release(inner).await;
            }
            // Shutdown signal or channel closed either way: drain and go.
            None => break,
        }
    }

    if let Some(pool) = pool.upgrade() {
        let mut rx = release_rx.lock().await;
        while let Ok(inner) = rx.try_recv() {
            pool.internal_release(inner).await;
        }
    }
    tracing::debug!(worker = index, "release worker stopped");
}

/// Periodically walks a partition's free queue: retires the expired and
/// the over-idle, probes the stale, and tops the partition back up to min.
async fn keepalive_worker(
    pool: Weak<PoolInner>,
    partition: Arc<ConnectionPartition>,
    period: Duration,
    shutdown: Arc<Notify>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it so the
    // first pass happens one full period after startup.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = interval.tick() => {}
        }
        let Some(pool) = pool.upgrade() else { break };
        if pool.is_shutting_down() {
            break;
        }
        pool.keepalive_pass(&partition).await;
    }
    tracing::debug!(partition = partition.index(), "keep-alive worker stopped");
}

/// Creates connections for a partition whenever demand is signalled.
async fn growth_worker(
    pool: Weak<PoolInner>,
    partition: Arc<ConnectionPartition>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = partition.growth_requested() => {}
        }
        let Some(pool) = pool.upgrade() else { break };
        if pool.is_shutting_down() {
            break;
        }
        pool.grow_partition(&partition).await;
    }
    tracing::debug!(partition = partition.index(), "growth worker stopped");
}
