//! One shard of the pool

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::handle::HandleInner;

/// A single pool shard: a bounded free queue of handles, the live
/// connection count, and the signal that wakes the partition's growth
/// worker.
///
/// The semaphore mirrors the free-queue length so takers can block with a
/// deadline without holding the queue lock.
pub(crate) struct ConnectionPartition {
    index: usize,
    min_connections: usize,
    max_connections: usize,
    acquire_increment: usize,
    free: Mutex<VecDeque<Arc<HandleInner>>>,
    available: Semaphore,
    /// Live connections originating here: free + checked out
    created: AtomicUsize,
    /// Set while the partition sits at its ceiling
    unable_to_create_more: AtomicBool,
    grow_signal: Notify,
}

impl ConnectionPartition {
    pub(crate) fn new(
        index: usize,
        min_connections: usize,
        max_connections: usize,
        acquire_increment: usize,
    ) -> Self {
        Self {
            index,
            min_connections,
            max_connections,
            acquire_increment,
            free: Mutex::new(VecDeque::with_capacity(max_connections)),
            available: Semaphore::new(0),
            created: AtomicUsize::new(0),
            unable_to_create_more: AtomicBool::new(false),
            grow_signal: Notify::new(),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn min_connections(&self) -> usize {
        self.min_connections
    }

    pub(crate) fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub(crate) fn acquire_increment(&self) -> usize {
        self.acquire_increment
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub(crate) fn increment_created(&self) {
        self.created.fetch_add(1, Ordering::AcqRel);
        self.refresh_saturation();
    }

    pub(crate) fn decrement_created(&self) {
        self.created.fetch_sub(1, Ordering::AcqRel);
        self.refresh_saturation();
    }

    fn refresh_saturation(&self) {
        self.unable_to_create_more
            .store(self.created() >= self.max_connections, Ordering::Release);
    }

    pub(crate) fn is_saturated(&self) -> bool {
        self.unable_to_create_more.load(Ordering::Acquire)
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Return a handle to the free queue.
    pub(crate) fn put(&self, handle: Arc<HandleInner>) {
        self.free.lock().push_back(handle);
        self.available.add_permits(1);
    }

    /// Non-blocking dequeue.
    pub(crate) fn try_take(&self) -> Option<Arc<HandleInner>> {
        match self.available.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.free.lock().pop_front()
            }
            Err(_) => None,
        }
    }

    /// Dequeue, blocking up to `timeout`. Returns `None` on deadline or
    /// when the partition has been closed for shutdown.
    pub(crate) async fn take(&self, timeout: Duration) -> Option<Arc<HandleInner>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let permit = match tokio::time::timeout_at(deadline, self.available.acquire()).await {
                Ok(Ok(permit)) => permit,
                // Deadline hit, or semaphore closed by shutdown.
                Ok(Err(_)) | Err(_) => return None,
            };
            permit.forget();
            if let Some(handle) = self.free.lock().pop_front() {
                return Some(handle);
            }
            // Every removal is permit-gated, so the pop should never come
            // up empty; retry until the deadline rather than trust that.
        }
    }

    /// Empty the free queue.
    ///
    /// Every removal goes through `try_take`, so each drained handle
    /// consumes its own permit and the permit count never diverges from
    /// the queue length. A handle whose `put` has pushed it but not yet
    /// added its permit is left behind; it stays takeable once the permit
    /// lands.
    pub(crate) fn drain(&self) -> Vec<Arc<HandleInner>> {
        let mut drained = Vec::new();
        while let Some(handle) = self.try_take() {
            drained.push(handle);
        }
        drained
    }

    /// Wake the partition's growth worker.
    pub(crate) fn signal_growth(&self) {
        self.grow_signal.notify_one();
    }

    pub(crate) async fn growth_requested(&self) {
        self.grow_signal.notified().await;
    }

    /// Wake every blocked taker; used at shutdown.
    pub(crate) fn close(&self) {
        self.available.close();
    }
}
