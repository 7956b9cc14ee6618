//! Bounded LRU statement cache

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handle::StatementInner;
use crate::stats::Statistics;

use super::key::StatementKey;

struct CacheInner {
    map: HashMap<StatementKey, Arc<StatementInner>>,
    /// Insertion recency, oldest at the front. Always holds exactly the
    /// keys present in `map`.
    order: VecDeque<StatementKey>,
}

/// Bounded map from statement key to a reusable statement.
///
/// A hit *removes* the entry (the statement is handed back to the client);
/// closing the statement offers it back under its key. When an insert
/// overflows the bound, the least recently inserted entry is evicted and
/// must be closed physically by the caller.
pub(crate) struct StatementCache {
    capacity: usize,
    stats: Option<Arc<Statistics>>,
    inner: Mutex<CacheInner>,
}

impl StatementCache {
    pub(crate) fn new(capacity: usize, stats: Option<Arc<Statistics>>) -> Self {
        Self {
            capacity,
            stats,
            inner: Mutex::new(CacheInner {
                map: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
        }
    }

    /// Look up and remove the statement cached under `key`.
    pub(crate) fn take(&self, key: &StatementKey) -> Option<Arc<StatementInner>> {
        let taken = {
            let mut inner = self.inner.lock();
            let taken = inner.map.remove(key);
            if taken.is_some()
                && let Some(pos) = inner.order.iter().position(|k| k == key)
            {
                inner.order.remove(pos);
            }
            taken
        };
        if let Some(stats) = &self.stats {
            if taken.is_some() {
                stats.increment_cache_hits();
            } else {
                stats.increment_cache_misses();
            }
        }
        taken
    }

    /// Offer a statement back to the cache.
    ///
    /// Returns the displaced statement when one had to make room: either a
    /// previous entry under the same key, or the least recently inserted
    /// entry when the cache was full. The caller owns closing it.
    pub(crate) fn put(
        &self,
        key: StatementKey,
        statement: Arc<StatementInner>,
    ) -> Option<Arc<StatementInner>> {
        let mut inner = self.inner.lock();
        if let Some(replaced) = inner.map.insert(key.clone(), statement) {
            // Same key offered twice; keep the newer one, recency unchanged.
            return Some(replaced);
        }
        inner.order.push_back(key);
        if inner.map.len() > self.capacity {
            if let Some(victim_key) = inner.order.pop_front() {
                return inner.map.remove(&victim_key);
            }
        }
        None
    }

    /// Remove every entry. The caller owns closing them.
    pub(crate) fn drain(&self) -> Vec<Arc<StatementInner>> {
        let mut inner = self.inner.lock();
        inner.order.clear();
        inner.map.drain().map(|(_, stmt)| stmt).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
