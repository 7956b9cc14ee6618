//! Per-handle statement caching
//!
//! Every connection handle owns up to two bounded caches (prepared and
//! callable statements), keyed by the full preparation spec. The caches are
//! only touched by whoever holds the handle, so a plain mutex is enough.
//!
//! Eviction policy is LRU over insertion recency: a lookup removes the
//! entry (the statement goes back to the client), a close re-inserts it at
//! the recent end, and when the cache is full the entry at the old end is
//! closed physically.

mod cache;
mod key;


pub use key::StatementKey;

pub(crate) use cache::StatementCache;
