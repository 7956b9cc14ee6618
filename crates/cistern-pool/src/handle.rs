//! Logical connection and statement handles
//!
//! A [`ConnectionHandle`] wraps one physical connection and interposes on
//! every operation: it refuses use after logical close, routes statement
//! preparation through the per-handle caches, classifies driver failures,
//! and (when enabled) records operations for transaction replay.
//!
//! Closing a handle never closes the physical connection: the handle is
//! queued for release and a background worker returns it to its partition.

mod handle;
mod statement;

#[cfg(test)]
mod tests;

pub use handle::ConnectionHandle;
pub use statement::{StatementHandle, StatementKind};

pub(crate) use handle::{HandleInner, SharedHook};
pub(crate) use statement::StatementInner;
