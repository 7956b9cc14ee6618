//! Pool extension hooks
//!
//! A single [`ConnectionHook`] trait carries every callback the pool
//! exposes. Hooks are synchronous: they flip flags, log, or decide retry
//! policy. Any sleeping between acquisition attempts is done by the pool
//! itself.

use std::time::Duration;

use cistern_core::{DbError, SqlState};

use crate::handle::ConnectionHandle;

/// Verdict a hook can hand back from the classification callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No opinion; use the SQLSTATE table
    #[default]
    Nop,
    /// Treat the connection as broken regardless of the SQLSTATE
    ConnectionPossiblyBroken,
    /// Treat the database as down: kill every pooled connection
    TerminateAllConnections,
}

/// Mutable retry state threaded through `on_acquire_fail`.
///
/// `attempts_remaining` counts down; -1 means retry forever.
#[derive(Debug, Clone)]
pub struct AcquireFailConfig {
    attempts_remaining: i32,
    delay: Duration,
    log_message: String,
}

impl AcquireFailConfig {
    pub fn new(attempts: i32, delay: Duration, log_message: impl Into<String>) -> Self {
        Self {
            attempts_remaining: attempts,
            delay,
            log_message: log_message.into(),
        }
    }

    pub fn attempts_remaining(&self) -> i32 {
        self.attempts_remaining
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn log_message(&self) -> &str {
        &self.log_message
    }

    /// Consume one attempt. Returns whether another try is allowed.
    pub fn take_attempt(&mut self) -> bool {
        match self.attempts_remaining {
            -1 => true,
            0 => false,
            _ => {
                self.attempts_remaining -= 1;
                true
            }
        }
    }
}

/// Default retry decision used when no hook is installed (and by the
/// trait's own default `on_acquire_fail`).
pub(crate) fn default_on_acquire_fail(error: &DbError, acquire: &mut AcquireFailConfig) -> bool {
    tracing::error!(
        error = %error,
        attempts_remaining = acquire.attempts_remaining(),
        retry_delay_ms = acquire.delay().as_millis() as u64,
        "{}",
        acquire.log_message(),
    );
    acquire.take_attempt()
}

/// Extension interface for observing and steering the pool.
///
/// All callbacks have no-op defaults; implement only what you need.
#[allow(unused_variables)]
pub trait ConnectionHook: Send + Sync {
    /// A new physical connection was acquired from the driver
    fn on_acquire(&self, connection: &ConnectionHandle) {}

    /// A connection was checked out to a client
    fn on_check_out(&self, connection: &ConnectionHandle) {}

    /// A connection was closed by a client and is headed back to the pool
    fn on_check_in(&self, connection: &ConnectionHandle) {}

    /// A connection is about to be physically destroyed
    fn on_destroy(&self, connection: &ConnectionHandle) {}

    /// An acquisition attempt failed. Return `true` to retry.
    fn on_acquire_fail(&self, error: &DbError, acquire: &mut AcquireFailConfig) -> bool {
        default_on_acquire_fail(error, acquire)
    }

    /// A driver error is being classified. The returned state can escalate
    /// the SQLSTATE verdict (it can never downgrade it).
    fn on_mark_possibly_broken(
        &self,
        connection: &ConnectionHandle,
        sql_state: &SqlState,
        error: &DbError,
    ) -> ConnectionState {
        ConnectionState::Nop
    }

    /// A connection was just flagged broken. Return `false` to veto the
    /// flag, for clients that understand their database's error codes
    /// better than the SQLSTATE table does.
    fn on_connection_exception(
        &self,
        connection: &ConnectionHandle,
        sql_state: &SqlState,
        error: &DbError,
    ) -> bool {
        true
    }
}
