//! Error types for cistern

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A five-character SQLSTATE code as reported by a database driver.
///
/// The first two characters form the class (`08` = connection exception,
/// `40` = transaction rollback, ...); the remaining three identify the
/// condition within the class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqlState(String);

impl SqlState {
    /// SQLSTATE substituted when a driver reports an error without one.
    pub const UNKNOWN: &'static str = "08999";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two-character class prefix, or the whole code if shorter.
    pub fn class(&self) -> &str {
        self.0.get(..2).unwrap_or(&self.0)
    }

    pub fn first_char(&self) -> Option<char> {
        self.0.chars().next()
    }
}

impl std::fmt::Display for SqlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SqlState {
    fn from(code: &str) -> Self {
        Self(code.to_string())
    }
}

/// Core error type for cistern operations
#[derive(Error, Debug)]
pub enum DbError {
    /// An error surfaced by the underlying driver. Carries the SQLSTATE
    /// when the driver reported one.
    #[error("driver error{}: {message}", sql_state.as_ref().map(|s| format!(" [{s}]")).unwrap_or_default())]
    Driver {
        message: String,
        sql_state: Option<SqlState>,
    },

    #[error("failed to acquire connection: {0}")]
    AcquisitionFailed(String),

    #[error("timed out after {0:?} waiting for a connection")]
    AcquisitionTimedOut(Duration),

    #[error("connection handle is closed")]
    ClosedHandle,

    #[error("pool is shutting down")]
    ShutdownInProgress,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Driver error without a SQLSTATE.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
            sql_state: None,
        }
    }

    /// Driver error carrying a SQLSTATE code.
    pub fn driver_with_state(message: impl Into<String>, state: impl Into<SqlState>) -> Self {
        Self::Driver {
            message: message.into(),
            sql_state: Some(state.into()),
        }
    }

    /// The SQLSTATE attached to this error, if it is a driver error that
    /// carried one.
    pub fn sql_state(&self) -> Option<&SqlState> {
        match self {
            Self::Driver { sql_state, .. } => sql_state.as_ref(),
            _ => None,
        }
    }

    /// True for errors originating in the driver (as opposed to pool
    /// bookkeeping errors like timeouts or closed handles).
    pub fn is_driver_error(&self) -> bool {
        matches!(self, Self::Driver { .. })
    }
}

/// Result type alias for cistern operations
pub type Result<T> = std::result::Result<T, DbError>;
