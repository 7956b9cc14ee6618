//! Raw connection and statement traits
//!
//! These traits are the boundary between the pool and a database driver.
//! The pool treats implementations as opaque: it never inspects a raw
//! connection beyond this capability set, and drivers never see the pool.

use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    DatabaseMetadata, DbError, Holdability, IsolationLevel, QueryResult, Result, Savepoint,
    SqlWarning, StatementResult, StatementSpec, Value,
};

/// A driver-native database connection.
///
/// All operations take `&self`; drivers serialize internally as needed
/// (the pool guarantees a connection is only used by one task at a time,
/// but maintenance probes may race a slow close).
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Get the driver name (e.g., "sqlite", "postgresql", "mysql")
    fn driver_name(&self) -> &str;

    /// Execute a statement that modifies data (INSERT/UPDATE/DELETE)
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult>;

    /// Execute a query that returns rows (SELECT). The result carries
    /// per-column metadata alongside the rows.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Prepare a statement for repeated execution
    async fn prepare(&self, spec: &StatementSpec) -> Result<Box<dyn RawStatement>>;

    /// Prepare a stored-procedure call.
    ///
    /// Drivers without callable-statement support keep the default.
    async fn prepare_call(&self, spec: &StatementSpec) -> Result<Box<dyn RawStatement>> {
        let _ = spec;
        Err(DbError::NotSupported(
            "callable statements not supported by this driver".into(),
        ))
    }

    /// Commit the current transaction
    async fn commit(&self) -> Result<()>;

    /// Roll back the current transaction
    async fn rollback(&self) -> Result<()>;

    /// Create a savepoint; `None` asks the driver to generate a name
    async fn set_savepoint(&self, name: Option<&str>) -> Result<Savepoint>;

    /// Roll back to a previously created savepoint
    async fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> Result<()>;

    /// Release (delete) a savepoint
    async fn release_savepoint(&self, savepoint: &Savepoint) -> Result<()>;

    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()>;

    async fn auto_commit(&self) -> Result<bool>;

    async fn set_read_only(&self, read_only: bool) -> Result<()>;

    async fn is_read_only(&self) -> Result<bool>;

    async fn set_catalog(&self, catalog: &str) -> Result<()>;

    async fn catalog(&self) -> Result<Option<String>>;

    async fn set_holdability(&self, holdability: Holdability) -> Result<()>;

    async fn holdability(&self) -> Result<Holdability>;

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()>;

    async fn transaction_isolation(&self) -> Result<IsolationLevel>;

    /// Install a driver type-name mapping. The map is opaque to the pool.
    async fn set_type_map(&self, map: HashMap<String, String>) -> Result<()> {
        let _ = map;
        Err(DbError::NotSupported(
            "type maps not supported by this driver".into(),
        ))
    }

    async fn type_map(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    /// Warnings accumulated since the last `clear_warnings`
    async fn warnings(&self) -> Result<Vec<SqlWarning>>;

    async fn clear_warnings(&self) -> Result<()>;

    /// Static metadata about the database and driver
    async fn metadata(&self) -> Result<DatabaseMetadata>;

    async fn client_info(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    async fn set_client_info(&self, key: &str, value: &str) -> Result<()> {
        let _ = (key, value);
        Err(DbError::NotSupported(
            "client info not supported by this driver".into(),
        ))
    }

    /// Driver-level liveness probe, bounded by `timeout`
    async fn is_valid(&self, timeout: Duration) -> Result<bool>;

    /// Close the physical connection
    async fn close(&self) -> Result<()>;

    /// Check if the physical connection is closed
    fn is_closed(&self) -> bool;

    /// Escape hatch for driver-specific capabilities (LOB factories,
    /// array constructors, ...). Returns `None` when the driver does not
    /// expose anything beyond this trait.
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
}

/// A driver-native prepared statement
#[async_trait]
pub trait RawStatement: Send + Sync {
    /// Execute with the given parameters, returning the update count
    async fn execute(&self, params: &[Value]) -> Result<StatementResult>;

    /// Execute with the given parameters, returning rows
    async fn query(&self, params: &[Value]) -> Result<QueryResult>;

    /// Keys generated by the last execution, when requested at prepare
    /// time via `StatementSpec::with_generated_keys`.
    async fn generated_keys(&self) -> Result<QueryResult> {
        Err(DbError::NotSupported(
            "generated keys not supported by this driver".into(),
        ))
    }

    /// Deallocate the statement on the server side
    async fn close(&self) -> Result<()>;
}
