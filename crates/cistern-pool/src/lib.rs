//! Cistern Pool - Partitioned database connection pooling
//!
//! This crate hands out reusable physical connections wrapped in logical
//! handles. The handle mediates everything: it refuses use after close,
//! caches prepared statements, classifies driver failures by SQLSTATE, and
//! can replay an in-flight transaction onto a fresh connection when the
//! old one dies. Background workers return released handles to their
//! partitions, probe idle ones, and grow partitions under demand.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cistern_pool::{Pool, PoolConfig};
//!
//! let config = PoolConfig::new(2, 10)
//!     .with_partition_count(2)
//!     .with_statements_cache_size(32)
//!     .with_statistics(true);
//!
//! let pool = Pool::new(config, MyDriverFactory::new(spec)).await?;
//!
//! let conn = pool.get_connection().await?;
//! let stmt = conn.prepare_statement("SELECT name FROM users WHERE id = ?").await?;
//! let rows = stmt.query(&[Value::Int(7)]).await?;
//! stmt.close().await?;
//! conn.close().await?;
//! ```

pub mod cache;
pub mod config;
pub mod handle;
pub mod hooks;
pub mod pool;
pub mod replay;
pub mod sqlstate;
pub mod stats;
pub mod testing;

pub use cache::StatementKey;
pub use config::PoolConfig;
pub use handle::{ConnectionHandle, StatementHandle, StatementKind};
pub use hooks::{AcquireFailConfig, ConnectionHook, ConnectionState};
pub use pool::{ConnectionFactory, Pool};
pub use replay::RecordedOp;
pub use sqlstate::{DATABASE_DOWN_STATES, FailureClass, classify};
pub use stats::{PartitionUsage, Statistics, StatisticsSnapshot};

pub use cistern_core::{DbError, Result, SqlState, StatementSpec, Value};
