//! The partitioned connection pool
//!
//! Requests are sharded across partitions by thread affinity to keep the
//! checkout path off a single lock. Each partition owns a bounded free
//! queue and grows asynchronously when demand outruns supply; background
//! workers return released handles, probe idle ones, and retire the
//! expired and the broken.
//!
//! # Example
//!
//! ```ignore
//! use cistern_pool::{Pool, PoolConfig};
//!
//! let config = PoolConfig::new(5, 20)
//!     .with_partition_count(2)
//!     .with_connection_timeout_ms(5_000);
//!
//! let pool = Pool::new(config, factory).await?;
//! let conn = pool.get_connection().await?;
//! let rows = conn.query("SELECT 1", &[]).await?;
//! conn.close().await?;
//! ```

mod partition;
mod pool;
mod workers;


pub use pool::{ConnectionFactory, Pool};

pub(crate) use pool::PoolInner;
