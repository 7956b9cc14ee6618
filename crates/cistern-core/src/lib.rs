//! Cistern Core - Core abstractions for the cistern connection pool
//!
//! This crate provides the fundamental traits and types that the pool
//! builds on. It defines:
//!
//! - `RawConnection` - Trait for driver-native database connections
//! - `RawStatement` - Trait for driver-native prepared statements
//! - `StatementSpec` - How a statement is to be prepared
//! - Common types like `Value`, `Row`, `QueryResult`, etc.
//!
//! The pool never looks inside a raw connection; drivers implement these
//! traits and everything else is handled by `cistern-pool`.

mod connection;
mod error;
mod statement;
mod transaction;
mod types;

pub use connection::*;
pub use error::*;
pub use statement::*;
pub use transaction::*;
pub use types::*;
