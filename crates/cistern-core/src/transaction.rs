//! Savepoint support for database transactions
//!
//! Savepoints are named points within a transaction that can be rolled
//! back to without aborting the entire transaction.

use serde::{Deserialize, Serialize};

/// A savepoint within a transaction.
///
/// Savepoints allow nested rollback points: rolling back to one undoes
/// everything after it while keeping earlier work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Savepoint {
    /// The name of the savepoint
    name: String,
}

impl Savepoint {
    /// Create a new savepoint with the given name.
    ///
    /// Savepoint names should follow database-specific naming rules.
    /// Most databases allow alphanumeric names with underscores.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Get the name of the savepoint.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn savepoint_new() {
        let sp = Savepoint::new("before_batch");
        assert_eq!(sp.name(), "before_batch");
    }

    #[test]
    fn savepoint_equality() {
        let sp1 = Savepoint::new("same");
        let sp2 = Savepoint::new("same");
        let sp3 = Savepoint::new("different");

        assert_eq!(sp1, sp2);
        assert_ne!(sp1, sp3);
    }

    #[test]
    fn savepoint_clone() {
        let sp1 = Savepoint::new("original");
        let sp2 = sp1.clone();

        assert_eq!(sp1.name(), sp2.name());
    }
}
