//! Statement preparation descriptors
//!
//! A `StatementSpec` captures everything that distinguishes one prepared
//! statement from another: the SQL text plus the result-set and
//! generated-keys options. The pool derives its statement-cache key from
//! the full spec, so two preparations only share a cached statement when
//! every field matches.

use serde::{Deserialize, Serialize};

use crate::Holdability;

/// Result-set scrolling behavior requested at preparation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultSetType {
    /// Cursor can only move forward
    ForwardOnly,
    /// Scrollable, insensitive to concurrent changes
    ScrollInsensitive,
    /// Scrollable, sensitive to concurrent changes
    ScrollSensitive,
}

/// Result-set update capability requested at preparation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Concurrency {
    ReadOnly,
    Updatable,
}

/// Which generated keys the statement should expose after execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeneratedKeys {
    /// Generated keys are not requested
    None,
    /// All driver-chosen generated keys
    Auto,
    /// Keys from the given column positions (1-based)
    ByIndex(Vec<u32>),
    /// Keys from the named columns
    ByName(Vec<String>),
}

/// How a statement is to be prepared.
///
/// Build with `StatementSpec::new(sql)` and the `with_*` methods; fields
/// left untouched use the driver defaults (forward-only, read-only, no
/// generated keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatementSpec {
    sql: String,
    result_set_type: ResultSetType,
    concurrency: Concurrency,
    holdability: Option<Holdability>,
    generated_keys: GeneratedKeys,
}

impl StatementSpec {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            result_set_type: ResultSetType::ForwardOnly,
            concurrency: Concurrency::ReadOnly,
            holdability: None,
            generated_keys: GeneratedKeys::None,
        }
    }

    pub fn with_result_set_type(mut self, result_set_type: ResultSetType) -> Self {
        self.result_set_type = result_set_type;
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_holdability(mut self, holdability: Holdability) -> Self {
        self.holdability = Some(holdability);
        self
    }

    pub fn with_generated_keys(mut self, generated_keys: GeneratedKeys) -> Self {
        self.generated_keys = generated_keys;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn result_set_type(&self) -> ResultSetType {
        self.result_set_type
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn holdability(&self) -> Option<Holdability> {
        self.holdability
    }

    pub fn generated_keys(&self) -> &GeneratedKeys {
        &self.generated_keys
    }
}

impl From<&str> for StatementSpec {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for StatementSpec {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}
