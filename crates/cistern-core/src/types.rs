//! Core types for cistern

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A database value that can represent any SQL type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point
    Float(f64),
    /// Decimal/Numeric (stored as string for precision)
    Decimal(String),
    /// UTF-8 string
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// UUID
    Uuid(Uuid),
    /// Date (year, month, day)
    Date(NaiveDate),
    /// Time (hour, minute, second, nanosecond)
    Time(NaiveTime),
    /// DateTime without timezone
    DateTime(NaiveDateTime),
    /// DateTime with timezone (UTC)
    DateTimeUtc(DateTime<Utc>),
    /// JSON value
    Json(serde_json::Value),
    /// Array of values
    Array(Vec<Value>),
}

impl Value {
    /// Check if the value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get as a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Text(s) => s.parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Try to get as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Text(s) => s.parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Try to get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Uuid(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "{}", v),
            Value::DateTime(v) => write!(f, "{}", v),
            Value::DateTimeUtc(v) => write!(f, "{}", v),
            Value::Json(v) => write!(f, "{}", v),
            Value::Array(v) => write!(f, "[{} values]", v.len()),
        }
    }
}

/// Metadata for one column of a result set
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    #[serde(default)]
    pub name: String,
    /// Data type (database-specific string)
    #[serde(default)]
    pub data_type: String,
    /// Whether the column can be NULL
    #[serde(default)]
    pub nullable: bool,
    /// Column ordinal position (0-based)
    #[serde(default)]
    pub ordinal: usize,
    /// Maximum character length (for string types)
    #[serde(default)]
    pub max_length: Option<i64>,
    /// Numeric precision
    #[serde(default)]
    pub precision: Option<i32>,
    /// Numeric scale
    #[serde(default)]
    pub scale: Option<i32>,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = data_type.into();
        self
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn with_ordinal(mut self, ordinal: usize) -> Self {
        self.ordinal = ordinal;
        self
    }

    pub fn with_precision(mut self, precision: i32, scale: i32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
}

/// A single row of query results.
///
/// Column metadata is shared across all rows of a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Column metadata, shared with the owning result set
    pub columns: Arc<Vec<Column>>,
    /// Values in column order
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<Vec<Column>>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Look up a value by column name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .and_then(|i| self.values.get(i))
    }

    /// Look up a value by position
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Metadata of the column at `index`
    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }
}

/// Result of a query that returns rows (SELECT)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column metadata in result order
    pub columns: Arc<Vec<Column>>,
    /// Result rows
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn new(columns: Vec<Column>, row_values: Vec<Vec<Value>>) -> Self {
        let columns = Arc::new(columns);
        let rows = row_values
            .into_iter()
            .map(|values| Row::new(Arc::clone(&columns), values))
            .collect();
        Self { columns, rows }
    }

    /// Build a result set from bare column names, for drivers that do not
    /// report full column metadata. Ordinals follow name order.
    pub fn from_names(names: Vec<String>, row_values: Vec<Vec<Value>>) -> Self {
        let columns = names
            .into_iter()
            .enumerate()
            .map(|(ordinal, name)| Column::new(name).with_ordinal(ordinal))
            .collect();
        Self::new(columns, row_values)
    }

    /// An empty result set with no columns
    pub fn empty() -> Self {
        Self {
            columns: Arc::new(Vec::new()),
            rows: Vec::new(),
        }
    }

    /// Metadata of the column at `index`
    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Result of a statement that modifies data (INSERT/UPDATE/DELETE)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    /// Number of rows affected
    pub affected_rows: u64,
    /// Last inserted row id, when the driver reports one
    pub last_insert_id: Option<i64>,
}

impl StatementResult {
    pub fn new(affected_rows: u64) -> Self {
        Self {
            affected_rows,
            last_insert_id: None,
        }
    }
}

/// A warning reported by the database without failing the operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlWarning {
    /// SQLSTATE of the warning, if any
    pub sql_state: Option<String>,
    /// Driver-specific warning code
    pub code: Option<i32>,
    /// Human-readable message
    pub message: String,
}

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Cursor holdability across commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Holdability {
    /// Open cursors survive a commit
    HoldOverCommit,
    /// Open cursors are closed when the transaction commits
    CloseAtCommit,
}

/// Static information about the database behind a connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub product_name: String,
    pub product_version: String,
    pub driver_name: String,
    pub driver_version: String,
    pub url: String,
    pub username: String,
}

/// Everything a driver needs to establish a physical connection:
/// connection URL, credentials and a free-form driver properties map.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectSpec {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Driver-specific options passed through untouched
    pub properties: HashMap<String, String>,
}

impl ConnectSpec {
    pub fn new(url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            password: password.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for ConnectSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectSpec")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("properties", &self.properties)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_lookup_by_name_and_index() {
        let result = QueryResult::from_names(
            vec!["id".into(), "name".into()],
            vec![vec![Value::Int(1), Value::Text("alice".into())]],
        );
        let row = &result.rows[0];
        assert_eq!(row.get("name").and_then(Value::as_str), Some("alice"));
        assert_eq!(row.get_index(0).and_then(Value::as_i64), Some(1));
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn column_metadata_travels_with_the_result() {
        let columns = vec![
            Column::new("id").with_data_type("bigint").with_ordinal(0),
            Column::new("balance")
                .with_data_type("numeric")
                .with_nullable(true)
                .with_ordinal(1)
                .with_precision(12, 2),
        ];
        let result = QueryResult::new(
            columns,
            vec![vec![Value::Int(7), Value::Decimal("10.50".into())]],
        );

        let balance = result.column(1).expect("column");
        assert_eq!(balance.name, "balance");
        assert_eq!(balance.data_type, "numeric");
        assert!(balance.nullable);
        assert_eq!(balance.precision, Some(12));
        assert_eq!(balance.scale, Some(2));

        let row = &result.rows[0];
        assert_eq!(row.column(0).map(|c| c.name.as_str()), Some("id"));
        assert_eq!(row.get("balance"), Some(&Value::Decimal("10.50".into())));
    }

    #[test]
    fn from_names_assigns_ordinals() {
        let result = QueryResult::from_names(vec!["a".into(), "b".into()], Vec::new());
        assert_eq!(result.column(0).map(|c| c.ordinal), Some(0));
        assert_eq!(result.column(1).map(|c| c.ordinal), Some(1));
    }

    #[test]
    fn empty_query_result() {
        let result = QueryResult::empty();
        assert!(result.is_empty());
        assert_eq!(result.len(), 0);
    }

    #[test]
    fn connect_spec_debug_redacts_password() {
        let spec = ConnectSpec::new("db://localhost/app", "app", "hunter2")
            .with_property("ssl", "require");
        let debug = format!("{:?}", spec);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("hunter2"));
    }
}
