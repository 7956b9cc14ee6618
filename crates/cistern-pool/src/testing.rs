//! Stub driver for tests
//!
//! A scriptable in-memory implementation of the raw driver traits. The
//! stubs count every driver-level call (prepares, closes, executes) and
//! can be told to fail their next operation with a chosen SQLSTATE, which
//! is all the pool's test suite needs to exercise failure classification,
//! cache behavior and transaction replay without a real database.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use cistern_core::{
    DatabaseMetadata, DbError, Holdability, IsolationLevel, QueryResult, RawConnection,
    RawStatement, Result, Savepoint, SqlWarning, StatementResult, StatementSpec, Value,
};

use crate::pool::ConnectionFactory;

/// A failure to inject into the next driver operation
#[derive(Debug, Clone)]
pub struct StubFailure {
    pub message: String,
    pub sql_state: Option<String>,
}

impl StubFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
        }
    }

    pub fn with_state(message: impl Into<String>, sql_state: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: Some(sql_state.into()),
        }
    }

    fn to_error(&self) -> DbError {
        match &self.sql_state {
            Some(state) => DbError::driver_with_state(self.message.clone(), state.as_str()),
            None => DbError::driver(self.message.clone()),
        }
    }
}

/// Shared failure script: one slot consumed by whichever operation on the
/// connection (or any of its statements) runs next.
type FailScript = Arc<Mutex<Option<StubFailure>>>;

fn take_failure(script: &FailScript) -> Result<()> {
    match script.lock().take() {
        Some(failure) => Err(failure.to_error()),
        None => Ok(()),
    }
}

/// Scriptable stub statement
pub struct StubStatement {
    sql: String,
    executes: AtomicUsize,
    queries: AtomicUsize,
    closed: AtomicBool,
    close_count: AtomicUsize,
    fail: FailScript,
    ops: Arc<Mutex<Vec<String>>>,
}

impl StubStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RawStatement for StubStatement {
    async fn execute(&self, _params: &[Value]) -> Result<StatementResult> {
        take_failure(&self.fail)?;
        self.executes.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().push(format!("stmt_execute:{}", self.sql));
        Ok(StatementResult::new(1))
    }

    async fn query(&self, _params: &[Value]) -> Result<QueryResult> {
        take_failure(&self.fail)?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().push(format!("stmt_query:{}", self.sql));
        Ok(QueryResult::empty())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().push(format!("stmt_close:{}", self.sql));
        Ok(())
    }
}

/// Scriptable stub connection
pub struct StubConnection {
    id: usize,
    closed: AtomicBool,
    close_count: AtomicUsize,
    valid: AtomicBool,
    auto_commit: AtomicBool,
    read_only: AtomicBool,
    catalog: Mutex<Option<String>>,
    holdability: Mutex<Holdability>,
    isolation: Mutex<IsolationLevel>,
    type_map: Mutex<HashMap<String, String>>,
    client_info: Mutex<HashMap<String, String>>,
    warnings: Mutex<Vec<SqlWarning>>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail: FailScript,
    /// Every operation applied to this connection, in order
    ops: Arc<Mutex<Vec<String>>>,
    /// Driver-level prepares, in order
    prepares: Mutex<Vec<String>>,
    statements: Mutex<Vec<Arc<StubStatement>>>,
}

impl StubConnection {
    pub fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            valid: AtomicBool::new(true),
            auto_commit: AtomicBool::new(true),
            read_only: AtomicBool::new(false),
            catalog: Mutex::new(None),
            holdability: Mutex::new(Holdability::CloseAtCommit),
            isolation: Mutex::new(IsolationLevel::ReadCommitted),
            type_map: Mutex::new(HashMap::new()),
            client_info: Mutex::new(HashMap::new()),
            warnings: Mutex::new(Vec::new()),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            fail: Arc::new(Mutex::new(None)),
            ops: Arc::new(Mutex::new(Vec::new())),
            prepares: Mutex::new(Vec::new()),
            statements: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Fail the next operation on this connection or any of its statements
    pub fn fail_next(&self, failure: StubFailure) {
        *self.fail.lock() = Some(failure);
    }

    /// Control what the driver validity probe reports
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// SQL of every driver-level prepare, in order
    pub fn prepared_sql(&self) -> Vec<String> {
        self.prepares.lock().clone()
    }

    pub fn prepare_count(&self) -> usize {
        self.prepares.lock().len()
    }

    /// Every operation applied to this connection, in order
    pub fn operations(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn statements(&self) -> Vec<Arc<StubStatement>> {
        self.statements.lock().clone()
    }

    fn make_statement(&self, spec: &StatementSpec) -> Arc<StubStatement> {
        let statement = Arc::new(StubStatement {
            sql: spec.sql().to_string(),
            executes: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            fail: Arc::clone(&self.fail),
            ops: Arc::clone(&self.ops),
        });
        self.prepares.lock().push(spec.sql().to_string());
        self.statements.lock().push(Arc::clone(&statement));
        statement
    }
}

#[async_trait]
impl RawConnection for StubConnection {
    fn driver_name(&self) -> &str {
        "stub"
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<StatementResult> {
        take_failure(&self.fail)?;
        self.ops.lock().push(format!("execute:{sql}"));
        Ok(StatementResult::new(1))
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> Result<QueryResult> {
        take_failure(&self.fail)?;
        self.ops.lock().push(format!("query:{sql}"));
        Ok(QueryResult::empty())
    }

    async fn prepare(&self, spec: &StatementSpec) -> Result<Box<dyn RawStatement>> {
        take_failure(&self.fail)?;
        self.ops.lock().push(format!("prepare:{}", spec.sql()));
        let statement = self.make_statement(spec);
        Ok(Box::new(StubStatementHandle(statement)))
    }

    async fn prepare_call(&self, spec: &StatementSpec) -> Result<Box<dyn RawStatement>> {
        take_failure(&self.fail)?;
        self.ops.lock().push(format!("prepare_call:{}", spec.sql()));
        let statement = self.make_statement(spec);
        Ok(Box::new(StubStatementHandle(statement)))
    }

    async fn commit(&self) -> Result<()> {
        take_failure(&self.fail)?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().push("commit".to_string());
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        take_failure(&self.fail)?;
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().push("rollback".to_string());
        Ok(())
    }

    async fn set_savepoint(&self, name: Option<&str>) -> Result<Savepoint> {
        take_failure(&self.fail)?;
        let name = name.unwrap_or("sp_generated").to_string();
        self.ops.lock().push(format!("savepoint:{name}"));
        Ok(Savepoint::new(name))
    }

    async fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        take_failure(&self.fail)?;
        self.ops
            .lock()
            .push(format!("rollback_to_savepoint:{}", savepoint.name()));
        Ok(())
    }

    async fn release_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        take_failure(&self.fail)?;
        self.ops
            .lock()
            .push(format!("release_savepoint:{}", savepoint.name()));
        Ok(())
    }

    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        take_failure(&self.fail)?;
        self.auto_commit.store(auto_commit, Ordering::SeqCst);
        self.ops.lock().push(format!("set_auto_commit:{auto_commit}"));
        Ok(())
    }

    async fn auto_commit(&self) -> Result<bool> {
        Ok(self.auto_commit.load(Ordering::SeqCst))
    }

    async fn set_read_only(&self, read_only: bool) -> Result<()> {
        take_failure(&self.fail)?;
        self.read_only.store(read_only, Ordering::SeqCst);
        self.ops.lock().push(format!("set_read_only:{read_only}"));
        Ok(())
    }

    async fn is_read_only(&self) -> Result<bool> {
        Ok(self.read_only.load(Ordering::SeqCst))
    }

    async fn set_catalog(&self, catalog: &str) -> Result<()> {
        take_failure(&self.fail)?;
        *self.catalog.lock() = Some(catalog.to_string());
        self.ops.lock().push(format!("set_catalog:{catalog}"));
        Ok(())
    }

    async fn catalog(&self) -> Result<Option<String>> {
        Ok(self.catalog.lock().clone())
    }

    async fn set_holdability(&self, holdability: Holdability) -> Result<()> {
        take_failure(&self.fail)?;
        *self.holdability.lock() = holdability;
        self.ops.lock().push("set_holdability".to_string());
        Ok(())
    }

    async fn holdability(&self) -> Result<Holdability> {
        Ok(*self.holdability.lock())
    }

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        take_failure(&self.fail)?;
        *self.isolation.lock() = level;
        self.ops.lock().push("set_transaction_isolation".to_string());
        Ok(())
    }

    async fn transaction_isolation(&self) -> Result<IsolationLevel> {
        Ok(*self.isolation.lock())
    }

    async fn set_type_map(&self, map: HashMap<String, String>) -> Result<()> {
        take_failure(&self.fail)?;
        *self.type_map.lock() = map;
        self.ops.lock().push("set_type_map".to_string());
        Ok(())
    }

    async fn type_map(&self) -> Result<HashMap<String, String>> {
        Ok(self.type_map.lock().clone())
    }

    async fn warnings(&self) -> Result<Vec<SqlWarning>> {
        Ok(self.warnings.lock().clone())
    }

    async fn clear_warnings(&self) -> Result<()> {
        take_failure(&self.fail)?;
        self.warnings.lock().clear();
        Ok(())
    }

    async fn metadata(&self) -> Result<DatabaseMetadata> {
        Ok(DatabaseMetadata {
            product_name: "stubdb".to_string(),
            product_version: "0.0".to_string(),
            driver_name: "stub".to_string(),
            driver_version: "0.0".to_string(),
            url: format!("stub://connection/{}", self.id),
            username: "stub".to_string(),
        })
    }

    async fn client_info(&self) -> Result<HashMap<String, String>> {
        Ok(self.client_info.lock().clone())
    }

    async fn set_client_info(&self, key: &str, value: &str) -> Result<()> {
        self.client_info
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn is_valid(&self, _timeout: Duration) -> Result<bool> {
        take_failure(&self.fail)?;
        Ok(self.valid.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().push("close".to_string());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Newtype so a shared `Arc<StubStatement>` can be handed out as the
/// `Box<dyn RawStatement>` the trait requires while the test keeps its
/// own reference for assertions.
struct StubStatementHandle(Arc<StubStatement>);

#[async_trait]
impl RawStatement for StubStatementHandle {
    async fn execute(&self, params: &[Value]) -> Result<StatementResult> {
        self.0.execute(params).await
    }

    async fn query(&self, params: &[Value]) -> Result<QueryResult> {
        self.0.query(params).await
    }

    async fn generated_keys(&self) -> Result<QueryResult> {
        self.0.generated_keys().await
    }

    async fn close(&self) -> Result<()> {
        self.0.close().await
    }
}

/// Factory producing stub connections; keeps every connection it made for
/// later inspection and can fail its first N creation attempts.
#[derive(Default)]
pub struct StubFactory {
    attempts: AtomicUsize,
    fail_first: AtomicUsize,
    connections: Mutex<Vec<Arc<StubConnection>>>,
}

impl StubFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` creation attempts with a generic driver error
    pub fn fail_first(&self, count: usize) {
        self.fail_first.store(count, Ordering::SeqCst);
    }

    /// Total `create` calls, failures included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Connections actually created, in creation order
    pub fn connections(&self) -> Vec<Arc<StubConnection>> {
        self.connections.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connection(&self, index: usize) -> Option<Arc<StubConnection>> {
        self.connections.lock().get(index).cloned()
    }

    pub fn last_connection(&self) -> Option<Arc<StubConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl ConnectionFactory for StubFactory {
    async fn create(&self) -> Result<Arc<dyn RawConnection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(DbError::driver("stub: connection refused"));
        }
        let connection = StubConnection::new(self.created());
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}
