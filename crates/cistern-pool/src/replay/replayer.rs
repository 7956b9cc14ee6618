//! Walks a replay log against a fresh connection

use std::collections::HashMap;
use std::sync::Arc;

use cistern_core::{DbError, RawConnection, RawStatement, Result, Savepoint, SqlState};

use crate::handle::StatementKind;
use crate::hooks::ConnectionState;
use crate::sqlstate::{FailureClass, classify};

use super::log::RecordedOp;

/// Mapping from replay slot ids to the statements prepared on the fresh
/// connection. After a successful replay the pool swaps these into the
/// client's live statement handles.
#[derive(Default)]
pub(crate) struct RecoveryResult {
    statements: HashMap<u64, Arc<dyn RawStatement>>,
}

impl RecoveryResult {
    pub(crate) fn take_statement(&mut self, slot: u64) -> Option<Arc<dyn RawStatement>> {
        self.statements.remove(&slot)
    }

    pub(crate) fn statement_count(&self) -> usize {
        self.statements.len()
    }
}

/// True when a replayed operation failed in a way that dooms the whole
/// recovery (the fresh connection is broken too).
fn fatal_during_replay(err: &DbError) -> bool {
    let Some(state) = err.sql_state() else {
        // No SQLSTATE to judge by; assume the worst for a driver error,
        // and treat pool errors as fatal outright.
        return true;
    };
    classify(state, ConnectionState::Nop) != FailureClass::DataError
}

/// Apply every recorded operation to `fresh`, building the slot map as
/// `Prepare` ops are replayed.
///
/// A connection-class failure aborts the replay; a data-level failure on
/// an individual op is logged and skipped (the op succeeded the first time
/// around, so a data error here says nothing about the fresh connection).
pub(crate) async fn replay_operations(
    ops: &[RecordedOp],
    fresh: &dyn RawConnection,
) -> Result<RecoveryResult> {
    let mut result = RecoveryResult::default();

    for op in ops {
        let outcome: Result<()> = match op {
            RecordedOp::SetAutoCommit(value) => fresh.set_auto_commit(*value).await,
            RecordedOp::SetReadOnly(value) => fresh.set_read_only(*value).await,
            RecordedOp::SetCatalog(catalog) => fresh.set_catalog(catalog).await,
            RecordedOp::SetHoldability(holdability) => fresh.set_holdability(*holdability).await,
            RecordedOp::SetTransactionIsolation(level) => {
                fresh.set_transaction_isolation(*level).await
            }
            RecordedOp::SetTypeMap(map) => fresh.set_type_map(map.clone()).await,
            RecordedOp::SetSavepoint { name } => {
                fresh.set_savepoint(name.as_deref()).await.map(|_| ())
            }
            RecordedOp::RollbackToSavepoint(name) => {
                fresh
                    .rollback_to_savepoint(&Savepoint::new(name.clone()))
                    .await
            }
            RecordedOp::ReleaseSavepoint(name) => {
                fresh.release_savepoint(&Savepoint::new(name.clone())).await
            }
            RecordedOp::Execute { sql, params } => fresh.execute(sql, params).await.map(|_| ()),
            RecordedOp::Query { sql, params } => fresh.query(sql, params).await.map(|_| ()),
            RecordedOp::Prepare { spec, kind, slot } => {
                let prepared = match kind {
                    StatementKind::Prepared => fresh.prepare(spec).await,
                    StatementKind::Callable => fresh.prepare_call(spec).await,
                };
                prepared.map(|statement| {
                    result.statements.insert(*slot, Arc::from(statement));
                })
            }
            RecordedOp::StatementExecute { slot, params } => match result.statements.get(slot) {
                Some(statement) => statement.execute(params).await.map(|_| ()),
                None => Err(DbError::driver_with_state(
                    "replay references a statement prepared outside the transaction",
                    SqlState::UNKNOWN,
                )),
            },
            RecordedOp::StatementQuery { slot, params } => match result.statements.get(slot) {
                Some(statement) => statement.query(params).await.map(|_| ()),
                None => Err(DbError::driver_with_state(
                    "replay references a statement prepared outside the transaction",
                    SqlState::UNKNOWN,
                )),
            },
        };

        if let Err(e) = outcome {
            if fatal_during_replay(&e) {
                return Err(e);
            }
            tracing::warn!(error = %e, "skipping data-level failure during transaction replay");
        }
    }

    Ok(result)
}
