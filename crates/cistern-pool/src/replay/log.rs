//! The per-handle replay log

use std::collections::HashMap;
use std::sync::Weak;

use cistern_core::{Holdability, IsolationLevel, StatementSpec, Value};

use crate::handle::{StatementInner, StatementKind};

/// One recorded operation.
///
/// Statement-level operations refer to their statement through the slot id
/// assigned at preparation time; the replayer rebuilds the slot → statement
/// mapping on the fresh connection.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedOp {
    SetAutoCommit(bool),
    SetReadOnly(bool),
    SetCatalog(String),
    SetHoldability(Holdability),
    SetTransactionIsolation(IsolationLevel),
    SetTypeMap(HashMap<String, String>),
    SetSavepoint { name: Option<String> },
    RollbackToSavepoint(String),
    ReleaseSavepoint(String),
    Execute { sql: String, params: Vec<Value> },
    Query { sql: String, params: Vec<Value> },
    Prepare {
        spec: StatementSpec,
        kind: StatementKind,
        slot: u64,
    },
    StatementExecute { slot: u64, params: Vec<Value> },
    StatementQuery { slot: u64, params: Vec<Value> },
}

/// Ordered record of the operations applied in the current transaction,
/// plus weak references to the statement handles each `Prepare` produced
/// (so recovery can swap fresh driver statements into them).
#[derive(Default)]
pub(crate) struct ReplayLog {
    ops: Vec<RecordedOp>,
    statements: HashMap<u64, Weak<StatementInner>>,
}

impl ReplayLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, op: RecordedOp) {
        self.ops.push(op);
    }

    pub(crate) fn register_statement(&mut self, slot: u64, statement: Weak<StatementInner>) {
        self.statements.insert(slot, statement);
    }

    /// Clear the log; called on commit and rollback.
    pub(crate) fn clear(&mut self) {
        self.ops.clear();
        self.statements.clear();
    }

    /// Copy out the ops and statement references for a replay pass, so no
    /// lock is held while the replay awaits driver calls.
    pub(crate) fn snapshot(&self) -> (Vec<RecordedOp>, Vec<(u64, Weak<StatementInner>)>) {
        (
            self.ops.clone(),
            self.statements
                .iter()
                .map(|(slot, weak)| (*slot, weak.clone()))
                .collect(),
        )
    }
}
