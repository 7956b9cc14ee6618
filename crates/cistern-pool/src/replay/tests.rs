//! Tests for transaction replay

use cistern_core::{DbError, StatementSpec, Value};

use crate::handle::StatementKind;
use crate::testing::{StubConnection, StubFailure};

use super::log::RecordedOp;
use super::replayer::replay_operations;

fn transaction_ops() -> Vec<RecordedOp> {
    vec![
        RecordedOp::SetAutoCommit(false),
        RecordedOp::Prepare {
            spec: StatementSpec::new("UPDATE t SET v = ? WHERE id = ?"),
            kind: StatementKind::Prepared,
            slot: 0,
        },
        RecordedOp::StatementExecute {
            slot: 0,
            params: vec![Value::Int(1), Value::Int(2)],
        },
    ]
}

#[tokio::test]
async fn replay_applies_operations_in_order() {
    let fresh = StubConnection::new(0);
    let mut result = replay_operations(&transaction_ops(), fresh.as_ref())
        .await
        .expect("replay succeeds");

    assert_eq!(
        fresh.operations(),
        vec![
            "set_auto_commit:false".to_string(),
            "prepare:UPDATE t SET v = ? WHERE id = ?".to_string(),
            "stmt_execute:UPDATE t SET v = ? WHERE id = ?".to_string(),
        ]
    );
    assert_eq!(result.statement_count(), 1);
    assert!(result.take_statement(0).is_some());
    assert!(result.take_statement(0).is_none());
}

#[tokio::test]
async fn connection_class_failure_aborts_the_replay() {
    let fresh = StubConnection::new(0);
    fresh.fail_next(StubFailure::with_state("still down", "08001"));

    let result = replay_operations(&transaction_ops(), fresh.as_ref()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn failure_without_sql_state_aborts_the_replay() {
    let fresh = StubConnection::new(0);
    fresh.fail_next(StubFailure::new("unknown driver failure"));

    let result = replay_operations(&transaction_ops(), fresh.as_ref()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn data_errors_during_replay_are_skipped() {
    let fresh = StubConnection::new(0);
    // The first replayed op hits a data-level error; the rest still run.
    fresh.fail_next(StubFailure::with_state("duplicate key", "23505"));

    let mut result = replay_operations(&transaction_ops(), fresh.as_ref())
        .await
        .expect("data errors do not doom the replay");
    assert!(result.take_statement(0).is_some());
    assert_eq!(
        fresh.operations(),
        vec![
            "prepare:UPDATE t SET v = ? WHERE id = ?".to_string(),
            "stmt_execute:UPDATE t SET v = ? WHERE id = ?".to_string(),
        ]
    );
}

#[tokio::test]
async fn unknown_statement_slot_aborts_the_replay() {
    let fresh = StubConnection::new(0);
    let ops = vec![RecordedOp::StatementExecute {
        slot: 42,
        params: Vec::new(),
    }];

    let result = replay_operations(&ops, fresh.as_ref()).await;
    let err = result.err().expect("unknown slot is fatal");
    assert!(matches!(err, DbError::Driver { .. }));
}

#[tokio::test]
async fn savepoints_replay_by_name() {
    let fresh = StubConnection::new(0);
    let ops = vec![
        RecordedOp::SetSavepoint {
            name: Some("before_batch".to_string()),
        },
        RecordedOp::RollbackToSavepoint("before_batch".to_string()),
        RecordedOp::ReleaseSavepoint("before_batch".to_string()),
    ];

    replay_operations(&ops, fresh.as_ref())
        .await
        .expect("savepoint ops replay");
    assert_eq!(
        fresh.operations(),
        vec![
            "savepoint:before_batch".to_string(),
            "rollback_to_savepoint:before_batch".to_string(),
            "release_savepoint:before_batch".to_string(),
        ]
    );
}
