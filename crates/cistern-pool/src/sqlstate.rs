//! SQLSTATE failure classification
//!
//! Every driver error caught by a connection handle is classified once,
//! combining the SQLSTATE code with the verdict of an installed
//! [`ConnectionHook`](crate::hooks::ConnectionHook). The class decides what
//! happens to the connection (nothing, retire on release, or kill the whole
//! pool); the error itself is always rethrown to the caller.

use cistern_core::SqlState;

use crate::hooks::ConnectionState;

/// SQLSTATE codes meaning the database itself is gone, not just this
/// connection. `08S01` is how MySQL reports a lost link; `57P01` is a
/// PostgreSQL admin shutdown.
pub const DATABASE_DOWN_STATES: [&str; 4] = ["08001", "08007", "08S01", "57P01"];

/// Outcome of classifying a driver error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The database is unreachable; every pooled connection is suspect
    DatabaseDown,
    /// This connection is broken; retire it on release
    ConnectionBroken,
    /// A data-level error; the connection stays poolable
    DataError,
}

/// Classify a SQLSTATE, folding in the hook's verdict.
///
/// Connection-class codes (`08xxx`), the MySQL deadlock code `40001`, the
/// Firebird broken-connection code `HY000` and implementation-reserved
/// classes (`5xxxx`..`9xxxx`) all mean the connection can no longer be
/// trusted.
pub fn classify(state: &SqlState, hook_state: ConnectionState) -> FailureClass {
    if hook_state == ConnectionState::TerminateAllConnections
        || DATABASE_DOWN_STATES.contains(&state.as_str())
    {
        return FailureClass::DatabaseDown;
    }

    let code = state.as_str();
    let reserved_class = matches!(state.first_char(), Some(c) if ('5'..='9').contains(&c));
    if hook_state == ConnectionState::ConnectionPossiblyBroken
        || code == "40001"
        || code == "HY000"
        || code.starts_with("08")
        || reserved_class
    {
        return FailureClass::ConnectionBroken;
    }

    FailureClass::DataError
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class_of(code: &str) -> FailureClass {
        classify(&SqlState::new(code), ConnectionState::Nop)
    }

    #[test]
    fn database_down_codes() {
        for code in DATABASE_DOWN_STATES {
            assert_eq!(class_of(code), FailureClass::DatabaseDown, "{code}");
        }
    }

    #[test]
    fn connection_broken_codes() {
        assert_eq!(class_of("08003"), FailureClass::ConnectionBroken);
        assert_eq!(class_of("08999"), FailureClass::ConnectionBroken);
        assert_eq!(class_of("40001"), FailureClass::ConnectionBroken);
        assert_eq!(class_of("HY000"), FailureClass::ConnectionBroken);
        assert_eq!(class_of("53300"), FailureClass::ConnectionBroken);
        assert_eq!(class_of("9A000"), FailureClass::ConnectionBroken);
    }

    #[test]
    fn data_errors_pass_through() {
        assert_eq!(class_of("23505"), FailureClass::DataError);
        assert_eq!(class_of("42601"), FailureClass::DataError);
        assert_eq!(class_of("22012"), FailureClass::DataError);
    }

    #[test]
    fn hook_can_escalate() {
        assert_eq!(
            classify(
                &SqlState::new("23505"),
                ConnectionState::ConnectionPossiblyBroken
            ),
            FailureClass::ConnectionBroken
        );
        assert_eq!(
            classify(
                &SqlState::new("23505"),
                ConnectionState::TerminateAllConnections
            ),
            FailureClass::DatabaseDown
        );
    }

    #[test]
    fn substituted_unknown_state_is_broken() {
        // A missing SQLSTATE is treated as 08999 before classification.
        assert_eq!(
            class_of(cistern_core::SqlState::UNKNOWN),
            FailureClass::ConnectionBroken
        );
    }
}
