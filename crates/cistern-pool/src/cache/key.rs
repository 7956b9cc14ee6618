//! Statement cache keys

use std::fmt::Write as _;

use cistern_core::{Concurrency, GeneratedKeys, Holdability, ResultSetType, StatementSpec};

/// Canonical cache key for a prepared statement.
///
/// Derived from every field of the [`StatementSpec`]: the SQL text plus the
/// result-set type, concurrency, holdability and generated-keys selector.
/// Two preparations share a cache slot only when the whole tuple matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey(String);

// Field separator that does not occur in SQL text.
const SEP: char = '\u{1f}';

impl StatementKey {
    pub fn from_spec(spec: &StatementSpec) -> Self {
        let mut key = String::with_capacity(spec.sql().len() + 16);
        key.push_str(spec.sql());
        key.push(SEP);
        key.push(match spec.result_set_type() {
            ResultSetType::ForwardOnly => 'F',
            ResultSetType::ScrollInsensitive => 'I',
            ResultSetType::ScrollSensitive => 'S',
        });
        key.push(match spec.concurrency() {
            Concurrency::ReadOnly => 'R',
            Concurrency::Updatable => 'U',
        });
        key.push(match spec.holdability() {
            None => '-',
            Some(Holdability::HoldOverCommit) => 'H',
            Some(Holdability::CloseAtCommit) => 'C',
        });
        match spec.generated_keys() {
            GeneratedKeys::None => {}
            GeneratedKeys::Auto => {
                key.push(SEP);
                key.push_str("auto");
            }
            GeneratedKeys::ByIndex(indexes) => {
                key.push(SEP);
                key.push_str("ix:");
                for (i, index) in indexes.iter().enumerate() {
                    if i > 0 {
                        key.push(',');
                    }
                    let _ = write!(key, "{index}");
                }
            }
            GeneratedKeys::ByName(names) => {
                key.push(SEP);
                key.push_str("col:");
                for (i, name) in names.iter().enumerate() {
                    if i > 0 {
                        key.push(',');
                    }
                    key.push_str(name);
                }
            }
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StatementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
