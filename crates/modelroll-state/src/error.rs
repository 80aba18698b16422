//! Failures of the audit store.

use std::fmt;

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Which redb operation a [`StateError::Storage`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Transaction,
    Table,
    Read,
    Write,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreOp::Transaction => "transaction",
            StoreOp::Table => "table open",
            StoreOp::Read => "read",
            StoreOp::Write => "write",
        })
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open audit database: {0}")]
    Open(String),

    #[error("audit database {op} failed: {detail}")]
    Storage { op: StoreOp, detail: String },

    /// A record or snapshot could not be encoded as JSON.
    #[error("cannot encode entry: {0}")]
    Encode(String),

    /// Stored bytes do not decode into the expected type.
    #[error("corrupt entry in audit database: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_name_the_operation() {
        let err = StateError::Storage {
            op: StoreOp::Table,
            detail: "no such table".into(),
        };
        assert_eq!(err.to_string(), "audit database table open failed: no such table");
    }
}
