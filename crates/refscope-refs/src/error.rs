//! Error types for reference operations.

use refscope_types::ObjectId;
use thiserror::Error;

use crate::types::TransactionState;

/// Result code for a failure caused by two updates or refs colliding on a
/// name.
pub const CODE_NAME_CONFLICT: i32 = -1;

/// Result code for a transaction used out of its lifecycle order or through
/// the wrong backend.
pub const CODE_TRANSACTION: i32 = -2;

/// Result code for every other failure.
pub const CODE_GENERIC: i32 = -1;

/// Errors that can occur during reference operations.
#[derive(Debug, Error)]
pub enum RefError {
    /// The reference, pseudoref, or reflog was not found.
    #[error("ref not found: {name}")]
    NotFound { name: String },

    /// A reference with this name already exists.
    #[error("ref already exists: {name}")]
    AlreadyExists { name: String },

    /// The ref name is malformed.
    #[error("invalid ref name: {name}: {reason}")]
    InvalidName { name: String, reason: String },

    /// The current value did not match the caller's expected old value.
    #[error("cannot lock ref '{name}': expected {expected}, found {actual}")]
    ValueMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// The same ref was named by two updates of one transaction.
    #[error("multiple updates for ref '{name}' not allowed")]
    DuplicateUpdate { name: String },

    /// The update is not allowed in this kind of transaction.
    #[error("invalid update of '{name}': {reason}")]
    InvalidUpdate { name: String, reason: String },

    /// The operation does not apply to a symbolic ref.
    #[error("ref is symbolic: {name}")]
    Symbolic { name: String },

    /// A transaction lifecycle operation ran in the wrong state.
    #[error("transaction is {actual:?}, expected {expected:?}")]
    TransactionState {
        expected: TransactionState,
        actual: TransactionState,
    },

    /// The transaction is bound to a different backend instance.
    #[error("transaction belongs to another ref store")]
    ForeignTransaction,

    /// An internal lock was poisoned by a panicking writer.
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

impl RefError {
    /// The integer result code reported for this failure.
    pub fn code(&self) -> i32 {
        match self {
            RefError::AlreadyExists { .. } | RefError::DuplicateUpdate { .. } => {
                CODE_NAME_CONFLICT
            }
            RefError::TransactionState { .. } | RefError::ForeignTransaction => CODE_TRANSACTION,
            _ => CODE_GENERIC,
        }
    }

    /// Build a [`RefError::ValueMismatch`] from an expected and an actual
    /// value, either of which may be absent.
    pub fn mismatch(name: &str, expected: Option<&ObjectId>, actual: Option<&ObjectId>) -> Self {
        let show = |id: Option<&ObjectId>| match id {
            Some(id) if !id.is_null() => id.to_hex(),
            _ => "nothing".to_string(),
        };
        RefError::ValueMismatch {
            name: name.to_string(),
            expected: show(expected),
            actual: show(actual),
        }
    }
}

/// Integer result code of an operation outcome: `0` on success.
pub fn result_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

/// Convenience type alias for ref operations.
pub type Result<T> = std::result::Result<T, RefError>;
