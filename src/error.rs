//! Error types for faregate
//!
//! `StorageError` is the fault channel shared by every component. Business
//! outcomes (a denied gate, an empty balance) are not errors at this level;
//! each service layers its own error enum on top with the business variants
//! it can produce.

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage timeout: {0}")]
    Timeout(String),

    #[error("Database error ({context}): {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Wrap a SQLite error, classifying lock contention as a timeout
    pub fn query(context: &str, err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ffi, _) = &err {
            if matches!(ffi.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
                return StorageError::Timeout(format!("{}: {}", context, err));
            }
        }
        StorageError::Database {
            context: context.to_string(),
            source: err,
        }
    }

    /// True when the caller may retry the whole request
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Timeout(_))
    }
}

/// True when a SQLite error is a UNIQUE / CHECK constraint violation
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(ffi, _) if ffi.code == ErrorCode::ConstraintViolation
    )
}
