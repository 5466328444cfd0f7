use thiserror::Error;

use crate::persistent::errors::StorageError;

/// Errors from either store.
#[derive(Debug, Error)]
pub enum DbError {
    /// The SQLite store failed.
    #[error("sqlite: {0}")]
    Storage(#[from] StorageError),

    /// The record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The write would move a status backwards.
    #[error("{entity} {id}: cannot move from status {from} to {to}")]
    InvalidTransition {
        /// Kind of record.
        entity: &'static str,
        /// Record id.
        id: i64,
        /// Current status code.
        from: i64,
        /// Requested status code.
        to: i64,
    },

    /// The write conflicts with existing records.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Result alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(StorageError::Driver(err))
    }
}
