//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Whether the error came from a uniqueness constraint.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Whether a sqlx error is a UNIQUE violation on `table`.
///
/// SQLite reports these as "UNIQUE constraint failed: table.col, ..." so the
/// table name is enough to tell which constraint fired.
pub(crate) fn is_unique_violation(err: &sqlx::Error, table: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message();
            msg.contains("UNIQUE constraint") && msg.contains(table)
        }
        _ => false,
    }
}
