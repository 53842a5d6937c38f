//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("offset mismatch: expected {expected}, got {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("size exceeded: declared {declared} bytes, write would reach {attempted}")]
    SizeExceeded { declared: u64, attempted: u64 },

    #[error("session closed: {state}")]
    SessionClosed { state: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
