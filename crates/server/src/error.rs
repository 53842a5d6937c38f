//! Ingestion error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keepsake_metadata::MetadataError;
use keepsake_storage::StorageError;
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// Errors surfaced by sessions, ingestion, imports and the quota ledger.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("offset mismatch: expected {expected}, got {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("size exceeded: declared {declared} bytes, attempted {attempted}")]
    SizeExceeded { declared: u64, attempted: u64 },

    #[error("quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("session closed: {state}")]
    SessionClosed { state: String },

    #[error("storage write failed: {0}")]
    StorageWriteFailure(String),

    #[error("unreadable input: {0}")]
    Unreadable(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("shutting down")]
    ShuttingDown,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<keepsake_core::Error> for IngestError {
    fn from(err: keepsake_core::Error) -> Self {
        use keepsake_core::Error;
        match err {
            Error::OffsetMismatch { expected, actual } => Self::OffsetMismatch { expected, actual },
            Error::SizeExceeded {
                declared,
                attempted,
            } => Self::SizeExceeded {
                declared,
                attempted,
            },
            Error::SessionClosed { state } => Self::SessionClosed { state },
            Error::InvalidId(msg)
            | Error::InvalidHash(msg)
            | Error::InvalidState(msg)
            | Error::Validation(msg) => Self::ValidationError(msg),
        }
    }
}

impl IngestError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::OffsetMismatch { .. } => "offset_mismatch",
            Self::SizeExceeded { .. } => "size_exceeded",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::SessionClosed { .. } => "session_closed",
            Self::StorageWriteFailure(_) => "storage_write_failure",
            Self::Unreadable(_) => "unreadable",
            Self::ValidationError(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::ShuttingDown => "shutting_down",
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::OffsetMismatch { .. } => StatusCode::CONFLICT,
            Self::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Self::SessionClosed { .. } => StatusCode::GONE,
            Self::StorageWriteFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unreadable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                MetadataError::AlreadyExists(_) => StatusCode::CONFLICT,
                MetadataError::Constraint(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageWriteFailure(_))
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for ingestion operations and API handlers.
pub type IngestResult<T> = std::result::Result<T, IngestError>;
