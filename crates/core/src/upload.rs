//! Upload session types and lifecycle.

use crate::ids::{JobId, SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Upload session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Session exists but no bytes have arrived.
    Created,
    /// At least one chunk was accepted.
    InProgress,
    /// All bytes arrived and the session was handed to the import system.
    Completed,
    /// Explicitly aborted by the client.
    Aborted,
    /// Idle past the configured TTL.
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }

    /// Whether chunks may still be appended.
    pub fn accepts_writes(&self) -> bool {
        matches!(self, Self::Created | Self::InProgress)
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.accepts_writes()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            "expired" => Ok(Self::Expired),
            other => Err(crate::Error::InvalidState(format!(
                "unknown session state: {other}"
            ))),
        }
    }
}

/// Client-supplied description of the file being uploaded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    /// Original file name, if the client sent one.
    #[serde(default)]
    pub filename: Option<String>,
    /// MIME type, if the client sent one.
    #[serde(default)]
    pub content_type: Option<String>,
}

/// A resumable upload session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: SessionId,
    pub owner: UserId,
    pub declared_size: u64,
    pub bytes_received: u64,
    pub state: SessionState,
    pub metadata: UploadMetadata,
    /// Import job created when the session completed.
    pub job_id: Option<JobId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
}

impl UploadSession {
    /// Create a new session in the `Created` state.
    pub fn new(owner: UserId, declared_size: u64, metadata: UploadMetadata) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: SessionId::new(),
            owner,
            declared_size,
            bytes_received: 0,
            state: SessionState::Created,
            metadata,
            job_id: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Whether every declared byte has arrived.
    pub fn is_fully_received(&self) -> bool {
        self.bytes_received == self.declared_size
    }

    /// Whether the session has been idle for longer than `ttl` as of `now`.
    pub fn is_idle(&self, ttl: time::Duration, now: OffsetDateTime) -> bool {
        self.state.accepts_writes() && now - self.last_activity_at > ttl
    }

    /// Validate a chunk write and return the offset the session advances to.
    ///
    /// Checks run in order: state, offset, then declared size. The session is
    /// not modified.
    pub fn check_append(&self, offset: u64, len: u64) -> crate::Result<u64> {
        if !self.state.accepts_writes() {
            return Err(crate::Error::SessionClosed {
                state: self.state.to_string(),
            });
        }
        if offset != self.bytes_received {
            return Err(crate::Error::OffsetMismatch {
                expected: self.bytes_received,
                actual: offset,
            });
        }
        let attempted = self.bytes_received.saturating_add(len);
        if attempted > self.declared_size {
            return Err(crate::Error::SizeExceeded {
                declared: self.declared_size,
                attempted,
            });
        }
        Ok(attempted)
    }
}

/// Request to create an upload session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub owner_user_id: UserId,
    pub declared_size: u64,
    #[serde(flatten)]
    pub metadata: UploadMetadata,
}

/// Result of finalizing a session; identical on every repeated call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub session_id: SessionId,
    pub job_id: JobId,
}
