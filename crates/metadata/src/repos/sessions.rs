//! Upload session repository.

use crate::error::MetadataResult;
use crate::models::{ImportJobRow, UploadPartRow, UploadSessionRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for resumable upload sessions and their parts.
#[async_trait]
pub trait SessionRepo: Send + Sync {
    /// Create a new upload session.
    async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()>;

    /// Get an upload session by ID.
    async fn get_session(&self, session_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// Record a received chunk.
    ///
    /// Advances `bytes_received` from `expected_offset` to
    /// `expected_offset + size_bytes` and inserts the part row in one
    /// transaction. Returns `false` without changing anything when the session
    /// no longer accepts writes, its offset moved, or the chunk would overrun
    /// the declared size.
    async fn append_part(
        &self,
        session_id: Uuid,
        expected_offset: i64,
        size_bytes: i64,
        object_key: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Parts of a session in offset order.
    async fn list_parts(&self, session_id: Uuid) -> MetadataResult<Vec<UploadPartRow>>;

    /// Drop the part rows of a session. Returns the number removed.
    async fn delete_parts(&self, session_id: Uuid) -> MetadataResult<u64>;

    /// Mark a fully received session completed and create its import job.
    ///
    /// Both happen in one transaction. Returns `false` when the session was
    /// not open or not fully received, in which case no job is created.
    async fn complete_session(
        &self,
        session_id: Uuid,
        job: &ImportJobRow,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Move a session to `to` if it is currently in one of `from`.
    /// Returns whether this call made the transition.
    async fn transition_session(
        &self,
        session_id: Uuid,
        from: &[&str],
        to: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Open sessions with no activity since `idle_before`.
    async fn get_idle_sessions(
        &self,
        idle_before: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Delete terminal sessions last touched before `before`, with their parts.
    ///
    /// A completed session whose import job is still queued or running is kept.
    async fn purge_terminal_sessions(
        &self,
        before: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<u64>;
}
