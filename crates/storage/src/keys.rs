//! Key layout for transient objects.
//!
//! Durable object keys live in `keepsake_core::object_key`; everything here is
//! scratch space that housekeeping may reclaim.

use keepsake_core::SessionId;
use uuid::Uuid;

/// Prefix under which ingestion stages content before it is fingerprinted.
pub const STAGING_PREFIX: &str = "staging";

/// Prefix under which upload sessions keep their received chunks.
pub const UPLOADS_PREFIX: &str = "uploads";

/// A fresh, collision-free staging key.
pub fn staging_key() -> String {
    format!("{STAGING_PREFIX}/{}", Uuid::new_v4())
}

/// Prefix holding every part of one session.
pub fn upload_parts_prefix(session_id: &SessionId) -> String {
    format!("{UPLOADS_PREFIX}/{session_id}")
}

/// Key for a part starting at `offset`.
///
/// The offset is zero-padded so a lexical listing is also offset order. The
/// random suffix keeps a losing concurrent writer from clobbering the winner.
pub fn upload_part_key(session_id: &SessionId, offset: u64) -> String {
    format!(
        "{}/{offset:020}-{}",
        upload_parts_prefix(session_id),
        Uuid::new_v4().simple()
    )
}
