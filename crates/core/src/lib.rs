//! Core domain types for the Keepsake ingestion core.
//!
//! This crate defines the data model shared by the other crates:
//! - User, session, job and object identifiers
//! - Content fingerprints
//! - Upload session lifecycle and chunk validation
//! - Import jobs and progress snapshots
//! - Catalogued objects and their storage keys
//! - Quota accounts

pub mod config;
pub mod error;
pub mod hash;
pub mod ids;
pub mod import;
pub mod object;
pub mod quota;
pub mod upload;

pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use ids::{JobId, ObjectId, SessionId, UserId};
pub use import::{
    ImportJob, ImportProgress, ImportRequest, ItemError, JobCounters, JobStatus, ProgressResponse,
    SourceKind,
};
pub use object::{MediaKind, ObjectRecord, object_key};
pub use quota::{QuotaAccount, QuotaUsage};
pub use upload::{
    CreateSessionRequest, FinalizeResponse, SessionState, UploadMetadata, UploadSession,
};

/// Maximum chunk size: 32 MiB
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;
