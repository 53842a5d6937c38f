//! Database models mapping to the metadata schema.
//!
//! Rows mirror the tables one to one. Conversions to and from the domain
//! types in `keepsake_core` live here so repositories only deal in rows.

use crate::error::{MetadataError, MetadataResult};
use keepsake_core::{
    ContentHash, ImportJob, ItemError, JobCounters, JobId, JobStatus, MediaKind, ObjectId,
    ObjectRecord, QuotaAccount, SessionId, SessionState, SourceKind, UploadMetadata,
    UploadSession, UserId,
};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Convert an unsigned domain value to a SQLite integer.
pub fn to_i64(value: u64, field: &str) -> MetadataResult<i64> {
    i64::try_from(value)
        .map_err(|_| MetadataError::Internal(format!("{field} out of range: {value}")))
}

/// Convert a SQLite integer back to an unsigned domain value.
pub fn to_u64(value: i64, field: &str) -> MetadataResult<u64> {
    u64::try_from(value)
        .map_err(|_| MetadataError::Internal(format!("negative {field} in database: {value}")))
}

fn corrupt(err: keepsake_core::Error) -> MetadataError {
    MetadataError::Internal(format!("corrupt row: {err}"))
}

// =============================================================================
// Quota accounts
// =============================================================================

/// Per-user quota account.
#[derive(Debug, Clone, FromRow)]
pub struct QuotaAccountRow {
    pub user_id: Uuid,
    pub limit_bytes: i64,
    pub used_bytes: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TryFrom<QuotaAccountRow> for QuotaAccount {
    type Error = MetadataError;

    fn try_from(row: QuotaAccountRow) -> MetadataResult<Self> {
        Ok(QuotaAccount {
            user_id: UserId::from_uuid(row.user_id),
            limit_bytes: to_u64(row.limit_bytes, "limit_bytes")?,
            used_bytes: to_u64(row.used_bytes, "used_bytes")?,
        })
    }
}

// =============================================================================
// Upload sessions
// =============================================================================

/// Resumable upload session record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub session_id: Uuid,
    pub owner_user_id: Uuid,
    pub declared_size: i64,
    pub bytes_received: i64,
    pub state: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    /// Set when the session is finalized.
    pub job_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub last_activity_at: OffsetDateTime,
}

impl TryFrom<&UploadSession> for UploadSessionRow {
    type Error = MetadataError;

    fn try_from(session: &UploadSession) -> MetadataResult<Self> {
        Ok(Self {
            session_id: session.id.into_uuid(),
            owner_user_id: session.owner.into_uuid(),
            declared_size: to_i64(session.declared_size, "declared_size")?,
            bytes_received: to_i64(session.bytes_received, "bytes_received")?,
            state: session.state.as_str().to_string(),
            filename: session.metadata.filename.clone(),
            content_type: session.metadata.content_type.clone(),
            job_id: session.job_id.map(JobId::into_uuid),
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
        })
    }
}

impl TryFrom<UploadSessionRow> for UploadSession {
    type Error = MetadataError;

    fn try_from(row: UploadSessionRow) -> MetadataResult<Self> {
        Ok(UploadSession {
            id: SessionId::from_uuid(row.session_id),
            owner: UserId::from_uuid(row.owner_user_id),
            declared_size: to_u64(row.declared_size, "declared_size")?,
            bytes_received: to_u64(row.bytes_received, "bytes_received")?,
            state: row.state.parse::<SessionState>().map_err(corrupt)?,
            metadata: UploadMetadata {
                filename: row.filename,
                content_type: row.content_type,
            },
            job_id: row.job_id.map(JobId::from_uuid),
            created_at: row.created_at,
            last_activity_at: row.last_activity_at,
        })
    }
}

/// One chunk received by a session, stored under `object_key`.
#[derive(Debug, Clone, FromRow)]
pub struct UploadPartRow {
    pub session_id: Uuid,
    pub offset_bytes: i64,
    pub size_bytes: i64,
    pub object_key: String,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Objects
// =============================================================================

/// Catalogued object, unique per (owner, fingerprint).
#[derive(Debug, Clone, FromRow)]
pub struct ObjectRow {
    pub object_id: Uuid,
    pub owner_user_id: Uuid,
    /// Lowercase hex SHA-256.
    pub fingerprint: String,
    pub size_bytes: i64,
    pub storage_locator: String,
    pub media_kind: String,
    pub original_name: Option<String>,
    pub created_at: OffsetDateTime,
}

impl TryFrom<&ObjectRecord> for ObjectRow {
    type Error = MetadataError;

    fn try_from(record: &ObjectRecord) -> MetadataResult<Self> {
        Ok(Self {
            object_id: record.id.into_uuid(),
            owner_user_id: record.owner.into_uuid(),
            fingerprint: record.fingerprint.to_hex(),
            size_bytes: to_i64(record.size_bytes, "size_bytes")?,
            storage_locator: record.storage_locator.clone(),
            media_kind: record.media_kind.as_str().to_string(),
            original_name: record.original_name.clone(),
            created_at: record.created_at,
        })
    }
}

impl TryFrom<ObjectRow> for ObjectRecord {
    type Error = MetadataError;

    fn try_from(row: ObjectRow) -> MetadataResult<Self> {
        Ok(ObjectRecord {
            id: ObjectId::from_uuid(row.object_id),
            owner: UserId::from_uuid(row.owner_user_id),
            fingerprint: ContentHash::from_hex(&row.fingerprint).map_err(corrupt)?,
            size_bytes: to_u64(row.size_bytes, "size_bytes")?,
            storage_locator: row.storage_locator,
            media_kind: row.media_kind.parse::<MediaKind>().map_err(corrupt)?,
            original_name: row.original_name,
            created_at: row.created_at,
        })
    }
}

// =============================================================================
// Import jobs
// =============================================================================

/// Import job record.
#[derive(Debug, Clone, FromRow)]
pub struct ImportJobRow {
    pub job_id: Uuid,
    pub owner_user_id: Uuid,
    pub source_kind: String,
    /// Session id for single uploads, scan root for directory scans.
    pub source_ref: String,
    pub status: String,
    pub total_files: i64,
    pub processed_files: i64,
    pub stored_files: i64,
    pub duplicate_files: i64,
    pub enumeration_complete: bool,
    pub attempts: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
}

impl TryFrom<&ImportJob> for ImportJobRow {
    type Error = MetadataError;

    fn try_from(job: &ImportJob) -> MetadataResult<Self> {
        Ok(Self {
            job_id: job.id.into_uuid(),
            owner_user_id: job.owner.into_uuid(),
            source_kind: job.source_kind.as_str().to_string(),
            source_ref: job.source_ref.clone(),
            status: job.status.as_str().to_string(),
            total_files: to_i64(job.counters.total_files, "total_files")?,
            processed_files: to_i64(job.counters.processed_files, "processed_files")?,
            stored_files: to_i64(job.counters.stored_files, "stored_files")?,
            duplicate_files: to_i64(job.counters.duplicate_files, "duplicate_files")?,
            enumeration_complete: job.enumeration_complete,
            attempts: i64::from(job.attempts),
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
        })
    }
}

impl ImportJobRow {
    /// Assemble the domain job from this row and its recorded item errors.
    pub fn into_job(self, errors: Vec<ImportJobErrorRow>) -> MetadataResult<ImportJob> {
        Ok(ImportJob {
            id: JobId::from_uuid(self.job_id),
            owner: UserId::from_uuid(self.owner_user_id),
            source_kind: self.source_kind.parse::<SourceKind>().map_err(corrupt)?,
            source_ref: self.source_ref,
            status: self.status.parse::<JobStatus>().map_err(corrupt)?,
            counters: JobCounters {
                total_files: to_u64(self.total_files, "total_files")?,
                processed_files: to_u64(self.processed_files, "processed_files")?,
                stored_files: to_u64(self.stored_files, "stored_files")?,
                duplicate_files: to_u64(self.duplicate_files, "duplicate_files")?,
            },
            enumeration_complete: self.enumeration_complete,
            errors: errors.into_iter().map(ItemError::from).collect(),
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}

/// A per-file failure recorded against a job.
#[derive(Debug, Clone, FromRow)]
pub struct ImportJobErrorRow {
    pub job_id: Uuid,
    pub path: String,
    pub code: String,
    pub message: String,
    pub created_at: OffsetDateTime,
}

impl ImportJobErrorRow {
    pub fn new(job_id: JobId, error: &ItemError) -> Self {
        Self {
            job_id: job_id.into_uuid(),
            path: error.path.clone(),
            code: error.code.clone(),
            message: error.message.clone(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

impl From<ImportJobErrorRow> for ItemError {
    fn from(row: ImportJobErrorRow) -> Self {
        ItemError::new(row.path, row.code, row.message)
    }
}
