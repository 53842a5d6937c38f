//! Import jobs and progress snapshots.

use crate::ids::{JobId, SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::OffsetDateTime;

/// Where the files of an import job come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// One completed upload session.
    SingleUpload,
    /// A lazily enumerated batch of files.
    DirectoryScan,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleUpload => "single_upload",
            Self::DirectoryScan => "directory_scan",
        }
    }
}

impl FromStr for SourceKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "single_upload" => Ok(Self::SingleUpload),
            "directory_scan" => Ok(Self::DirectoryScan),
            other => Err(crate::Error::InvalidState(format!(
                "unknown source kind: {other}"
            ))),
        }
    }
}

/// Import job status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::InvalidState(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// A per-file failure recorded against a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Path of the file within its source.
    pub path: String,
    /// Stable error code (same vocabulary as API errors).
    pub code: String,
    pub message: String,
}

impl ItemError {
    pub fn new(path: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// What an import should ingest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportRequest {
    /// A session that already reached `Completed`.
    CompletedUpload { session_id: SessionId },
    /// Every file below a directory visible to the server.
    DirectoryScan { owner: UserId, root: PathBuf },
}

/// Counters of an import job, always updated as a whole.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    /// Files discovered so far.
    pub total_files: u64,
    /// Files whose processing finished, whatever the outcome.
    pub processed_files: u64,
    pub stored_files: u64,
    pub duplicate_files: u64,
}

/// A persisted import job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: JobId,
    pub owner: UserId,
    pub source_kind: SourceKind,
    /// Session ID for uploads, source location for scans.
    pub source_ref: String,
    pub status: JobStatus,
    pub counters: JobCounters,
    /// True once the source has no more files to report.
    pub enumeration_complete: bool,
    pub errors: Vec<ItemError>,
    /// Number of times the job has been started.
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl ImportJob {
    /// A queued job for one completed upload.
    pub fn for_upload(owner: UserId, session_id: SessionId) -> Self {
        let mut job = Self::queued(owner, SourceKind::SingleUpload, session_id.to_string());
        job.counters.total_files = 1;
        job.enumeration_complete = true;
        job
    }

    /// A queued job for a directory scan.
    pub fn for_scan(owner: UserId, source_ref: impl Into<String>) -> Self {
        Self::queued(owner, SourceKind::DirectoryScan, source_ref.into())
    }

    fn queued(owner: UserId, source_kind: SourceKind, source_ref: String) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: JobId::new(),
            owner,
            source_kind,
            source_ref,
            status: JobStatus::Queued,
            counters: JobCounters::default(),
            enumeration_complete: false,
            errors: Vec::new(),
            attempts: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Snapshot of this job's progress.
    pub fn progress(&self) -> ImportProgress {
        ImportProgress {
            job_id: self.id,
            owner: self.owner,
            source_kind: self.source_kind,
            status: self.status,
            counters: self.counters,
            enumeration_complete: self.enumeration_complete,
            errors: self.errors.clone(),
        }
    }
}

/// Point-in-time view of a job.
///
/// Replaced as a whole on every update, so readers never observe a
/// half-applied change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportProgress {
    pub job_id: JobId,
    pub owner: UserId,
    pub source_kind: SourceKind,
    pub status: JobStatus,
    pub counters: JobCounters,
    pub enumeration_complete: bool,
    pub errors: Vec<ItemError>,
}

impl ImportProgress {
    pub fn is_queued(&self) -> bool {
        self.status == JobStatus::Queued
    }

    /// The polling response exposed to clients.
    pub fn response(&self) -> ProgressResponse {
        ProgressResponse {
            is_queued: self.is_queued(),
            imported_items: self.counters.processed_files,
            total_items: self.counters.total_files,
            duplicate_items: self.counters.duplicate_files,
        }
    }
}

/// Progress response `{isQueued, importedItems, totalItems, duplicateItems}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub is_queued: bool,
    pub imported_items: u64,
    pub total_items: u64,
    pub duplicate_items: u64,
}
