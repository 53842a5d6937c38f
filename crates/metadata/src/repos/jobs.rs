//! Import job repository.

use crate::error::MetadataResult;
use crate::models::{ImportJobErrorRow, ImportJobRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for import jobs and their per-file errors.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Create an import job.
    async fn create_job(&self, job: &ImportJobRow) -> MetadataResult<()>;

    /// Get an import job by ID.
    async fn get_job(&self, job_id: Uuid) -> MetadataResult<Option<ImportJobRow>>;

    /// Item errors recorded for a job, oldest first.
    async fn get_job_errors(&self, job_id: Uuid) -> MetadataResult<Vec<ImportJobErrorRow>>;

    /// Move a queued job to running and count the attempt.
    /// Returns `false` if the job was not queued.
    async fn start_job(&self, job_id: Uuid, now: OffsetDateTime) -> MetadataResult<bool>;

    /// Persist counters and the enumeration flag of a running job.
    async fn update_job_progress(&self, job: &ImportJobRow) -> MetadataResult<()>;

    /// Record one per-file failure.
    async fn append_job_error(&self, error: &ImportJobErrorRow) -> MetadataResult<()>;

    /// Move a running job to a terminal status.
    async fn finish_job(
        &self,
        job_id: Uuid,
        status: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Put an unfinished job back in the queue with zeroed progress.
    ///
    /// Counters and recorded errors are cleared since the rerun reports every
    /// file again. Returns `false` if the job already finished.
    async fn reset_job(&self, job_id: Uuid, now: OffsetDateTime) -> MetadataResult<bool>;

    /// Jobs left `queued` or `running`, oldest first.
    ///
    /// At startup these are orphans of a previous process: `queued` jobs were
    /// never picked up and `running` jobs were interrupted.
    async fn get_orphaned_jobs(&self) -> MetadataResult<Vec<ImportJobRow>>;

    /// Delete finished jobs older than `before`, with their errors.
    async fn purge_finished_jobs(&self, before: OffsetDateTime, limit: u32)
    -> MetadataResult<u64>;
}
