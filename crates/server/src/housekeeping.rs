//! Periodic cleanup.
//!
//! Each pass expires idle upload sessions, purges terminal sessions and
//! finished jobs past retention, and sweeps staging objects that no ingest
//! claimed within the grace period.

use crate::error::IngestResult;
use crate::metrics;
use crate::sessions::UploadSessionManager;
use keepsake_core::config::HousekeepingConfig;
use keepsake_metadata::MetadataStore;
use keepsake_metadata::repos::{JobRepo, SessionRepo};
use keepsake_storage::{ObjectStore, StorageError, keys};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// What one pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub sessions_expired: u64,
    pub sessions_purged: u64,
    pub jobs_purged: u64,
    pub staging_swept: u64,
}

pub struct Housekeeper {
    config: HousekeepingConfig,
    sessions: Arc<UploadSessionManager>,
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl Housekeeper {
    pub fn new(
        config: HousekeepingConfig,
        sessions: Arc<UploadSessionManager>,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            config,
            sessions,
            storage,
            metadata,
        }
    }

    /// Run one pass as of `now`.
    pub async fn run_once(&self, now: OffsetDateTime) -> IngestResult<HousekeepingReport> {
        let batch = self.config.batch_size;
        let retain_after = now
            .checked_sub(self.config.retention())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);

        let report = HousekeepingReport {
            sessions_expired: self.sessions.expire_idle(now, batch).await?,
            sessions_purged: self
                .metadata
                .purge_terminal_sessions(retain_after, batch)
                .await?,
            jobs_purged: self.metadata.purge_finished_jobs(retain_after, batch).await?,
            staging_swept: self.sweep_staging(now).await?,
        };

        if report != HousekeepingReport::default() {
            tracing::info!(
                sessions_expired = report.sessions_expired,
                sessions_purged = report.sessions_purged,
                jobs_purged = report.jobs_purged,
                staging_swept = report.staging_swept,
                "housekeeping pass complete"
            );
        }
        Ok(report)
    }

    /// Delete staging objects older than the grace period.
    async fn sweep_staging(&self, now: OffsetDateTime) -> IngestResult<u64> {
        let cutoff = now
            .checked_sub(self.config.staging_grace())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let mut swept = 0;

        for key in self.storage.list(keys::STAGING_PREFIX).await? {
            let meta = match self.storage.head(&key).await {
                Ok(meta) => meta,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to stat staging object");
                    continue;
                }
            };
            // Without a timestamp there is no way to tell an abandoned object
            // from one being written right now.
            let Some(modified) = meta.last_modified else {
                continue;
            };
            if modified >= cutoff {
                continue;
            }
            match self.storage.delete(&key).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {
                    swept += 1;
                    metrics::STAGING_OBJECTS_SWEPT.inc();
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "failed to sweep staging object"),
            }
        }
        Ok(swept)
    }

    /// Run passes forever on the configured interval.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            loop {
                interval.tick().await;
                if let Err(e) = self.run_once(OffsetDateTime::now_utc()).await {
                    tracing::error!(error = %e, "housekeeping pass failed");
                }
            }
        })
    }
}
