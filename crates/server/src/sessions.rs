//! Resumable upload sessions.
//!
//! A session accepts chunks strictly in offset order. Every accepted chunk is
//! written to its own part key first and then recorded with a compare-and-set
//! on `bytes_received`, so concurrent writers at the same offset cannot both
//! win and a rejected chunk never changes the session.

use crate::coordinator::JobDispatcher;
use crate::error::{IngestError, IngestResult};
use crate::metrics;
use crate::quota::QuotaLedger;
use bytes::Bytes;
use keepsake_core::config::UploadConfig;
use keepsake_core::{
    CreateSessionRequest, FinalizeResponse, ImportJob, SessionId, SessionState, UploadSession,
};
use keepsake_metadata::MetadataStore;
use keepsake_metadata::models::{ImportJobRow, UploadSessionRow, to_i64};
use keepsake_metadata::repos::SessionRepo;
use keepsake_storage::{ObjectStore, StorageError, keys};
use std::sync::Arc;
use time::OffsetDateTime;

const OPEN_STATES: &[&str] = &["created", "in_progress"];

/// Owns the lifecycle of upload sessions.
pub struct UploadSessionManager {
    config: UploadConfig,
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    ledger: Arc<QuotaLedger>,
    dispatcher: JobDispatcher,
}

impl UploadSessionManager {
    pub fn new(
        config: UploadConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        ledger: Arc<QuotaLedger>,
        dispatcher: JobDispatcher,
    ) -> Self {
        Self {
            config,
            storage,
            metadata,
            ledger,
            dispatcher,
        }
    }

    /// Open a new session for a file of `declared_size` bytes.
    ///
    /// With `quota_precheck` enabled a file that cannot fit in the owner's
    /// remaining quota is refused up front. Nothing is reserved: the binding
    /// check happens at ingestion.
    #[tracing::instrument(skip(self, request), fields(owner = %request.owner_user_id, size = request.declared_size))]
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> IngestResult<UploadSession> {
        if request.declared_size == 0 {
            return Err(IngestError::ValidationError(
                "declared size must be positive".to_string(),
            ));
        }
        if request.declared_size > self.config.max_object_size {
            return Err(IngestError::ValidationError(format!(
                "declared size {} exceeds maximum object size {}",
                request.declared_size, self.config.max_object_size
            )));
        }

        if self.config.quota_precheck {
            let available = self.ledger.available(request.owner_user_id).await?;
            if request.declared_size > available {
                metrics::QUOTA_REJECTIONS.inc();
                return Err(IngestError::QuotaExceeded {
                    requested: request.declared_size,
                    available,
                });
            }
        }

        let session = UploadSession::new(
            request.owner_user_id,
            request.declared_size,
            request.metadata,
        );
        let row = UploadSessionRow::try_from(&session)?;
        self.metadata.create_session(&row).await?;

        metrics::UPLOAD_SESSIONS_CREATED.inc();
        tracing::info!(session_id = %session.id, "upload session created");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: SessionId) -> IngestResult<UploadSession> {
        let row = self
            .metadata
            .get_session(session_id.into_uuid())
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("upload session {session_id}")))?;
        Ok(UploadSession::try_from(row)?)
    }

    /// Append a chunk at `offset`. Returns the new `bytes_received`.
    #[tracing::instrument(skip(self, data), fields(len = data.len()))]
    pub async fn append_chunk(
        &self,
        session_id: SessionId,
        offset: u64,
        data: Bytes,
    ) -> IngestResult<u64> {
        let result = self.append_chunk_inner(session_id, offset, data).await;
        if let Err(e) = &result {
            metrics::record_upload_error(e.code());
        }
        result
    }

    async fn append_chunk_inner(
        &self,
        session_id: SessionId,
        offset: u64,
        data: Bytes,
    ) -> IngestResult<u64> {
        let len = data.len() as u64;
        if len == 0 {
            return Err(IngestError::ValidationError("empty chunk".to_string()));
        }
        if len > self.config.max_chunk_size {
            return Err(IngestError::ValidationError(format!(
                "chunk of {len} bytes exceeds maximum {}",
                self.config.max_chunk_size
            )));
        }

        let session = self.get_session(session_id).await?;
        let new_offset = session.check_append(offset, len)?;

        let key = keys::upload_part_key(&session_id, offset);
        self.storage
            .put(&key, data)
            .await
            .map_err(|e| IngestError::StorageWriteFailure(e.to_string()))?;

        let advanced = self
            .metadata
            .append_part(
                session_id.into_uuid(),
                to_i64(offset, "offset")?,
                to_i64(len, "chunk size")?,
                &key,
                OffsetDateTime::now_utc(),
            )
            .await?;

        if !advanced {
            // Another writer moved the session first. Report against the
            // state it left behind.
            self.delete_part(&key).await;
            let current = self.get_session(session_id).await?;
            current.check_append(offset, len)?;
            return Err(IngestError::OffsetMismatch {
                expected: current.bytes_received,
                actual: offset,
            });
        }

        metrics::BYTES_RECEIVED.inc_by(len);
        tracing::debug!(session_id = %session_id, offset = new_offset, "chunk accepted");
        Ok(new_offset)
    }

    /// Close a fully received session and queue its import.
    ///
    /// Repeating the call on a completed session returns the same job and
    /// queues nothing new.
    #[tracing::instrument(skip(self))]
    pub async fn finalize(&self, session_id: SessionId) -> IngestResult<FinalizeResponse> {
        let session = self.get_session(session_id).await?;
        match session.state {
            SessionState::Completed => return completed_response(&session),
            SessionState::Aborted | SessionState::Expired => {
                return Err(IngestError::SessionClosed {
                    state: session.state.to_string(),
                });
            }
            SessionState::Created | SessionState::InProgress => {}
        }
        if !session.is_fully_received() {
            return Err(IngestError::ValidationError(format!(
                "session incomplete: received {} of {} bytes",
                session.bytes_received, session.declared_size
            )));
        }

        let job = ImportJob::for_upload(session.owner, session_id);
        let row = ImportJobRow::try_from(&job)?;
        let won = self
            .metadata
            .complete_session(session_id.into_uuid(), &row, OffsetDateTime::now_utc())
            .await?;

        if !won {
            let current = self.get_session(session_id).await?;
            return match current.state {
                SessionState::Completed => completed_response(&current),
                state => Err(IngestError::SessionClosed {
                    state: state.to_string(),
                }),
            };
        }

        metrics::UPLOAD_SESSIONS_FINALIZED.inc();
        metrics::JOBS_ENQUEUED.inc();
        tracing::info!(session_id = %session_id, job_id = %job.id, "upload session finalized");

        if let Err(e) = self.dispatcher.dispatch(job.id) {
            // The job row is durable; startup recovery picks it up.
            tracing::warn!(job_id = %job.id, error = %e, "import job not dispatched");
        }

        Ok(FinalizeResponse {
            session_id,
            job_id: job.id,
        })
    }

    /// Abandon a session and drop its parts. Aborting twice is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self, session_id: SessionId) -> IngestResult<()> {
        let session = self.get_session(session_id).await?;
        match session.state {
            SessionState::Aborted => return Ok(()),
            SessionState::Completed | SessionState::Expired => {
                return Err(IngestError::SessionClosed {
                    state: session.state.to_string(),
                });
            }
            SessionState::Created | SessionState::InProgress => {}
        }

        let won = self
            .metadata
            .transition_session(
                session_id.into_uuid(),
                OPEN_STATES,
                SessionState::Aborted.as_str(),
                OffsetDateTime::now_utc(),
            )
            .await?;
        if !won {
            let current = self.get_session(session_id).await?;
            return match current.state {
                SessionState::Aborted => Ok(()),
                state => Err(IngestError::SessionClosed {
                    state: state.to_string(),
                }),
            };
        }

        self.release_parts(session_id).await?;
        metrics::UPLOAD_SESSIONS_ABORTED.inc();
        tracing::info!(session_id = %session_id, "upload session aborted");
        Ok(())
    }

    /// Expire open sessions idle for longer than the session TTL.
    ///
    /// Only the caller that moves a session to `Expired` releases its parts,
    /// so parts are released exactly once. Returns the number expired.
    pub async fn expire_idle(&self, now: OffsetDateTime, limit: u32) -> IngestResult<u64> {
        let idle_before = now - self.config.session_ttl();
        let rows = self.metadata.get_idle_sessions(idle_before, limit).await?;

        let mut expired = 0;
        for row in rows {
            let session_id = SessionId::from_uuid(row.session_id);
            let won = self
                .metadata
                .transition_session(
                    row.session_id,
                    OPEN_STATES,
                    SessionState::Expired.as_str(),
                    now,
                )
                .await?;
            if !won {
                continue;
            }
            if let Err(e) = self.release_parts(session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "failed to release expired session parts");
            }
            expired += 1;
            metrics::UPLOAD_SESSIONS_EXPIRED.inc();
            tracing::info!(session_id = %session_id, "upload session expired");
        }
        Ok(expired)
    }

    /// Delete every stored part of a session and its part rows.
    pub async fn release_parts(&self, session_id: SessionId) -> IngestResult<()> {
        release_parts(self.storage.as_ref(), self.metadata.as_ref(), session_id).await
    }

    async fn delete_part(&self, key: &str) {
        match self.storage.delete(key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => tracing::warn!(key, error = %e, "failed to delete rejected part"),
        }
    }
}

fn completed_response(session: &UploadSession) -> IngestResult<FinalizeResponse> {
    let job_id = session.job_id.ok_or_else(|| {
        IngestError::Internal(format!("completed session {} has no job", session.id))
    })?;
    Ok(FinalizeResponse {
        session_id: session.id,
        job_id,
    })
}

/// Delete a session's parts from storage, then its part rows.
///
/// Keys under the session prefix that no row references (a losing
/// concurrent writer) are removed too.
pub(crate) async fn release_parts(
    storage: &dyn ObjectStore,
    metadata: &dyn MetadataStore,
    session_id: SessionId,
) -> IngestResult<()> {
    let mut keys: Vec<String> = metadata
        .list_parts(session_id.into_uuid())
        .await?
        .into_iter()
        .map(|part| part.object_key)
        .collect();
    for key in storage.list(&keys::upload_parts_prefix(&session_id)).await? {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    for key in &keys {
        match storage.delete(key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let removed = metadata.delete_parts(session_id.into_uuid()).await?;
    tracing::debug!(session_id = %session_id, parts = removed, "upload parts released");
    Ok(())
}
