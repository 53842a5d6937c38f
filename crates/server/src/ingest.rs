//! Deduplicating ingestion.
//!
//! Content is streamed into a staging key while it is hashed. Once the
//! fingerprint is known the catalog decides the outcome: an existing
//! (owner, fingerprint) row makes the file a duplicate, otherwise quota is
//! reserved, the staged object is renamed to its durable key, and the
//! catalog row plus usage charge are committed together. Ingests of the
//! same content for the same owner settle one at a time.

use crate::error::{IngestError, IngestResult};
use crate::events::{EventBus, IngestEvent};
use crate::metrics;
use crate::quota::QuotaLedger;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use keepsake_core::{ContentHash, JobId, MediaKind, ObjectRecord, UserId};
use keepsake_metadata::repos::ObjectRepo;
use keepsake_metadata::{MetadataError, MetadataStore};
use keepsake_storage::{ObjectStore, StorageError, keys};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Raw file content as a fallible byte stream.
pub type ContentStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Wrap an in-memory buffer as a [`ContentStream`].
pub fn content_from_bytes(data: Bytes) -> ContentStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// One file to ingest.
#[derive(Clone, Debug)]
pub struct IngestRequest {
    pub owner: UserId,
    /// Size the caller claims the content has.
    pub size_bytes: u64,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    /// Job the file belongs to, for event correlation.
    pub job_id: Option<JobId>,
}

impl IngestRequest {
    pub fn new(owner: UserId, size_bytes: u64) -> Self {
        Self {
            owner,
            size_bytes,
            filename: None,
            content_type: None,
            job_id: None,
        }
    }
}

/// Why a file was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    QuotaExceeded { requested: u64, available: u64 },
    /// The stream did not match the declared size.
    SizeMismatch { declared: u64, actual: u64 },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::SizeMismatch { .. } => "size_mismatch",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::QuotaExceeded {
                requested,
                available,
            } => format!("quota exceeded: requested {requested} bytes, {available} available"),
            Self::SizeMismatch { declared, actual } => {
                format!("declared {declared} bytes, stream carried {actual}")
            }
        }
    }
}

/// Result of ingesting one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New content, now durable and charged to the owner.
    Stored(ObjectRecord),
    /// The owner already had this content; nothing was charged.
    Duplicate { existing: ObjectRecord },
    Rejected(RejectReason),
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stored(_) => "stored",
            Self::Duplicate { .. } => "duplicate",
            Self::Rejected(_) => "rejected",
        }
    }
}

fn write_failure(err: StorageError) -> IngestError {
    IngestError::StorageWriteFailure(err.to_string())
}

/// Hashes, deduplicates and stores files.
pub struct IngestionEngine {
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    ledger: Arc<QuotaLedger>,
    events: EventBus,
    inflight: DashMap<(UserId, ContentHash), Arc<Mutex<()>>>,
}

impl IngestionEngine {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        ledger: Arc<QuotaLedger>,
        events: EventBus,
    ) -> Self {
        Self {
            storage,
            metadata,
            ledger,
            events,
            inflight: DashMap::new(),
        }
    }

    /// Ingest one file.
    ///
    /// Transient storage problems surface as `StorageWriteFailure`; a broken
    /// input stream is `Unreadable`. Neither leaves quota reserved.
    #[tracing::instrument(
        skip(self, request, content),
        fields(owner = %request.owner, size = request.size_bytes, job_id = ?request.job_id)
    )]
    pub async fn ingest(
        &self,
        request: IngestRequest,
        content: ContentStream,
    ) -> IngestResult<IngestOutcome> {
        let started = Instant::now();
        let result = self.ingest_inner(&request, content).await;
        metrics::INGEST_DURATION.observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) => {
                metrics::record_ingest_outcome(outcome.label());
                self.publish(&request, outcome);
            }
            Err(e) => {
                tracing::warn!(error = %e, code = e.code(), "ingest failed");
            }
        }
        result
    }

    async fn ingest_inner(
        &self,
        request: &IngestRequest,
        content: ContentStream,
    ) -> IngestResult<IngestOutcome> {
        let staging_key = keys::staging_key();
        let fingerprint = match self.stage(request, content, &staging_key).await? {
            Ok(fingerprint) => fingerprint,
            Err(reason) => return Ok(IngestOutcome::Rejected(reason)),
        };
        let owner = request.owner;

        // One ingest per (owner, fingerprint) gets from lookup to commit at a
        // time; the others wait and then find its catalog row.
        let slot = self.inflight.entry((owner, fingerprint)).or_default().clone();
        let guard = slot.lock_owned().await;
        let result = self.settle(request, fingerprint, &staging_key).await;
        drop(guard);
        self.inflight
            .remove_if(&(owner, fingerprint), |_, slot| Arc::strong_count(slot) == 1);
        result
    }

    /// Decide the outcome for staged content with a known fingerprint.
    async fn settle(
        &self,
        request: &IngestRequest,
        fingerprint: ContentHash,
        staging_key: &str,
    ) -> IngestResult<IngestOutcome> {
        let owner = request.owner;

        if let Some(existing) = self.lookup(owner, &fingerprint).await? {
            self.discard(staging_key).await;
            metrics::BYTES_DEDUPLICATED.inc_by(request.size_bytes);
            tracing::debug!(fingerprint = %fingerprint, "content already stored for owner");
            return Ok(IngestOutcome::Duplicate { existing });
        }

        let reservation = match self.ledger.reserve(owner, request.size_bytes).await {
            Ok(reservation) => reservation,
            Err(IngestError::QuotaExceeded {
                requested,
                available,
            }) => {
                self.discard(staging_key).await;
                return Ok(IngestOutcome::Rejected(RejectReason::QuotaExceeded {
                    requested,
                    available,
                }));
            }
            Err(e) => {
                self.discard(staging_key).await;
                return Err(e);
            }
        };

        let media_kind = MediaKind::detect(
            request.content_type.as_deref(),
            request.filename.as_deref(),
        );
        let record = ObjectRecord::new(
            owner,
            fingerprint,
            request.size_bytes,
            media_kind,
            request.filename.clone(),
        );

        if let Err(e) = self
            .storage
            .rename(staging_key, &record.storage_locator)
            .await
        {
            self.ledger.release(reservation);
            self.discard(staging_key).await;
            return Err(write_failure(e));
        }

        match self.ledger.commit_object(reservation, &record).await {
            Ok(()) => {
                metrics::BYTES_STORED.inc_by(record.size_bytes);
                tracing::info!(
                    object_id = %record.id,
                    fingerprint = %record.fingerprint,
                    media_kind = record.media_kind.as_str(),
                    "object stored"
                );
                Ok(IngestOutcome::Stored(record))
            }
            Err(IngestError::Metadata(MetadataError::AlreadyExists(_))) => {
                // Another engine on the same catalog won; its row points at
                // the same durable key, so the bytes stay.
                let existing = self.lookup(owner, &fingerprint).await?.ok_or_else(|| {
                    IngestError::Internal(format!("catalog row for {fingerprint} vanished"))
                })?;
                Ok(IngestOutcome::Duplicate { existing })
            }
            Err(IngestError::QuotaExceeded {
                requested,
                available,
            }) => {
                self.discard_unreferenced(owner, &fingerprint, &record.storage_locator)
                    .await;
                Ok(IngestOutcome::Rejected(RejectReason::QuotaExceeded {
                    requested,
                    available,
                }))
            }
            Err(e) => {
                self.discard_unreferenced(owner, &fingerprint, &record.storage_locator)
                    .await;
                Err(e)
            }
        }
    }

    /// Stream content into `staging_key` while hashing it.
    ///
    /// The inner `Err` is a size mismatch; nothing is left staged in that case.
    async fn stage(
        &self,
        request: &IngestRequest,
        mut content: ContentStream,
        staging_key: &str,
    ) -> IngestResult<Result<ContentHash, RejectReason>> {
        let mut upload = self
            .storage
            .put_stream(staging_key)
            .await
            .map_err(write_failure)?;
        let mut hasher = ContentHash::hasher();

        while let Some(item) = content.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = upload.abort().await;
                    return Err(IngestError::Unreadable(e.to_string()));
                }
            };
            hasher.update(&chunk);

            if hasher.bytes_hashed() > request.size_bytes {
                let _ = upload.abort().await;
                return Ok(Err(RejectReason::SizeMismatch {
                    declared: request.size_bytes,
                    actual: hasher.bytes_hashed(),
                }));
            }

            if let Err(e) = upload.write(chunk).await {
                let _ = upload.abort().await;
                return Err(write_failure(e));
            }
        }

        if hasher.bytes_hashed() != request.size_bytes {
            let _ = upload.abort().await;
            return Ok(Err(RejectReason::SizeMismatch {
                declared: request.size_bytes,
                actual: hasher.bytes_hashed(),
            }));
        }

        upload.finish().await.map_err(write_failure)?;
        Ok(Ok(hasher.finalize()))
    }

    async fn lookup(
        &self,
        owner: UserId,
        fingerprint: &ContentHash,
    ) -> IngestResult<Option<ObjectRecord>> {
        let row = self
            .metadata
            .get_object(owner.into_uuid(), &fingerprint.to_hex())
            .await?;
        Ok(row.map(ObjectRecord::try_from).transpose()?)
    }

    /// Remove a staged object. Failures are left for the staging sweep.
    async fn discard(&self, key: &str) {
        match self.storage.delete(key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => tracing::warn!(key, error = %e, "failed to discard staged object"),
        }
    }

    /// Remove a durable object unless the catalog references it.
    async fn discard_unreferenced(&self, owner: UserId, fingerprint: &ContentHash, key: &str) {
        match self.lookup(owner, fingerprint).await {
            Ok(None) => self.discard(key).await,
            Ok(Some(_)) => {}
            Err(e) => tracing::warn!(key, error = %e, "catalog lookup failed, keeping object"),
        }
    }

    fn publish(&self, request: &IngestRequest, outcome: &IngestOutcome) {
        let owner = request.owner;
        let job_id = request.job_id;
        match outcome {
            IngestOutcome::Stored(record) => {
                self.events.publish(IngestEvent::Stored {
                    owner,
                    object_id: record.id,
                    fingerprint: record.fingerprint,
                    size_bytes: record.size_bytes,
                    job_id,
                });
                if record.media_kind == MediaKind::Video {
                    self.events.publish(IngestEvent::VideoConversionRequested {
                        owner,
                        object_id: record.id,
                        storage_locator: record.storage_locator.clone(),
                    });
                }
            }
            IngestOutcome::Duplicate { existing } => {
                self.events.publish(IngestEvent::Duplicate {
                    owner,
                    fingerprint: existing.fingerprint,
                    job_id,
                });
            }
            IngestOutcome::Rejected(reason) => {
                self.events.publish(IngestEvent::Rejected {
                    owner,
                    reason: reason.code().to_string(),
                    job_id,
                });
            }
        }
    }
}
