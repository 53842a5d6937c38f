//! Keepsake ingestion server.
//!
//! This crate provides the ingestion core and its HTTP surface:
//! - Resumable upload sessions
//! - Import job coordination with per-user concurrency limits
//! - Deduplicating ingestion into the object store
//! - Per-user quota accounting
//! - Housekeeping of idle sessions and abandoned staging objects

pub mod coordinator;
pub mod error;
pub mod events;
pub mod handlers;
pub mod housekeeping;
pub mod ingest;
pub mod metrics;
pub mod quota;
pub mod routes;
pub mod sessions;
pub mod source;
pub mod state;

pub use coordinator::{ImportCoordinator, JobDispatcher, RecoveryReport};
pub use error::{ErrorResponse, IngestError, IngestResult};
pub use events::{EventBus, IngestEvent};
pub use housekeeping::{Housekeeper, HousekeepingReport};
pub use ingest::{
    ContentStream, IngestOutcome, IngestRequest, IngestionEngine, RejectReason,
    content_from_bytes,
};
pub use quota::{QuotaLedger, Reservation};
pub use routes::create_router;
pub use sessions::UploadSessionManager;
pub use source::{FsDirectorySource, FsSourceResolver, ScanEntry, ScanSource, SourceResolver};
pub use state::AppState;
