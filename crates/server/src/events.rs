//! Ingest event broadcast.
//!
//! Downstream consumers (thumbnailing, video conversion) subscribe here; the
//! core only publishes.

use keepsake_core::{ContentHash, JobId, ObjectId, UserId};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

/// Something that happened to an ingested file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestEvent {
    Stored {
        owner: UserId,
        object_id: ObjectId,
        fingerprint: ContentHash,
        size_bytes: u64,
        job_id: Option<JobId>,
    },
    Duplicate {
        owner: UserId,
        fingerprint: ContentHash,
        job_id: Option<JobId>,
    },
    Rejected {
        owner: UserId,
        reason: String,
        job_id: Option<JobId>,
    },
    /// A stored video needs a streaming-friendly rendition.
    VideoConversionRequested {
        owner: UserId,
        object_id: ObjectId,
        storage_locator: String,
    },
}

/// Fan-out channel for [`IngestEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IngestEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: IngestEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
