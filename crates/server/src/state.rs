//! Application state shared across handlers.

use crate::coordinator::ImportCoordinator;
use crate::events::EventBus;
use crate::housekeeping::Housekeeper;
use crate::ingest::IngestionEngine;
use crate::quota::QuotaLedger;
use crate::sessions::UploadSessionManager;
use crate::source::{FsSourceResolver, SourceResolver};
use keepsake_core::config::AppConfig;
use keepsake_metadata::MetadataStore;
use keepsake_storage::ObjectStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object storage backend.
    pub storage: Arc<dyn ObjectStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    pub events: EventBus,
    pub ledger: Arc<QuotaLedger>,
    pub engine: Arc<IngestionEngine>,
    pub sessions: Arc<UploadSessionManager>,
    pub coordinator: Arc<ImportCoordinator>,
}

impl AppState {
    /// Wire up every component, reading directory scans from the local
    /// filesystem.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let resolver = Arc::new(FsSourceResolver::new(config.imports.scan_root.clone()));
        Self::with_source_resolver(config, storage, metadata, resolver)
    }

    /// Like [`AppState::new`] with a custom source for directory scans.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn with_source_resolver(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        resolver: Arc<dyn SourceResolver>,
    ) -> Self {
        if let Err(error) = config.validate() {
            panic!("Invalid configuration: {}", error);
        }

        let events = EventBus::new();
        let ledger = Arc::new(QuotaLedger::new(
            metadata.clone(),
            config.quota.default_limit_bytes,
        ));
        let engine = Arc::new(IngestionEngine::new(
            storage.clone(),
            metadata.clone(),
            ledger.clone(),
            events.clone(),
        ));
        let coordinator = ImportCoordinator::new(
            config.imports.clone(),
            storage.clone(),
            metadata.clone(),
            engine.clone(),
            resolver,
        );
        let sessions = Arc::new(UploadSessionManager::new(
            config.uploads.clone(),
            storage.clone(),
            metadata.clone(),
            ledger.clone(),
            coordinator.dispatcher(),
        ));

        Self {
            config: Arc::new(config),
            storage,
            metadata,
            events,
            ledger,
            engine,
            sessions,
            coordinator,
        }
    }

    /// Housekeeper over this state's sessions and stores.
    pub fn housekeeper(&self) -> Housekeeper {
        Housekeeper::new(
            self.config.housekeeping.clone(),
            self.sessions.clone(),
            self.storage.clone(),
            self.metadata.clone(),
        )
    }
}
