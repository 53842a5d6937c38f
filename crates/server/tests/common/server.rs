//! Server test utilities.

use keepsake_core::config::{AppConfig, MetadataConfig, StorageConfig};
use keepsake_core::{ImportProgress, JobId};
use keepsake_metadata::{MetadataStore, SqliteStore};
use keepsake_server::{AppState, SourceResolver, create_router};
use keepsake_storage::{FilesystemBackend, ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    /// Directory tests may fill with files to import.
    pub scan_dir: PathBuf,
    _temp_dir: TempDir,
}

/// Knobs for [`TestServer::build`].
#[allow(dead_code)]
#[derive(Default)]
pub struct TestServerOptions {
    pub wrap_storage: Option<Box<dyn FnOnce(Arc<dyn ObjectStore>) -> Arc<dyn ObjectStore>>>,
    pub resolver: Option<Arc<dyn SourceResolver>>,
    /// Leave the coordinator stopped so tests can stage jobs first.
    pub defer_start: bool,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        Self::build(modifier, TestServerOptions::default()).await
    }

    pub async fn build<F>(modifier: F, options: TestServerOptions) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_path = temp_dir.path().join("storage");
        let inner: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );
        let storage = match options.wrap_storage {
            Some(wrap) => wrap(inner),
            None => inner,
        };

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path)
                .await
                .expect("Failed to create metadata store"),
        );

        let scan_dir = temp_dir.path().join("scan");
        std::fs::create_dir_all(&scan_dir).expect("Failed to create scan directory");

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig::Filesystem { path: storage_path };
        config.metadata = MetadataConfig::Sqlite { path: db_path };
        modifier(&mut config);

        let state = match options.resolver {
            Some(resolver) => AppState::with_source_resolver(config, storage, metadata, resolver),
            None => AppState::new(config, storage, metadata),
        };
        if !options.defer_start {
            state
                .coordinator
                .start()
                .await
                .expect("Failed to start import coordinator");
        }

        let router = create_router(state.clone());

        Self {
            router,
            state,
            scan_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    pub fn storage(&self) -> Arc<dyn ObjectStore> {
        self.state.storage.clone()
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_for_job(&self, job_id: JobId) -> ImportProgress {
        wait_for_job(&self.state, job_id).await
    }
}

/// Poll a job until it is completed or failed, panicking after 10 seconds.
#[allow(dead_code)]
pub async fn wait_for_job(state: &AppState, job_id: JobId) -> ImportProgress {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let progress = state
            .coordinator
            .get_progress(job_id)
            .await
            .expect("Failed to read job progress");
        if progress.status.is_terminal() {
            return progress;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not finish: {progress:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
