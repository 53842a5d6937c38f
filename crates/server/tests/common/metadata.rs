//! Metadata store test utilities.

use keepsake_metadata::{MetadataResult, MetadataStore, SqliteStore};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tempfile::TempDir;

/// A test metadata store wrapper that cleans up on drop.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub(crate) sqlite_store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestMetadata {
    /// Create a new test metadata store backed by a temporary SQLite file.
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = Arc::new(SqliteStore::new(&db_path).await?);

        Ok(Self {
            store: store.clone(),
            sqlite_store: store,
            _temp_dir: temp_dir,
        })
    }

    /// Get a reference to the metadata store.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Get a reference to the SQLite connection pool for raw queries.
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}
