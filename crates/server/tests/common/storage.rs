//! Storage test utilities.

use async_trait::async_trait;
use bytes::Bytes;
use keepsake_storage::{
    ByteStream, FilesystemBackend, ObjectMeta, ObjectStore, StorageError, StorageResult,
    StreamingUpload,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// A test storage wrapper that cleans up on drop.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestStorage {
    pub backend: Arc<dyn ObjectStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestStorage {
    /// Create a new test storage with a temporary directory.
    pub async fn new() -> StorageResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let backend = FilesystemBackend::new(temp_dir.path()).await?;

        Ok(Self {
            backend: Arc::new(backend),
            _temp_dir: temp_dir,
        })
    }

    /// Get a reference to the object store.
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.backend.clone()
    }
}

/// Object store whose next `failures` streaming writes fail before any byte
/// is accepted. Everything else goes to the inner store.
#[allow(dead_code)]
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    failures: AtomicU32,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn new(inner: Arc<dyn ObjectStore>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }

    /// Injected failures not yet consumed.
    pub fn remaining_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        if self.take_failure() {
            return Err(StorageError::Io(std::io::Error::other(
                "injected write failure",
            )));
        }
        self.inner.put_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        self.inner.copy(from, to).await
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.inner.rename(from, to).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// Object store whose renames wait until `parties` of them have arrived.
///
/// Lets a test line up two ingests so both are past their catalog lookup
/// before either commits.
#[allow(dead_code)]
pub struct GatedRenameStore {
    inner: Arc<dyn ObjectStore>,
    gate: tokio::sync::Barrier,
}

#[allow(dead_code)]
impl GatedRenameStore {
    pub fn new(inner: Arc<dyn ObjectStore>, parties: usize) -> Self {
        Self {
            inner,
            gate: tokio::sync::Barrier::new(parties),
        }
    }
}

#[async_trait]
impl ObjectStore for GatedRenameStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.inner.put_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        self.inner.copy(from, to).await
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.gate.wait().await;
        self.inner.rename(from, to).await
    }

    fn backend_name(&self) -> &'static str {
        "gated"
    }
}
