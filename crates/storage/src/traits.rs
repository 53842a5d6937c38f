//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Object store abstraction for staged and durable content.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's size without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Start a streaming upload. Nothing is visible under `key` until
    /// [`StreamingUpload::finish`] succeeds.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List objects with a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Copy an object.
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Move an object to a new key, replacing any object already there.
    ///
    /// The default implementation copies then deletes the source. Backends
    /// with a native atomic rename should override it.
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.copy(from, to).await?;
        match self.delete(from).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "filesystem").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called at startup and by the health endpoint. The default
    /// implementation returns Ok(()).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
