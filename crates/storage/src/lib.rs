//! Object storage for staged uploads and durable media.
//!
//! This crate provides:
//! - The [`ObjectStore`] abstraction with atomic puts, streaming writes and rename
//! - Key layout for staging areas and upload parts
//! - A local filesystem backend

pub mod backends;
pub mod error;
pub mod keys;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};

use keepsake_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
    }
}
