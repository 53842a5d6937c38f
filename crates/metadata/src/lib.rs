//! Catalog and persistence layer for Keepsake.
//!
//! This crate provides the durable state behind ingestion:
//! - Upload sessions and their received parts
//! - The per-user object catalog
//! - Quota accounts
//! - Import jobs and per-file errors

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{MetadataStore, SqliteStore};

use keepsake_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite { path } => {
            let store = SqliteStore::new(path).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
