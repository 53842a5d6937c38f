//! Object catalog repository.

use crate::error::MetadataResult;
use crate::models::ObjectRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for catalogued objects.
#[async_trait]
pub trait ObjectRepo: Send + Sync {
    /// Look up an owner's object by fingerprint.
    async fn get_object(
        &self,
        owner_user_id: Uuid,
        fingerprint: &str,
    ) -> MetadataResult<Option<ObjectRow>>;

    /// Catalog an object and charge its size to the owner's quota account.
    ///
    /// Both writes share one transaction. Fails with `AlreadyExists` when the
    /// owner already has an object with this fingerprint, and with
    /// `Constraint` when the charge would exceed the account limit.
    async fn record_object(&self, object: &ObjectRow) -> MetadataResult<()>;

    /// Number of objects an owner has.
    async fn count_objects(&self, owner_user_id: Uuid) -> MetadataResult<u64>;
}
