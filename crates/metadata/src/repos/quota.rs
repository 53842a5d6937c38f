//! Quota account repository.

use crate::error::MetadataResult;
use crate::models::QuotaAccountRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for per-user quota accounts.
#[async_trait]
pub trait QuotaRepo: Send + Sync {
    /// Get a user's account.
    async fn get_account(&self, user_id: Uuid) -> MetadataResult<Option<QuotaAccountRow>>;

    /// Get a user's account, creating it with `default_limit` if missing.
    async fn ensure_account(
        &self,
        user_id: Uuid,
        default_limit: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<QuotaAccountRow>;

    /// Replace an account's limit. Fails with `NotFound` if there is no account.
    async fn set_limit(
        &self,
        user_id: Uuid,
        limit_bytes: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Charge bytes to an account. Fails with `Constraint` if the charge
    /// would exceed the limit.
    async fn add_used_bytes(
        &self,
        user_id: Uuid,
        bytes: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<()>;
}
