//! Per-user quota ledger.
//!
//! Durable `used_bytes` and `limit_bytes` live in the metadata store; live
//! reservations are process-local. Every mutation for one user runs under
//! that user's mutex, so `used + reserved <= limit` holds at every point a
//! caller can observe. Users never contend with each other. Dropping a
//! reservation releases its hold without taking the lock.

use crate::error::{IngestError, IngestResult};
use crate::metrics;
use dashmap::DashMap;
use keepsake_core::{ObjectRecord, QuotaAccount, QuotaUsage, UserId};
use keepsake_metadata::models::{ObjectRow, to_i64};
use keepsake_metadata::repos::{ObjectRepo, QuotaRepo};
use keepsake_metadata::{MetadataError, MetadataStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Live holds of one account, keyed by reservation id.
type Holds = Arc<DashMap<u64, u64>>;

/// Bytes held against a user's quota until committed or released.
///
/// Consumed by [`QuotaLedger::commit`], [`QuotaLedger::commit_object`] or
/// [`QuotaLedger::release`]. Dropping it unconsumed releases the hold.
#[must_use = "a reservation holds quota until committed or released"]
#[derive(Debug)]
pub struct Reservation {
    id: u64,
    user_id: UserId,
    bytes: u64,
    holds: Holds,
}

impl Reservation {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // Removing a hold only lowers the reserved total, so it is safe
        // without the account lock.
        self.holds.remove(&self.id);
    }
}

#[derive(Debug)]
struct AccountState {
    limit: u64,
    used: u64,
    reservations: Holds,
}

impl AccountState {
    fn reserved(&self) -> u64 {
        self.reservations.iter().map(|hold| *hold.value()).sum()
    }

    fn available(&self) -> u64 {
        self.limit
            .saturating_sub(self.used.saturating_add(self.reserved()))
    }

    fn usage(&self) -> QuotaUsage {
        QuotaUsage {
            quota: self.limit,
            used_quota: self.used,
        }
    }
}

type AccountSlot = Arc<Mutex<Option<AccountState>>>;

/// Quota ledger with per-user serialization.
pub struct QuotaLedger {
    metadata: Arc<dyn MetadataStore>,
    default_limit: u64,
    accounts: DashMap<UserId, AccountSlot>,
    next_reservation: AtomicU64,
}

impl QuotaLedger {
    pub fn new(metadata: Arc<dyn MetadataStore>, default_limit: u64) -> Self {
        Self {
            metadata,
            default_limit,
            accounts: DashMap::new(),
            next_reservation: AtomicU64::new(1),
        }
    }

    /// Lock a user's account, loading (or provisioning) it on first use.
    async fn lock(&self, user_id: UserId) -> IngestResult<OwnedMutexGuard<Option<AccountState>>> {
        // Clone the slot out so no DashMap shard lock is held across an await
        let slot = self.accounts.entry(user_id).or_default().clone();
        let mut guard = slot.lock_owned().await;

        if guard.is_none() {
            let row = self
                .metadata
                .ensure_account(
                    user_id.into_uuid(),
                    to_i64(self.default_limit, "default_limit")?,
                    OffsetDateTime::now_utc(),
                )
                .await?;
            let account = QuotaAccount::try_from(row)?;
            *guard = Some(AccountState {
                limit: account.limit_bytes,
                used: account.used_bytes,
                reservations: Holds::default(),
            });
        }
        Ok(guard)
    }

    fn state(guard: &mut OwnedMutexGuard<Option<AccountState>>) -> IngestResult<&mut AccountState> {
        guard
            .as_mut()
            .ok_or_else(|| IngestError::Internal("quota account not loaded".to_string()))
    }

    /// Create an account with an explicit limit.
    ///
    /// Fails with `ValidationError` if the user already has an account.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn create_account(&self, user_id: UserId, limit: u64) -> IngestResult<QuotaUsage> {
        let slot = self.accounts.entry(user_id).or_default().clone();
        let mut guard = slot.lock_owned().await;

        if guard.is_some() || self.metadata.get_account(user_id.into_uuid()).await?.is_some() {
            return Err(IngestError::ValidationError(format!(
                "quota account for {user_id} already exists"
            )));
        }

        let row = self
            .metadata
            .ensure_account(
                user_id.into_uuid(),
                to_i64(limit, "limit")?,
                OffsetDateTime::now_utc(),
            )
            .await?;
        let account = QuotaAccount::try_from(row)?;
        let state = AccountState {
            limit: account.limit_bytes,
            used: account.used_bytes,
            reservations: Holds::default(),
        };
        let usage = state.usage();
        *guard = Some(state);
        tracing::info!(limit, "quota account created");
        Ok(usage)
    }

    /// Hold `bytes` against the user's quota.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn reserve(&self, user_id: UserId, bytes: u64) -> IngestResult<Reservation> {
        let mut guard = self.lock(user_id).await?;
        let state = Self::state(&mut guard)?;

        let fits = state
            .used
            .checked_add(state.reserved())
            .and_then(|v| v.checked_add(bytes))
            .is_some_and(|total| total <= state.limit);
        if !fits {
            metrics::QUOTA_REJECTIONS.inc();
            return Err(IngestError::QuotaExceeded {
                requested: bytes,
                available: state.available(),
            });
        }

        let id = self.next_reservation.fetch_add(1, Ordering::Relaxed);
        state.reservations.insert(id, bytes);
        Ok(Reservation {
            id,
            user_id,
            bytes,
            holds: Arc::clone(&state.reservations),
        })
    }

    /// Turn a reservation into permanent usage.
    ///
    /// On failure the reservation is released.
    #[tracing::instrument(skip(self), fields(user_id = %reservation.user_id, bytes = reservation.bytes))]
    pub async fn commit(&self, reservation: Reservation) -> IngestResult<()> {
        let mut guard = self.lock(reservation.user_id).await?;
        let state = Self::state(&mut guard)?;
        if state.reservations.remove(&reservation.id).is_none() {
            return Err(IngestError::Internal(format!(
                "reservation {} is not live",
                reservation.id
            )));
        }

        self.metadata
            .add_used_bytes(
                reservation.user_id.into_uuid(),
                to_i64(reservation.bytes, "bytes")?,
                OffsetDateTime::now_utc(),
            )
            .await?;
        state.used += reservation.bytes;
        Ok(())
    }

    /// Catalog `record` and commit its reservation in one metadata transaction.
    ///
    /// The reservation is consumed either way. An `AlreadyExists` metadata
    /// error means another ingest of the same content won the race.
    #[tracing::instrument(skip(self, record), fields(user_id = %reservation.user_id, fingerprint = %record.fingerprint))]
    pub async fn commit_object(
        &self,
        reservation: Reservation,
        record: &ObjectRecord,
    ) -> IngestResult<()> {
        if record.owner != reservation.user_id || record.size_bytes != reservation.bytes {
            self.release(reservation);
            return Err(IngestError::Internal(
                "reservation does not match the object being committed".to_string(),
            ));
        }

        let mut guard = self.lock(reservation.user_id).await?;
        let state = Self::state(&mut guard)?;
        if state.reservations.remove(&reservation.id).is_none() {
            return Err(IngestError::Internal(format!(
                "reservation {} is not live",
                reservation.id
            )));
        }

        let row = ObjectRow::try_from(record)?;
        match self.metadata.record_object(&row).await {
            Ok(()) => {
                state.used += record.size_bytes;
                Ok(())
            }
            Err(MetadataError::Constraint(_)) => {
                // Durable usage moved underneath us; resync so later
                // reservations see the real figure.
                if let Some(row) = self.metadata.get_account(reservation.user_id.into_uuid()).await? {
                    let account = QuotaAccount::try_from(row)?;
                    state.used = account.used_bytes;
                    state.limit = account.limit_bytes;
                }
                Err(IngestError::QuotaExceeded {
                    requested: record.size_bytes,
                    available: state.available(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel a reservation. Usage is untouched.
    pub fn release(&self, reservation: Reservation) {
        reservation.holds.remove(&reservation.id);
    }

    /// Change a user's limit.
    ///
    /// Fails with `ValidationError` when the new limit is below what is
    /// already used plus what is currently reserved.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn adjust_limit(&self, user_id: UserId, new_limit: u64) -> IngestResult<QuotaUsage> {
        let mut guard = self.lock(user_id).await?;
        let state = Self::state(&mut guard)?;

        let floor = state.used.saturating_add(state.reserved());
        if new_limit < floor {
            return Err(IngestError::ValidationError(format!(
                "new limit {new_limit} is below current usage {} (+{} reserved)",
                state.used,
                state.reserved()
            )));
        }

        self.metadata
            .set_limit(
                user_id.into_uuid(),
                to_i64(new_limit, "limit")?,
                OffsetDateTime::now_utc(),
            )
            .await?;
        state.limit = new_limit;
        tracing::info!(new_limit, "quota limit adjusted");
        Ok(state.usage())
    }

    /// Current `{quota, usedQuota}` for a user.
    pub async fn usage(&self, user_id: UserId) -> IngestResult<QuotaUsage> {
        let mut guard = self.lock(user_id).await?;
        Ok(Self::state(&mut guard)?.usage())
    }

    /// Bytes the user can still reserve right now.
    pub async fn available(&self, user_id: UserId) -> IngestResult<u64> {
        let mut guard = self.lock(user_id).await?;
        Ok(Self::state(&mut guard)?.available())
    }

    /// Bytes held by live reservations.
    pub async fn reserved(&self, user_id: UserId) -> IngestResult<u64> {
        let mut guard = self.lock(user_id).await?;
        Ok(Self::state(&mut guard)?.reserved())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepsake_core::{ContentHash, MediaKind};
    use keepsake_metadata::SqliteStore;

    async fn ledger(default_limit: u64) -> (tempfile::TempDir, Arc<QuotaLedger>) {
        let dir = tempfile::tempdir().unwrap();
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::new(dir.path().join("meta.db")).await.unwrap());
        (dir, Arc::new(QuotaLedger::new(metadata, default_limit)))
    }

    #[tokio::test]
    async fn test_accounts_provisioned_with_default_limit() {
        let (_dir, ledger) = ledger(1000).await;
        let usage = ledger.usage(UserId::new()).await.unwrap();
        assert_eq!(usage, QuotaUsage { quota: 1000, used_quota: 0 });
    }

    #[tokio::test]
    async fn test_create_account_twice_fails() {
        let (_dir, ledger) = ledger(1000).await;
        let user = UserId::new();
        ledger.create_account(user, 50).await.unwrap();
        assert!(matches!(
            ledger.create_account(user, 60).await,
            Err(IngestError::ValidationError(_))
        ));
        assert_eq!(ledger.usage(user).await.unwrap().quota, 50);
    }

    #[tokio::test]
    async fn test_reserve_counts_live_reservations() {
        let (_dir, ledger) = ledger(1000).await;
        let user = UserId::new();

        let a = ledger.reserve(user, 600).await.unwrap();
        match ledger.reserve(user, 500).await {
            Err(IngestError::QuotaExceeded { requested, available }) => {
                assert_eq!(requested, 500);
                assert_eq!(available, 400);
            }
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }

        ledger.release(a);
        let b = ledger.reserve(user, 500).await.unwrap();
        ledger.commit(b).await.unwrap();
        assert_eq!(ledger.usage(user).await.unwrap().used_quota, 500);
        assert_eq!(ledger.reserved(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_overcommit() {
        let (_dir, ledger) = ledger(1000).await;
        let user = UserId::new();

        let mut handles = Vec::new();
        for i in 0..40u64 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                match ledger.reserve(user, 100).await {
                    Ok(res) if i % 2 == 0 => ledger.commit(res).await.map(|_| true),
                    Ok(res) => {
                        ledger.release(res);
                        Ok(false)
                    }
                    Err(IngestError::QuotaExceeded { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let usage = ledger.usage(user).await.unwrap();
        assert!(usage.used_quota <= usage.quota);
        assert_eq!(usage.used_quota % 100, 0);
        assert_eq!(ledger.reserved(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_adjust_limit_floor() {
        let (_dir, ledger) = ledger(1000).await;
        let user = UserId::new();
        let res = ledger.reserve(user, 300).await.unwrap();
        ledger.commit(res).await.unwrap();

        assert!(matches!(
            ledger.adjust_limit(user, 299).await,
            Err(IngestError::ValidationError(_))
        ));
        let usage = ledger.adjust_limit(user, 300).await.unwrap();
        assert_eq!(usage, QuotaUsage { quota: 300, used_quota: 300 });
        assert_eq!(ledger.usage(user).await.unwrap().quota, 300);
    }

    #[tokio::test]
    async fn test_adjust_limit_respects_live_reservations() {
        let (_dir, ledger) = ledger(1000).await;
        let user = UserId::new();
        let res = ledger.reserve(user, 400).await.unwrap();

        assert!(ledger.adjust_limit(user, 399).await.is_err());
        ledger.release(res);
        ledger.adjust_limit(user, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_reservation_releases_hold() {
        let (_dir, ledger) = ledger(1000).await;
        let user = UserId::new();

        let held = ledger.reserve(user, 700).await.unwrap();
        drop(held);
        assert_eq!(ledger.reserved(user).await.unwrap(), 0);

        // A task that dies holding a reservation gives it back.
        let task_ledger = ledger.clone();
        let result = tokio::spawn(async move {
            let _held = task_ledger.reserve(user, 900).await.unwrap();
            panic!("ingest task died");
        })
        .await;
        assert!(result.unwrap_err().is_panic());

        assert_eq!(ledger.reserved(user).await.unwrap(), 0);
        assert_eq!(ledger.available(user).await.unwrap(), 1000);
        let res = ledger.reserve(user, 1000).await.unwrap();
        ledger.commit(res).await.unwrap();
        assert_eq!(ledger.usage(user).await.unwrap().used_quota, 1000);
    }

    #[tokio::test]
    async fn test_commit_object_duplicate_releases_reservation() {
        let (_dir, ledger) = ledger(1000).await;
        let user = UserId::new();
        let hash = ContentHash::compute(b"same bytes");

        let first = ObjectRecord::new(user, hash, 10, MediaKind::Image, None);
        let res = ledger.reserve(user, 10).await.unwrap();
        ledger.commit_object(res, &first).await.unwrap();

        let second = ObjectRecord::new(user, hash, 10, MediaKind::Image, None);
        let res = ledger.reserve(user, 10).await.unwrap();
        let err = ledger.commit_object(res, &second).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Metadata(MetadataError::AlreadyExists(_))
        ));

        assert_eq!(ledger.usage(user).await.unwrap().used_quota, 10);
        assert_eq!(ledger.reserved(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_usage_survives_new_ledger_instance() {
        let dir = tempfile::tempdir().unwrap();
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::new(dir.path().join("meta.db")).await.unwrap());
        let user = UserId::new();

        let ledger = QuotaLedger::new(metadata.clone(), 1000);
        let res = ledger.reserve(user, 250).await.unwrap();
        ledger.commit(res).await.unwrap();

        let restarted = QuotaLedger::new(metadata, 1000);
        assert_eq!(restarted.usage(user).await.unwrap().used_quota, 250);
    }
}
