//! Integration tests for the SQLite metadata store.

mod common;

use common::TestMetadata;
use keepsake_core::{
    ContentHash, ImportJob, ItemError, JobStatus, MediaKind, ObjectRecord, SessionId,
    UploadMetadata, UploadSession, UserId,
};
use keepsake_metadata::MetadataError;
use keepsake_metadata::models::{ImportJobErrorRow, ImportJobRow, ObjectRow, UploadSessionRow};
use keepsake_metadata::repos::{JobRepo, ObjectRepo, QuotaRepo, SessionRepo};
use time::{Duration, OffsetDateTime};

async fn create_session(metadata: &TestMetadata, declared_size: u64) -> UploadSession {
    let session = UploadSession::new(UserId::new(), declared_size, UploadMetadata::default());
    metadata
        .store()
        .create_session(&UploadSessionRow::try_from(&session).unwrap())
        .await
        .unwrap();
    session
}

fn object_row(owner: UserId, content: &[u8]) -> ObjectRow {
    let record = ObjectRecord::new(
        owner,
        ContentHash::compute(content),
        content.len() as u64,
        MediaKind::Image,
        Some("IMG_0001.jpg".to_string()),
    );
    ObjectRow::try_from(&record).unwrap()
}

#[tokio::test]
async fn test_append_part_compare_and_set() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let session = create_session(&metadata, 100).await;
    let id = session.id.into_uuid();
    let now = OffsetDateTime::now_utc();

    assert!(store.append_part(id, 0, 40, "p0", now).await.unwrap());
    // Same offset again loses.
    assert!(!store.append_part(id, 0, 40, "p0b", now).await.unwrap());
    // Overrunning the declared size loses.
    assert!(!store.append_part(id, 40, 61, "p1", now).await.unwrap());
    assert!(store.append_part(id, 40, 60, "p1", now).await.unwrap());

    let row = store.get_session(id).await.unwrap().unwrap();
    assert_eq!(row.bytes_received, 100);
    assert_eq!(row.state, "in_progress");

    let parts = store.list_parts(id).await.unwrap();
    let keys: Vec<_> = parts.iter().map(|p| p.object_key.as_str()).collect();
    assert_eq!(keys, vec!["p0", "p1"]);

    assert_eq!(store.delete_parts(id).await.unwrap(), 2);
    assert!(store.list_parts(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_complete_session_creates_job_once() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let session = create_session(&metadata, 10).await;
    let id = session.id.into_uuid();
    let now = OffsetDateTime::now_utc();

    // Not fully received yet.
    let job = ImportJob::for_upload(session.owner, session.id);
    let row = ImportJobRow::try_from(&job).unwrap();
    assert!(!store.complete_session(id, &row, now).await.unwrap());
    assert!(store.get_job(job.id.into_uuid()).await.unwrap().is_none());

    assert!(store.append_part(id, 0, 10, "p0", now).await.unwrap());
    assert!(store.complete_session(id, &row, now).await.unwrap());

    let other = ImportJob::for_upload(session.owner, session.id);
    let other_row = ImportJobRow::try_from(&other).unwrap();
    assert!(!store.complete_session(id, &other_row, now).await.unwrap());
    assert!(store.get_job(other.id.into_uuid()).await.unwrap().is_none());

    let session_row = store.get_session(id).await.unwrap().unwrap();
    assert_eq!(session_row.state, "completed");
    assert_eq!(session_row.job_id, Some(job.id.into_uuid()));

    let job_row = store.get_job(job.id.into_uuid()).await.unwrap().unwrap();
    assert_eq!(job_row.status, "queued");
    assert_eq!(job_row.total_files, 1);
}

#[tokio::test]
async fn test_purge_keeps_completed_session_while_job_pending() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let session = create_session(&metadata, 10).await;
    let id = session.id.into_uuid();
    let now = OffsetDateTime::now_utc();
    let later = now + Duration::days(30);

    let job = ImportJob::for_upload(session.owner, session.id);
    let job_id = job.id.into_uuid();
    assert!(store.append_part(id, 0, 10, "p0", now).await.unwrap());
    assert!(
        store
            .complete_session(id, &ImportJobRow::try_from(&job).unwrap(), now)
            .await
            .unwrap()
    );

    // Queued and running jobs still need the session and its parts.
    assert_eq!(store.purge_terminal_sessions(later, 10).await.unwrap(), 0);
    assert!(store.start_job(job_id, now).await.unwrap());
    assert_eq!(store.purge_terminal_sessions(later, 10).await.unwrap(), 0);
    assert_eq!(store.list_parts(id).await.unwrap().len(), 1);

    store
        .finish_job(job_id, JobStatus::Completed.as_str(), now)
        .await
        .unwrap();
    assert_eq!(store.purge_terminal_sessions(later, 10).await.unwrap(), 1);
    assert!(store.get_session(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_transition_session_only_from_listed_states() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let session = create_session(&metadata, 10).await;
    let id = session.id.into_uuid();
    let now = OffsetDateTime::now_utc();
    let open = &["created", "in_progress"];

    assert!(store.transition_session(id, open, "expired", now).await.unwrap());
    assert!(!store.transition_session(id, open, "aborted", now).await.unwrap());
    assert!(!store.transition_session(id, &[], "aborted", now).await.unwrap());
    assert_eq!(
        store.get_session(id).await.unwrap().unwrap().state,
        "expired"
    );
}

#[tokio::test]
async fn test_idle_sessions_and_purge() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let idle = create_session(&metadata, 10).await;
    let now = OffsetDateTime::now_utc();
    let later = now + Duration::hours(2);

    let found = store.get_idle_sessions(later, 10).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].session_id, idle.id.into_uuid());
    assert!(store.get_idle_sessions(now - Duration::hours(1), 10).await.unwrap().is_empty());

    // Open sessions are never purged.
    assert_eq!(store.purge_terminal_sessions(later, 10).await.unwrap(), 0);

    store
        .transition_session(idle.id.into_uuid(), &["created"], "aborted", now)
        .await
        .unwrap();
    assert!(store.get_idle_sessions(later, 10).await.unwrap().is_empty());
    assert_eq!(store.purge_terminal_sessions(later, 10).await.unwrap(), 1);
    assert!(store.get_session(idle.id.into_uuid()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_record_object_rejects_duplicate_fingerprint() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let owner = UserId::new();
    let now = OffsetDateTime::now_utc();
    store
        .ensure_account(owner.into_uuid(), 1000, now)
        .await
        .unwrap();

    let first = object_row(owner, b"holiday");
    store.record_object(&first).await.unwrap();

    let err = store
        .record_object(&object_row(owner, b"holiday"))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::AlreadyExists(_)));

    let account = store.get_account(owner.into_uuid()).await.unwrap().unwrap();
    assert_eq!(account.used_bytes, 7);
    assert_eq!(store.count_objects(owner.into_uuid()).await.unwrap(), 1);

    // Another owner may hold the same content.
    let other = UserId::new();
    store
        .ensure_account(other.into_uuid(), 1000, now)
        .await
        .unwrap();
    store.record_object(&object_row(other, b"holiday")).await.unwrap();

    let found = store
        .get_object(owner.into_uuid(), &first.fingerprint)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.object_id, first.object_id);
}

#[tokio::test]
async fn test_record_object_over_limit_rolls_back() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let owner = UserId::new();
    store
        .ensure_account(owner.into_uuid(), 5, OffsetDateTime::now_utc())
        .await
        .unwrap();

    let row = object_row(owner, b"too large");
    let err = store.record_object(&row).await.unwrap_err();
    assert!(matches!(err, MetadataError::Constraint(_)));

    assert_eq!(store.count_objects(owner.into_uuid()).await.unwrap(), 0);
    assert!(
        store
            .get_object(owner.into_uuid(), &row.fingerprint)
            .await
            .unwrap()
            .is_none()
    );
    let account = store.get_account(owner.into_uuid()).await.unwrap().unwrap();
    assert_eq!(account.used_bytes, 0);
}

#[tokio::test]
async fn test_quota_account_lifecycle() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let user = UserId::new().into_uuid();
    let now = OffsetDateTime::now_utc();

    let err = store.add_used_bytes(user, 1, now).await.unwrap_err();
    assert!(matches!(err, MetadataError::NotFound(_)));

    let account = store.ensure_account(user, 100, now).await.unwrap();
    assert_eq!(account.limit_bytes, 100);
    // A second ensure keeps the existing limit.
    let account = store.ensure_account(user, 999, now).await.unwrap();
    assert_eq!(account.limit_bytes, 100);

    store.add_used_bytes(user, 60, now).await.unwrap();
    let err = store.add_used_bytes(user, 41, now).await.unwrap_err();
    assert!(matches!(err, MetadataError::Constraint(_)));

    store.set_limit(user, 200, now).await.unwrap();
    store.add_used_bytes(user, 41, now).await.unwrap();
    let account = store.get_account(user).await.unwrap().unwrap();
    assert_eq!(account.used_bytes, 101);
    assert_eq!(account.limit_bytes, 200);

    let err = store
        .set_limit(UserId::new().into_uuid(), 1, now)
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::NotFound(_)));
}

#[tokio::test]
async fn test_job_claim_reset_and_orphans() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let job = ImportJob::for_scan(UserId::new(), "/photos");
    let id = job.id.into_uuid();
    let now = OffsetDateTime::now_utc();
    store
        .create_job(&ImportJobRow::try_from(&job).unwrap())
        .await
        .unwrap();

    assert!(store.start_job(id, now).await.unwrap());
    assert!(!store.start_job(id, now).await.unwrap());

    let mut running = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(running.status, "running");
    assert_eq!(running.attempts, 1);

    running.total_files = 4;
    running.processed_files = 2;
    running.stored_files = 2;
    store.update_job_progress(&running).await.unwrap();
    store
        .append_job_error(&ImportJobErrorRow::new(
            job.id,
            &ItemError::new("a.jpg", "unreadable", "truncated"),
        ))
        .await
        .unwrap();

    let orphans = store.get_orphaned_jobs().await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].job_id, id);

    assert!(store.reset_job(id, now).await.unwrap());
    let reset = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(reset.status, "queued");
    assert_eq!(reset.total_files, 0);
    assert_eq!(reset.processed_files, 0);
    assert_eq!(reset.stored_files, 0);
    assert!(!reset.enumeration_complete);
    assert_eq!(reset.attempts, 1);
    assert!(store.get_job_errors(id).await.unwrap().is_empty());

    assert!(store.start_job(id, now).await.unwrap());
    store
        .finish_job(id, JobStatus::Completed.as_str(), now)
        .await
        .unwrap();
    assert!(store.get_orphaned_jobs().await.unwrap().is_empty());
    assert!(!store.reset_job(id, now).await.unwrap());

    let finished = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(finished.attempts, 2);
    assert!(finished.finished_at.is_some());
}

#[tokio::test]
async fn test_purge_finished_jobs_respects_cutoff() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let now = OffsetDateTime::now_utc();

    let done = ImportJob::for_scan(UserId::new(), "/a");
    let pending = ImportJob::for_scan(UserId::new(), "/b");
    for job in [&done, &pending] {
        store
            .create_job(&ImportJobRow::try_from(job).unwrap())
            .await
            .unwrap();
    }
    store.start_job(done.id.into_uuid(), now).await.unwrap();
    store
        .finish_job(done.id.into_uuid(), JobStatus::Failed.as_str(), now)
        .await
        .unwrap();

    assert_eq!(store.purge_finished_jobs(now - Duration::hours(1), 10).await.unwrap(), 0);
    assert_eq!(store.purge_finished_jobs(now + Duration::hours(1), 10).await.unwrap(), 1);
    assert!(store.get_job(done.id.into_uuid()).await.unwrap().is_none());
    assert!(store.get_job(pending.id.into_uuid()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_unknown_session_is_none() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    assert!(
        store
            .get_session(SessionId::new().into_uuid())
            .await
            .unwrap()
            .is_none()
    );

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions")
        .fetch_one(metadata.pool())
        .await
        .unwrap();
    assert_eq!(count, 0);
}
