//! Integration tests for import jobs: directory scans, per-file failures,
//! retries, crash recovery and housekeeping.

mod common;

use async_trait::async_trait;
use common::fixtures::{seeded_bytes, write_file};
use common::{FlakyStore, TestServer, TestServerOptions};
use keepsake_core::{ImportJob, ImportRequest, JobStatus, UserId};
use keepsake_metadata::models::ImportJobRow;
use keepsake_metadata::repos::JobRepo;
use keepsake_server::source::EntryStream;
use keepsake_server::{
    ContentStream, FsSourceResolver, IngestError, IngestOutcome, IngestRequest, IngestResult,
    ScanEntry, ScanSource, SourceResolver, content_from_bytes,
};
use keepsake_storage::{ObjectStore, keys};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use time::OffsetDateTime;

fn scan_request(server: &TestServer, owner: UserId) -> ImportRequest {
    ImportRequest::DirectoryScan {
        owner,
        root: server.scan_dir.clone(),
    }
}

/// Resolves like the filesystem resolver, but every source wraps its inner
/// source so tests can inject failures.
struct WrappingResolver<F> {
    inner: FsSourceResolver,
    wrap: F,
}

#[async_trait]
impl<F> SourceResolver for WrappingResolver<F>
where
    F: Fn(Arc<dyn ScanSource>) -> Arc<dyn ScanSource> + Send + Sync,
{
    async fn resolve(&self, source_ref: &str) -> IngestResult<Arc<dyn ScanSource>> {
        let source = self.inner.resolve(source_ref).await?;
        Ok((self.wrap)(source))
    }
}

/// Fails to open any entry whose path mentions "corrupt".
struct CorruptSource {
    inner: Arc<dyn ScanSource>,
}

#[async_trait]
impl ScanSource for CorruptSource {
    fn entries(&self) -> EntryStream {
        self.inner.entries()
    }

    async fn open(&self, entry: &ScanEntry) -> std::io::Result<ContentStream> {
        if entry.path.contains("corrupt") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "truncated file",
            ));
        }
        self.inner.open(entry).await
    }
}

/// Panics on the first open across all instances sharing `opens`.
struct PanicOnceSource {
    inner: Arc<dyn ScanSource>,
    opens: Arc<AtomicU32>,
}

#[async_trait]
impl ScanSource for PanicOnceSource {
    fn entries(&self) -> EntryStream {
        self.inner.entries()
    }

    async fn open(&self, entry: &ScanEntry) -> std::io::Result<ContentStream> {
        if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("source blew up opening {}", entry.path);
        }
        self.inner.open(entry).await
    }
}

#[tokio::test]
async fn test_directory_import_dedups_and_enforces_quota() {
    let server = TestServer::with_config(|config| config.quota.default_limit_bytes = 1000).await;
    let owner = UserId::new();
    let photo = seeded_bytes(1, 600);
    write_file(&server.scan_dir, "a.jpg", &photo);
    write_file(&server.scan_dir, "b.jpg", &photo);
    write_file(&server.scan_dir, "c.jpg", &seeded_bytes(2, 500));

    let job_id = server
        .state
        .coordinator
        .enqueue(scan_request(&server, owner))
        .await
        .unwrap();
    let progress = server.wait_for_job(job_id).await;

    assert_eq!(progress.status, JobStatus::Completed);
    assert!(progress.enumeration_complete);
    assert_eq!(progress.counters.total_files, 3);
    assert_eq!(progress.counters.processed_files, 3);
    assert_eq!(progress.counters.stored_files, 1);
    assert_eq!(progress.counters.duplicate_files, 1);
    assert_eq!(progress.errors.len(), 1);
    assert_eq!(progress.errors[0].path, "c.jpg");
    assert_eq!(progress.errors[0].code, "quota_exceeded");

    let usage = server.state.ledger.usage(owner).await.unwrap();
    assert_eq!(usage.quota, 1000);
    assert_eq!(usage.used_quota, 600);
    assert_eq!(server.state.ledger.reserved(owner).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unreadable_file_does_not_abort_job() {
    let resolver = WrappingResolver {
        inner: FsSourceResolver::new(None),
        wrap: |inner: Arc<dyn ScanSource>| -> Arc<dyn ScanSource> {
            Arc::new(CorruptSource { inner })
        },
    };
    let server = TestServer::build(
        |_| {},
        TestServerOptions {
            resolver: Some(Arc::new(resolver)),
            ..Default::default()
        },
    )
    .await;
    let owner = UserId::new();
    write_file(&server.scan_dir, "one.jpg", &seeded_bytes(1, 100));
    write_file(&server.scan_dir, "two_corrupt.jpg", &seeded_bytes(2, 100));
    write_file(&server.scan_dir, "trip/three.mov", &seeded_bytes(3, 100));

    let job_id = server
        .state
        .coordinator
        .enqueue(scan_request(&server, owner))
        .await
        .unwrap();
    let progress = server.wait_for_job(job_id).await;

    assert_eq!(progress.status, JobStatus::Completed);
    assert_eq!(progress.counters.total_files, 3);
    assert_eq!(progress.counters.processed_files, 3);
    assert_eq!(progress.counters.stored_files, 2);
    assert_eq!(progress.errors.len(), 1);
    assert_eq!(progress.errors[0].path, "two_corrupt.jpg");
    assert_eq!(progress.errors[0].code, "unreadable");
    assert_eq!(server.state.ledger.usage(owner).await.unwrap().used_quota, 200);

    // Errors survive in the store once the live snapshot is gone.
    let errors = server
        .metadata()
        .get_job_errors(job_id.into_uuid())
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let flaky: Arc<std::sync::Mutex<Option<Arc<FlakyStore>>>> = Default::default();
    let slot = flaky.clone();
    let server = TestServer::build(
        |config| config.imports.item_retry_attempts = 3,
        TestServerOptions {
            wrap_storage: Some(Box::new(move |inner: Arc<dyn ObjectStore>| {
                let store = Arc::new(FlakyStore::new(inner, 2));
                *slot.lock().unwrap() = Some(store.clone());
                store as Arc<dyn ObjectStore>
            })),
            ..Default::default()
        },
    )
    .await;
    let owner = UserId::new();
    write_file(&server.scan_dir, "a.jpg", &seeded_bytes(1, 100));
    write_file(&server.scan_dir, "b.jpg", &seeded_bytes(2, 100));

    let job_id = server
        .state
        .coordinator
        .enqueue(scan_request(&server, owner))
        .await
        .unwrap();
    let progress = server.wait_for_job(job_id).await;

    assert_eq!(progress.status, JobStatus::Completed);
    assert_eq!(progress.counters.stored_files, 2);
    assert!(progress.errors.is_empty(), "{:?}", progress.errors);
    let store = flaky.lock().unwrap().clone().unwrap();
    assert_eq!(store.remaining_failures(), 0);
    assert!(
        server
            .storage()
            .list(keys::STAGING_PREFIX)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_exhausted_item_retries_recorded_as_error() {
    let server = TestServer::build(
        |config| config.imports.item_retry_attempts = 2,
        TestServerOptions {
            wrap_storage: Some(Box::new(|inner: Arc<dyn ObjectStore>| {
                Arc::new(FlakyStore::new(inner, 2)) as Arc<dyn ObjectStore>
            })),
            ..Default::default()
        },
    )
    .await;
    let owner = UserId::new();
    write_file(&server.scan_dir, "a.jpg", &seeded_bytes(1, 100));
    write_file(&server.scan_dir, "b.jpg", &seeded_bytes(2, 100));

    let job_id = server
        .state
        .coordinator
        .enqueue(scan_request(&server, owner))
        .await
        .unwrap();
    let progress = server.wait_for_job(job_id).await;

    assert_eq!(progress.status, JobStatus::Completed);
    assert_eq!(progress.counters.processed_files, 2);
    assert_eq!(progress.counters.stored_files, 1);
    assert_eq!(progress.errors.len(), 1);
    assert_eq!(progress.errors[0].path, "a.jpg");
    assert_eq!(progress.errors[0].code, "storage_write_failure");
    assert_eq!(server.state.ledger.usage(owner).await.unwrap().used_quota, 100);
}

#[tokio::test]
async fn test_orphaned_job_resumes_without_double_charge() {
    let server = TestServer::build(
        |_| {},
        TestServerOptions {
            defer_start: true,
            ..Default::default()
        },
    )
    .await;
    let owner = UserId::new();
    let first = seeded_bytes(1, 100);
    write_file(&server.scan_dir, "a.jpg", &first);
    write_file(&server.scan_dir, "b.jpg", &seeded_bytes(2, 200));

    // The previous process stored a.jpg and died mid-job.
    let mut request = IngestRequest::new(owner, 100);
    request.filename = Some("a.jpg".to_string());
    let outcome = server
        .state
        .engine
        .ingest(request, content_from_bytes(first))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Stored(_)));

    let job = ImportJob::for_scan(owner, server.scan_dir.to_string_lossy());
    let metadata = server.metadata();
    metadata
        .create_job(&ImportJobRow::try_from(&job).unwrap())
        .await
        .unwrap();
    assert!(
        metadata
            .start_job(job.id.into_uuid(), OffsetDateTime::now_utc())
            .await
            .unwrap()
    );

    server.state.coordinator.start().await.unwrap();
    let report = server.state.coordinator.recover_orphaned_jobs().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.failed, 0);

    let progress = server.wait_for_job(job.id).await;
    assert_eq!(progress.status, JobStatus::Completed);
    assert_eq!(progress.counters.stored_files, 1);
    assert_eq!(progress.counters.duplicate_files, 1);
    assert!(progress.errors.is_empty());
    assert_eq!(server.state.ledger.usage(owner).await.unwrap().used_quota, 300);

    let row = metadata.get_job(job.id.into_uuid()).await.unwrap().unwrap();
    assert_eq!(row.attempts, 2);
}

#[tokio::test]
async fn test_orphaned_job_out_of_attempts_fails() {
    let server = TestServer::build(
        |config| config.imports.max_attempts = 1,
        TestServerOptions {
            defer_start: true,
            ..Default::default()
        },
    )
    .await;
    let owner = UserId::new();
    let job = ImportJob::for_scan(owner, server.scan_dir.to_string_lossy());
    let metadata = server.metadata();
    metadata
        .create_job(&ImportJobRow::try_from(&job).unwrap())
        .await
        .unwrap();
    metadata
        .start_job(job.id.into_uuid(), OffsetDateTime::now_utc())
        .await
        .unwrap();

    let report = server.state.coordinator.recover_orphaned_jobs().await.unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(report.failed, 1);

    let progress = server.state.coordinator.get_progress(job.id).await.unwrap();
    assert_eq!(progress.status, JobStatus::Failed);
    assert_eq!(progress.errors.len(), 1);
    assert_eq!(progress.errors[0].code, "attempts_exhausted");
}

#[tokio::test]
async fn test_panicked_job_is_requeued_by_watchdog() {
    let opens = Arc::new(AtomicU32::new(0));
    let shared = opens.clone();
    let resolver = WrappingResolver {
        inner: FsSourceResolver::new(None),
        wrap: move |inner: Arc<dyn ScanSource>| -> Arc<dyn ScanSource> {
            Arc::new(PanicOnceSource {
                inner,
                opens: shared.clone(),
            })
        },
    };
    let server = TestServer::build(
        |_| {},
        TestServerOptions {
            resolver: Some(Arc::new(resolver)),
            ..Default::default()
        },
    )
    .await;
    let owner = UserId::new();
    write_file(&server.scan_dir, "a.jpg", &seeded_bytes(1, 100));

    let coordinator = server.state.coordinator.clone();
    let job_id = coordinator
        .enqueue(scan_request(&server, owner))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while coordinator.check_tasks().await == 0 {
        assert!(tokio::time::Instant::now() < deadline, "panic never observed");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let progress = server.wait_for_job(job_id).await;
    assert_eq!(progress.status, JobStatus::Completed);
    assert_eq!(progress.counters.stored_files, 1);
    assert!(progress.errors.is_empty());
    assert_eq!(opens.load(Ordering::SeqCst), 2);

    let row = server
        .metadata()
        .get_job(job_id.into_uuid())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.attempts, 2);
}

#[tokio::test]
async fn test_jobs_of_one_user_share_quota_and_dedup() {
    let server = TestServer::new().await;
    let owner = UserId::new();
    write_file(&server.scan_dir, "a.jpg", &seeded_bytes(1, 100));

    let coordinator = &server.state.coordinator;
    let first = coordinator
        .enqueue(scan_request(&server, owner))
        .await
        .unwrap();
    let second = coordinator
        .enqueue(scan_request(&server, owner))
        .await
        .unwrap();
    assert_ne!(first, second);

    let a = server.wait_for_job(first).await;
    let b = server.wait_for_job(second).await;
    assert_eq!(a.counters.stored_files + b.counters.stored_files, 1);
    assert_eq!(a.counters.duplicate_files + b.counters.duplicate_files, 1);
    assert_eq!(server.state.ledger.usage(owner).await.unwrap().used_quota, 100);
}

#[tokio::test]
async fn test_enqueue_rejects_missing_root() {
    let server = TestServer::new().await;
    let err = server
        .state
        .coordinator
        .enqueue(ImportRequest::DirectoryScan {
            owner: UserId::new(),
            root: server.scan_dir.join("nope"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::ValidationError(_)));
}

#[tokio::test]
async fn test_enqueue_after_shutdown_refused() {
    let server = TestServer::new().await;
    server.state.coordinator.shutdown().await;

    let err = server
        .state
        .coordinator
        .enqueue(scan_request(&server, UserId::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::ShuttingDown));
}

#[tokio::test]
async fn test_housekeeping_sweeps_stale_staging_and_old_jobs() {
    let server = TestServer::new().await;
    let owner = UserId::new();
    write_file(&server.scan_dir, "a.jpg", &seeded_bytes(1, 10));
    let job_id = server
        .state
        .coordinator
        .enqueue(scan_request(&server, owner))
        .await
        .unwrap();
    server.wait_for_job(job_id).await;

    let abandoned = keys::staging_key();
    server
        .storage()
        .put(&abandoned, seeded_bytes(9, 10))
        .await
        .unwrap();

    let housekeeper = server.state.housekeeper();
    let now = OffsetDateTime::now_utc();
    let report = housekeeper.run_once(now).await.unwrap();
    assert_eq!(report.staging_swept, 0);
    assert_eq!(report.jobs_purged, 0);
    assert!(server.storage().exists(&abandoned).await.unwrap());

    let report = housekeeper
        .run_once(now + time::Duration::days(8))
        .await
        .unwrap();
    assert_eq!(report.staging_swept, 1);
    assert_eq!(report.jobs_purged, 1);
    assert!(!server.storage().exists(&abandoned).await.unwrap());

    let err = server
        .state
        .coordinator
        .get_progress(job_id)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::NotFound(_)));
}
