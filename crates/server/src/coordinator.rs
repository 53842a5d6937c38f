//! Import job coordination.
//!
//! Jobs arrive through a [`JobDispatcher`] and run as tokio tasks. A job first
//! takes one of its owner's slots, then a global worker slot, then claims the
//! job row with a `queued -> running` compare-and-set. Progress is kept as a
//! whole-snapshot per job and checkpointed to the metadata store after every
//! file, so a crash loses at most the file in flight.
//!
//! A file that fails is recorded against the job and the job moves on. Only
//! infrastructure failures (the metadata store, an unreachable source) fail a
//! job outright.

use crate::error::{IngestError, IngestResult};
use crate::ingest::{IngestOutcome, IngestRequest, IngestionEngine};
use crate::metrics;
use crate::sessions;
use crate::source::{ScanEntry, ScanSource, SourceResolver, UploadPartsSource};
use dashmap::DashMap;
use futures::StreamExt;
use keepsake_core::config::ImportConfig;
use keepsake_core::{
    ImportJob, ImportProgress, ImportRequest, ItemError, JobId, JobStatus, SessionId,
    SessionState, SourceKind, UploadSession, UserId,
};
use keepsake_metadata::MetadataStore;
use keepsake_metadata::models::{ImportJobErrorRow, ImportJobRow};
use keepsake_metadata::repos::{JobRepo, SessionRepo};
use keepsake_storage::ObjectStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;

/// Hands job ids to the coordinator's dispatch loop.
#[derive(Clone)]
pub struct JobDispatcher {
    sender: mpsc::UnboundedSender<JobId>,
    closed: Arc<AtomicBool>,
}

impl JobDispatcher {
    /// Queue a job for execution. Dispatching a job twice is harmless: only
    /// one delivery can claim it.
    pub fn dispatch(&self, job_id: JobId) -> IngestResult<()> {
        if self.is_closed() {
            return Err(IngestError::ShuttingDown);
        }
        self.sender
            .send(job_id)
            .map_err(|_| IngestError::ShuttingDown)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Outcome of [`ImportCoordinator::recover_orphaned_jobs`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
}

/// Registry for tracking spawned job tasks and detecting panics.
///
/// A job whose task panics stays `running` in the metadata store. The
/// coordinator's watchdog drains finished handles from here and puts such
/// jobs back in the queue.
struct JobTaskRegistry {
    /// Map of task sequence -> (job, handle). A job may be delivered more
    /// than once, so the job id alone is not a key.
    tasks: Mutex<HashMap<u64, (JobId, JoinHandle<()>)>>,
    next_task: AtomicU64,
}

impl JobTaskRegistry {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_task: AtomicU64::new(0),
        }
    }

    async fn register(&self, job_id: JobId, handle: JoinHandle<()>) {
        let task = self.next_task.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().await.insert(task, (job_id, handle));
    }

    /// Remove finished tasks and return the jobs whose task panicked.
    async fn reap(&self) -> Vec<JobId> {
        let finished: Vec<(JobId, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().await;
            let done: Vec<u64> = tasks
                .iter()
                .filter(|(_, (_, handle))| handle.is_finished())
                .map(|(task, _)| *task)
                .collect();
            done.into_iter()
                .filter_map(|task| tasks.remove(&task))
                .collect()
        };

        let mut panicked = Vec::new();
        for (job_id, handle) in finished {
            match handle.await {
                Ok(()) => {
                    tracing::debug!(job_id = %job_id, "import task completed");
                }
                Err(join_err) if join_err.is_panic() => {
                    tracing::error!(job_id = %job_id, panic = ?join_err, "import task panicked");
                    panicked.push(job_id);
                }
                Err(join_err) if join_err.is_cancelled() => {
                    tracing::warn!(job_id = %job_id, "import task was cancelled");
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = ?e, "import task failed with unknown error");
                }
            }
        }
        panicked
    }

    async fn drain(&self) -> Vec<(JobId, JoinHandle<()>)> {
        self.tasks.lock().await.drain().map(|(_, task)| task).collect()
    }
}

/// Keeps `JOBS_ACTIVE` in step with running jobs, unwinding included.
struct ActiveJob;

impl ActiveJob {
    fn enter() -> Self {
        metrics::JOBS_ACTIVE.inc();
        Self
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        metrics::JOBS_ACTIVE.dec();
    }
}

/// Runs import jobs with bounded concurrency.
pub struct ImportCoordinator {
    config: ImportConfig,
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    engine: Arc<IngestionEngine>,
    resolver: Arc<dyn SourceResolver>,
    dispatcher: JobDispatcher,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
    workers: Arc<Semaphore>,
    user_slots: DashMap<UserId, Arc<Semaphore>>,
    progress: DashMap<JobId, ImportProgress>,
    registry: JobTaskRegistry,
    stop: Notify,
}

impl ImportCoordinator {
    pub fn new(
        config: ImportConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        engine: Arc<IngestionEngine>,
        resolver: Arc<dyn SourceResolver>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let workers = Arc::new(Semaphore::new(config.max_workers));
        Arc::new(Self {
            config,
            storage,
            metadata,
            engine,
            resolver,
            dispatcher: JobDispatcher {
                sender,
                closed: Arc::new(AtomicBool::new(false)),
            },
            receiver: Mutex::new(Some(receiver)),
            workers,
            user_slots: DashMap::new(),
            progress: DashMap::new(),
            registry: JobTaskRegistry::new(),
            stop: Notify::new(),
        })
    }

    pub fn dispatcher(&self) -> JobDispatcher {
        self.dispatcher.clone()
    }

    /// Start the dispatch loop. Can only be called once.
    pub async fn start(self: &Arc<Self>) -> IngestResult<JoinHandle<()>> {
        let mut receiver = self.receiver.lock().await.take().ok_or_else(|| {
            IngestError::Internal("import coordinator already started".to_string())
        })?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.stop.notified() => break,
                    next = receiver.recv() => match next {
                        Some(job_id) if !this.dispatcher.is_closed() => this.spawn_job(job_id).await,
                        _ => break,
                    },
                }
            }
            tracing::debug!("import dispatch loop stopped");
        }))
    }

    /// Spawn the watchdog that requeues jobs whose task panicked.
    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.watchdog_interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                if this.dispatcher.is_closed() {
                    break;
                }
                this.check_tasks().await;
            }
        })
    }

    /// Reap finished job tasks; panicked jobs are requeued or failed.
    /// Returns the number of panicked jobs handled.
    pub async fn check_tasks(&self) -> usize {
        let panicked = self.registry.reap().await;
        for job_id in &panicked {
            metrics::JOBS_PANICKED.inc();
            self.progress.remove(job_id);
            match self.requeue_or_fail(*job_id).await {
                Ok(Some(status)) => {
                    tracing::warn!(job_id = %job_id, status = %status, "panicked import job recovered");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "failed to recover panicked import job");
                }
            }
        }
        panicked.len()
    }

    /// Accept an import request and queue its job.
    ///
    /// A completed upload already has a job from finalization; its id is
    /// returned and no second job is created.
    #[tracing::instrument(skip(self))]
    pub async fn enqueue(&self, request: ImportRequest) -> IngestResult<JobId> {
        if self.dispatcher.is_closed() {
            return Err(IngestError::ShuttingDown);
        }

        match request {
            ImportRequest::CompletedUpload { session_id } => {
                let row = self
                    .metadata
                    .get_session(session_id.into_uuid())
                    .await?
                    .ok_or_else(|| IngestError::NotFound(format!("upload session {session_id}")))?;
                let session = UploadSession::try_from(row)?;
                match session.state {
                    SessionState::Completed => {}
                    SessionState::Aborted | SessionState::Expired => {
                        return Err(IngestError::SessionClosed {
                            state: session.state.to_string(),
                        });
                    }
                    SessionState::Created | SessionState::InProgress => {
                        return Err(IngestError::ValidationError(format!(
                            "upload session {session_id} is not finalized"
                        )));
                    }
                }
                let job_id = session.job_id.ok_or_else(|| {
                    IngestError::Internal(format!("completed session {session_id} has no job"))
                })?;
                if let Some(job) = self.load_job(job_id).await?
                    && job.status == JobStatus::Queued
                {
                    self.dispatcher.dispatch(job_id)?;
                }
                Ok(job_id)
            }
            ImportRequest::DirectoryScan { owner, root } => {
                let source_ref = root.to_string_lossy().into_owned();
                self.resolver.resolve(&source_ref).await?;

                let job = ImportJob::for_scan(owner, source_ref);
                self.metadata
                    .create_job(&ImportJobRow::try_from(&job)?)
                    .await?;
                metrics::JOBS_ENQUEUED.inc();
                tracing::info!(job_id = %job.id, owner = %owner, "directory import queued");

                if let Err(e) = self.dispatcher.dispatch(job.id) {
                    tracing::warn!(job_id = %job.id, error = %e, "import job not dispatched");
                }
                Ok(job.id)
            }
        }
    }

    /// Current progress of a job.
    pub async fn get_progress(&self, job_id: JobId) -> IngestResult<ImportProgress> {
        if let Some(snapshot) = self.progress.get(&job_id).map(|s| s.value().clone()) {
            return Ok(snapshot);
        }
        let job = self
            .load_job(job_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("import job {job_id}")))?;
        Ok(job.progress())
    }

    /// Requeue jobs left `queued` or `running` by a previous process.
    ///
    /// Jobs out of attempts are failed instead. Objects an interrupted job
    /// already stored come back as duplicates on the rerun, so nothing is
    /// charged twice.
    pub async fn recover_orphaned_jobs(&self) -> IngestResult<RecoveryReport> {
        let orphans = self.metadata.get_orphaned_jobs().await?;
        let mut report = RecoveryReport::default();

        for row in orphans {
            let job_id = JobId::from_uuid(row.job_id);
            match self.requeue_or_fail(job_id).await? {
                Some(JobStatus::Failed) => report.failed += 1,
                Some(_) => report.requeued += 1,
                None => {}
            }
        }

        if report.requeued > 0 || report.failed > 0 {
            tracing::warn!(
                requeued = report.requeued,
                failed = report.failed,
                "recovered orphaned import jobs"
            );
        }
        Ok(report)
    }

    /// Stop accepting dispatches and wait for running jobs.
    ///
    /// Jobs still waiting in the channel stay `queued` and are recovered on
    /// the next start.
    pub async fn shutdown(&self) {
        self.dispatcher.close();
        self.stop.notify_one();

        let tasks = self.registry.drain().await;
        tracing::info!(jobs = tasks.len(), "waiting for import jobs to finish");
        for (job_id, handle) in tasks {
            if let Err(e) = handle.await
                && e.is_panic()
            {
                tracing::error!(job_id = %job_id, "import task panicked during shutdown");
            }
        }
    }

    /// Put an unfinished job back in the queue, or fail it when it has used
    /// up its attempts. Returns the status the job was left in.
    async fn requeue_or_fail(&self, job_id: JobId) -> IngestResult<Option<JobStatus>> {
        let Some(job) = self.load_job(job_id).await? else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            return Ok(None);
        }

        let now = OffsetDateTime::now_utc();
        if job.attempts >= self.config.max_attempts {
            let mut job = job;
            let error = ItemError::new(
                job.source_ref.clone(),
                "attempts_exhausted",
                format!("gave up after {} attempts", job.attempts),
            );
            self.record_error(&mut job, error).await?;
            self.metadata
                .finish_job(job_id.into_uuid(), JobStatus::Failed.as_str(), now)
                .await?;
            metrics::record_job_finished(JobStatus::Failed.as_str());
            self.release_upload(&job).await;
            return Ok(Some(JobStatus::Failed));
        }

        if job.status == JobStatus::Running {
            self.metadata.reset_job(job_id.into_uuid(), now).await?;
        }
        self.dispatcher.dispatch(job_id)?;
        metrics::JOBS_REQUEUED.inc();
        Ok(Some(JobStatus::Queued))
    }

    async fn spawn_job(self: &Arc<Self>, job_id: JobId) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_job(job_id).await });
        self.registry.register(job_id, handle).await;
    }

    async fn run_job(&self, job_id: JobId) {
        if let Err(e) = self.execute(job_id).await {
            tracing::error!(job_id = %job_id, error = %e, "import job could not run");
        }
    }

    fn user_slot(&self, owner: UserId) -> Arc<Semaphore> {
        self.user_slots
            .entry(owner)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_user_concurrency)))
            .value()
            .clone()
    }

    async fn execute(&self, job_id: JobId) -> IngestResult<()> {
        let Some(job) = self.load_job(job_id).await? else {
            tracing::warn!(job_id = %job_id, "dispatched import job does not exist");
            return Ok(());
        };
        if job.status != JobStatus::Queued {
            tracing::debug!(job_id = %job_id, status = %job.status, "import job not queued, skipping");
            return Ok(());
        }

        let _user_permit = self
            .user_slot(job.owner)
            .acquire_owned()
            .await
            .map_err(|_| IngestError::ShuttingDown)?;
        let _worker_permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IngestError::ShuttingDown)?;

        if !self
            .metadata
            .start_job(job_id.into_uuid(), OffsetDateTime::now_utc())
            .await?
        {
            tracing::debug!(job_id = %job_id, "import job claimed elsewhere");
            return Ok(());
        }
        let _active = ActiveJob::enter();

        let mut job = self
            .load_job(job_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("import job {job_id}")))?;
        tracing::info!(
            job_id = %job_id,
            owner = %job.owner,
            source_kind = job.source_kind.as_str(),
            attempt = job.attempts,
            "import job started"
        );
        self.progress.insert(job_id, job.progress());

        let status = match self.process(&mut job).await {
            Ok(()) => JobStatus::Completed,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "import job failed");
                let error = ItemError::new(job.source_ref.clone(), e.code(), e.to_string());
                if let Err(e) = self.record_error(&mut job, error).await {
                    tracing::error!(job_id = %job_id, error = %e, "failed to record job error");
                }
                JobStatus::Failed
            }
        };

        let finished = self
            .metadata
            .finish_job(job_id.into_uuid(), status.as_str(), OffsetDateTime::now_utc())
            .await;
        if finished.is_ok() {
            self.release_upload(&job).await;
        }
        self.progress.remove(&job_id);
        finished?;

        metrics::record_job_finished(status.as_str());
        tracing::info!(
            job_id = %job_id,
            status = %status,
            total = job.counters.total_files,
            stored = job.counters.stored_files,
            duplicates = job.counters.duplicate_files,
            errors = job.errors.len(),
            "import job finished"
        );
        Ok(())
    }

    /// Walk the job's source and ingest every entry.
    async fn process(&self, job: &mut ImportJob) -> IngestResult<()> {
        let source = self.open_source(job).await?;
        let mut entries = source.entries();

        while let Some(entry) = entries.next().await {
            if !job.enumeration_complete {
                job.counters.total_files += 1;
            }
            match entry {
                Ok(entry) => match self.ingest_entry(job, source.as_ref(), &entry).await {
                    Ok(IngestOutcome::Stored(_)) => job.counters.stored_files += 1,
                    Ok(IngestOutcome::Duplicate { .. }) => job.counters.duplicate_files += 1,
                    Ok(IngestOutcome::Rejected(reason)) => {
                        let error = ItemError::new(entry.path, reason.code(), reason.message());
                        self.record_error(job, error).await?;
                    }
                    Err(IngestError::Metadata(e)) => return Err(e.into()),
                    Err(e) => {
                        let error = ItemError::new(entry.path, e.code(), e.to_string());
                        self.record_error(job, error).await?;
                    }
                },
                Err(error) => self.record_error(job, error).await?,
            }
            job.counters.processed_files += 1;
            self.checkpoint(job).await?;
        }

        if !job.enumeration_complete {
            job.enumeration_complete = true;
            self.checkpoint(job).await?;
        }
        Ok(())
    }

    async fn open_source(&self, job: &ImportJob) -> IngestResult<Arc<dyn ScanSource>> {
        match job.source_kind {
            SourceKind::SingleUpload => {
                let session_id = SessionId::parse(&job.source_ref)?;
                let source =
                    UploadPartsSource::load(self.storage.clone(), self.metadata.as_ref(), session_id)
                        .await?;
                Ok(Arc::new(source))
            }
            SourceKind::DirectoryScan => self.resolver.resolve(&job.source_ref).await,
        }
    }

    /// Ingest one entry, retrying transient storage failures with backoff.
    async fn ingest_entry(
        &self,
        job: &ImportJob,
        source: &dyn ScanSource,
        entry: &ScanEntry,
    ) -> IngestResult<IngestOutcome> {
        let mut attempt = 1;
        loop {
            let content = source
                .open(entry)
                .await
                .map_err(|e| IngestError::Unreadable(e.to_string()))?;
            let request = IngestRequest {
                owner: job.owner,
                size_bytes: entry.size_bytes,
                filename: entry.filename.clone(),
                content_type: entry.content_type.clone(),
                job_id: Some(job.id),
            };

            match self.engine.ingest(request, content).await {
                Err(e) if e.is_transient() && attempt < self.config.item_retry_attempts => {
                    let delay = self.config.item_retry_backoff(attempt);
                    metrics::ITEM_RETRIES.inc();
                    tracing::warn!(
                        job_id = %job.id,
                        path = %entry.path,
                        attempt,
                        ?delay,
                        error = %e,
                        "retrying import item"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn record_error(&self, job: &mut ImportJob, error: ItemError) -> IngestResult<()> {
        tracing::warn!(job_id = %job.id, path = %error.path, code = %error.code, "import item failed");
        self.metadata
            .append_job_error(&ImportJobErrorRow::new(job.id, &error))
            .await?;
        job.errors.push(error);
        Ok(())
    }

    /// Persist counters and publish a fresh snapshot.
    async fn checkpoint(&self, job: &mut ImportJob) -> IngestResult<()> {
        job.updated_at = OffsetDateTime::now_utc();
        self.metadata
            .update_job_progress(&ImportJobRow::try_from(&*job)?)
            .await?;
        self.progress.insert(job.id, job.progress());
        Ok(())
    }

    /// Drop the parts behind a finished single-upload job.
    async fn release_upload(&self, job: &ImportJob) {
        if job.source_kind != SourceKind::SingleUpload {
            return;
        }
        let Ok(session_id) = SessionId::parse(&job.source_ref) else {
            return;
        };
        if let Err(e) =
            sessions::release_parts(self.storage.as_ref(), self.metadata.as_ref(), session_id).await
        {
            tracing::warn!(job_id = %job.id, session_id = %session_id, error = %e, "failed to release upload parts");
        }
    }

    async fn load_job(&self, job_id: JobId) -> IngestResult<Option<ImportJob>> {
        let Some(row) = self.metadata.get_job(job_id.into_uuid()).await? else {
            return Ok(None);
        };
        let errors = self.metadata.get_job_errors(job_id.into_uuid()).await?;
        Ok(Some(row.into_job(errors)?))
    }
}
