//! Metadata store trait and SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{JobRepo, ObjectRepo, QuotaRepo, SessionRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: SessionRepo + ObjectRepo + QuotaRepo + JobRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection serializes writers; the conditional updates below
        // rely on that to stay race free.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "opened sqlite metadata store");

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// `?, ?, ?` for an IN list of `n` binds.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::error::is_unique_violation;
    use crate::models::*;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl SessionRepo for SqliteStore {
        async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    session_id, owner_user_id, declared_size, bytes_received, state,
                    filename, content_type, job_id, created_at, last_activity_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session.session_id)
            .bind(session.owner_user_id)
            .bind(session.declared_size)
            .bind(session.bytes_received)
            .bind(&session.state)
            .bind(&session.filename)
            .bind(&session.content_type)
            .bind(session.job_id)
            .bind(session.created_at)
            .bind(session.last_activity_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e, "upload_sessions") {
                    MetadataError::AlreadyExists(format!("session {}", session.session_id))
                } else {
                    e.into()
                }
            })?;
            Ok(())
        }

        async fn get_session(&self, session_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE session_id = ?",
            )
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn append_part(
            &self,
            session_id: Uuid,
            expected_offset: i64,
            size_bytes: i64,
            object_key: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            // Compare-and-set on the offset: a concurrent append that already
            // advanced bytes_received makes this update match nothing.
            let result = sqlx::query(
                r#"
                UPDATE upload_sessions
                SET bytes_received = bytes_received + ?, state = 'in_progress', last_activity_at = ?
                WHERE session_id = ?
                  AND bytes_received = ?
                  AND state IN ('created', 'in_progress')
                  AND bytes_received + ? <= declared_size
                "#,
            )
            .bind(size_bytes)
            .bind(now)
            .bind(session_id)
            .bind(expected_offset)
            .bind(size_bytes)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Ok(false);
            }

            sqlx::query(
                r#"
                INSERT INTO upload_parts (session_id, offset_bytes, size_bytes, object_key, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(session_id)
            .bind(expected_offset)
            .bind(size_bytes)
            .bind(object_key)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(true)
        }

        async fn list_parts(&self, session_id: Uuid) -> MetadataResult<Vec<UploadPartRow>> {
            let rows = sqlx::query_as::<_, UploadPartRow>(
                "SELECT * FROM upload_parts WHERE session_id = ? ORDER BY offset_bytes ASC",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_parts(&self, session_id: Uuid) -> MetadataResult<u64> {
            let result = sqlx::query("DELETE FROM upload_parts WHERE session_id = ?")
                .bind(session_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }

        async fn complete_session(
            &self,
            session_id: Uuid,
            job: &ImportJobRow,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            let result = sqlx::query(
                r#"
                UPDATE upload_sessions
                SET state = 'completed', job_id = ?, last_activity_at = ?
                WHERE session_id = ?
                  AND state IN ('created', 'in_progress')
                  AND bytes_received = declared_size
                "#,
            )
            .bind(job.job_id)
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Ok(false);
            }

            insert_job(&mut tx, job).await?;
            tx.commit().await?;
            Ok(true)
        }

        async fn transition_session(
            &self,
            session_id: Uuid,
            from: &[&str],
            to: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            if from.is_empty() {
                return Ok(false);
            }
            let sql = format!(
                "UPDATE upload_sessions SET state = ?, last_activity_at = ? WHERE session_id = ? AND state IN ({})",
                placeholders(from.len())
            );
            let mut query = sqlx::query(&sql).bind(to).bind(now).bind(session_id);
            for state in from {
                query = query.bind(*state);
            }
            let result = query.execute(&self.pool).await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_idle_sessions(
            &self,
            idle_before: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(
                r#"
                SELECT * FROM upload_sessions
                WHERE state IN ('created', 'in_progress') AND last_activity_at < ?
                ORDER BY last_activity_at ASC
                LIMIT ?
                "#,
            )
            .bind(idle_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn purge_terminal_sessions(
            &self,
            before: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<u64> {
            // upload_parts rows go with ON DELETE CASCADE. A completed
            // session is the input of its job, so it stays until that job
            // has finished.
            let result = sqlx::query(
                r#"
                DELETE FROM upload_sessions WHERE session_id IN (
                    SELECT s.session_id FROM upload_sessions s
                    WHERE s.state IN ('completed', 'aborted', 'expired')
                      AND s.last_activity_at < ?
                      AND NOT EXISTS (
                          SELECT 1 FROM import_jobs j
                          WHERE j.job_id = s.job_id AND j.status IN ('queued', 'running')
                      )
                    LIMIT ?
                )
                "#,
            )
            .bind(before)
            .bind(limit)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl ObjectRepo for SqliteStore {
        async fn get_object(
            &self,
            owner_user_id: Uuid,
            fingerprint: &str,
        ) -> MetadataResult<Option<ObjectRow>> {
            let row = sqlx::query_as::<_, ObjectRow>(
                "SELECT * FROM objects WHERE owner_user_id = ? AND fingerprint = ?",
            )
            .bind(owner_user_id)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn record_object(&self, object: &ObjectRow) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            if let Err(e) = sqlx::query(
                r#"
                INSERT INTO objects (
                    object_id, owner_user_id, fingerprint, size_bytes, storage_locator,
                    media_kind, original_name, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(object.object_id)
            .bind(object.owner_user_id)
            .bind(&object.fingerprint)
            .bind(object.size_bytes)
            .bind(&object.storage_locator)
            .bind(&object.media_kind)
            .bind(&object.original_name)
            .bind(object.created_at)
            .execute(&mut *tx)
            .await
            {
                // SQLite error: "UNIQUE constraint failed: objects.owner_user_id, objects.fingerprint"
                if is_unique_violation(&e, "objects") {
                    return Err(MetadataError::AlreadyExists(format!(
                        "object {} for user {}",
                        object.fingerprint, object.owner_user_id
                    )));
                }
                return Err(e.into());
            }

            let charged = sqlx::query(
                r#"
                UPDATE quota_accounts
                SET used_bytes = used_bytes + ?, updated_at = ?
                WHERE user_id = ? AND used_bytes + ? <= limit_bytes
                "#,
            )
            .bind(object.size_bytes)
            .bind(object.created_at)
            .bind(object.owner_user_id)
            .bind(object.size_bytes)
            .execute(&mut *tx)
            .await?;

            if charged.rows_affected() == 0 {
                // Dropping the transaction rolls back the insert
                return Err(MetadataError::Constraint(format!(
                    "charging {} bytes would exceed quota for user {}",
                    object.size_bytes, object.owner_user_id
                )));
            }

            tx.commit().await?;
            Ok(())
        }

        async fn count_objects(&self, owner_user_id: Uuid) -> MetadataResult<u64> {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE owner_user_id = ?")
                    .bind(owner_user_id)
                    .fetch_one(&self.pool)
                    .await?;
            to_u64(count, "object count")
        }
    }

    #[async_trait]
    impl QuotaRepo for SqliteStore {
        async fn get_account(&self, user_id: Uuid) -> MetadataResult<Option<QuotaAccountRow>> {
            let row = sqlx::query_as::<_, QuotaAccountRow>(
                "SELECT * FROM quota_accounts WHERE user_id = ?",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn ensure_account(
            &self,
            user_id: Uuid,
            default_limit: i64,
            now: OffsetDateTime,
        ) -> MetadataResult<QuotaAccountRow> {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO quota_accounts (user_id, limit_bytes, used_bytes, created_at, updated_at)
                VALUES (?, ?, 0, ?, ?)
                "#,
            )
            .bind(user_id)
            .bind(default_limit)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let row = sqlx::query_as::<_, QuotaAccountRow>(
                "SELECT * FROM quota_accounts WHERE user_id = ?",
            )
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn set_limit(
            &self,
            user_id: Uuid,
            limit_bytes: i64,
            now: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE quota_accounts SET limit_bytes = ?, updated_at = ? WHERE user_id = ?",
            )
            .bind(limit_bytes)
            .bind(now)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("quota account {user_id}")));
            }
            Ok(())
        }

        async fn add_used_bytes(
            &self,
            user_id: Uuid,
            bytes: i64,
            now: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE quota_accounts
                SET used_bytes = used_bytes + ?, updated_at = ?
                WHERE user_id = ? AND used_bytes + ? <= limit_bytes
                "#,
            )
            .bind(bytes)
            .bind(now)
            .bind(user_id)
            .bind(bytes)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return match self.get_account(user_id).await? {
                    None => Err(MetadataError::NotFound(format!("quota account {user_id}"))),
                    Some(_) => Err(MetadataError::Constraint(format!(
                        "charging {bytes} bytes would exceed quota for user {user_id}"
                    ))),
                };
            }
            Ok(())
        }
    }

    async fn insert_job(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        job: &ImportJobRow,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO import_jobs (
                job_id, owner_user_id, source_kind, source_ref, status,
                total_files, processed_files, stored_files, duplicate_files,
                enumeration_complete, attempts, created_at, updated_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.job_id)
        .bind(job.owner_user_id)
        .bind(&job.source_kind)
        .bind(&job.source_ref)
        .bind(&job.status)
        .bind(job.total_files)
        .bind(job.processed_files)
        .bind(job.stored_files)
        .bind(job.duplicate_files)
        .bind(job.enumeration_complete)
        .bind(job.attempts)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, "import_jobs") {
                MetadataError::AlreadyExists(format!("import job {}", job.job_id))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    #[async_trait]
    impl JobRepo for SqliteStore {
        async fn create_job(&self, job: &ImportJobRow) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            insert_job(&mut tx, job).await?;
            tx.commit().await?;
            Ok(())
        }

        async fn get_job(&self, job_id: Uuid) -> MetadataResult<Option<ImportJobRow>> {
            let row =
                sqlx::query_as::<_, ImportJobRow>("SELECT * FROM import_jobs WHERE job_id = ?")
                    .bind(job_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn get_job_errors(&self, job_id: Uuid) -> MetadataResult<Vec<ImportJobErrorRow>> {
            let rows = sqlx::query_as::<_, ImportJobErrorRow>(
                r#"
                SELECT job_id, path, code, message, created_at
                FROM import_job_errors WHERE job_id = ? ORDER BY error_id ASC
                "#,
            )
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn start_job(&self, job_id: Uuid, now: OffsetDateTime) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE import_jobs SET status = 'running', attempts = attempts + 1, updated_at = ?
                WHERE job_id = ? AND status = 'queued'
                "#,
            )
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn update_job_progress(&self, job: &ImportJobRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                UPDATE import_jobs
                SET total_files = ?, processed_files = ?, stored_files = ?, duplicate_files = ?,
                    enumeration_complete = ?, updated_at = ?
                WHERE job_id = ? AND status = 'running'
                "#,
            )
            .bind(job.total_files)
            .bind(job.processed_files)
            .bind(job.stored_files)
            .bind(job.duplicate_files)
            .bind(job.enumeration_complete)
            .bind(job.updated_at)
            .bind(job.job_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn append_job_error(&self, error: &ImportJobErrorRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO import_job_errors (job_id, path, code, message, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(error.job_id)
            .bind(&error.path)
            .bind(&error.code)
            .bind(&error.message)
            .bind(error.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn finish_job(
            &self,
            job_id: Uuid,
            status: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE import_jobs SET status = ?, updated_at = ?, finished_at = ?
                WHERE job_id = ? AND status IN ('queued', 'running')
                "#,
            )
            .bind(status)
            .bind(now)
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                let current = self
                    .get_job(job_id)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("import job {job_id}")))?;
                return Err(MetadataError::InvalidStateTransition {
                    from: current.status,
                    to: status.to_string(),
                });
            }
            Ok(())
        }

        async fn reset_job(&self, job_id: Uuid, now: OffsetDateTime) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                UPDATE import_jobs
                SET status = 'queued', processed_files = 0, stored_files = 0, duplicate_files = 0,
                    total_files = CASE WHEN source_kind = 'single_upload' THEN 1 ELSE 0 END,
                    enumeration_complete = CASE WHEN source_kind = 'single_upload' THEN 1 ELSE 0 END,
                    updated_at = ?
                WHERE job_id = ? AND status IN ('queued', 'running')
                "#,
            )
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Ok(false);
            }

            sqlx::query("DELETE FROM import_job_errors WHERE job_id = ?")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(true)
        }

        async fn get_orphaned_jobs(&self) -> MetadataResult<Vec<ImportJobRow>> {
            let rows = sqlx::query_as::<_, ImportJobRow>(
                "SELECT * FROM import_jobs WHERE status IN ('queued', 'running') ORDER BY created_at ASC",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn purge_finished_jobs(
            &self,
            before: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<u64> {
            let result = sqlx::query(
                r#"
                DELETE FROM import_jobs WHERE job_id IN (
                    SELECT job_id FROM import_jobs
                    WHERE status IN ('completed', 'failed') AND finished_at < ?
                    LIMIT ?
                )
                "#,
            )
            .bind(before)
            .bind(limit)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Quota accounts, provisioned on first use
CREATE TABLE IF NOT EXISTS quota_accounts (
    user_id BLOB PRIMARY KEY,
    limit_bytes INTEGER NOT NULL CHECK (limit_bytes >= 0),
    used_bytes INTEGER NOT NULL DEFAULT 0 CHECK (used_bytes >= 0),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Resumable upload sessions
CREATE TABLE IF NOT EXISTS upload_sessions (
    session_id BLOB PRIMARY KEY,
    owner_user_id BLOB NOT NULL,
    declared_size INTEGER NOT NULL CHECK (declared_size > 0),
    bytes_received INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'created',
    filename TEXT,
    content_type TEXT,
    job_id BLOB,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,
    CHECK (bytes_received >= 0 AND bytes_received <= declared_size)
);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_state_activity
    ON upload_sessions(state, last_activity_at);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_owner ON upload_sessions(owner_user_id);

-- Received chunks, one row per accepted append
CREATE TABLE IF NOT EXISTS upload_parts (
    session_id BLOB NOT NULL REFERENCES upload_sessions(session_id) ON DELETE CASCADE,
    offset_bytes INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL CHECK (size_bytes > 0),
    object_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (session_id, offset_bytes)
);

-- Catalogued objects
CREATE TABLE IF NOT EXISTS objects (
    object_id BLOB PRIMARY KEY,
    owner_user_id BLOB NOT NULL,
    fingerprint TEXT NOT NULL,
    size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
    storage_locator TEXT NOT NULL,
    media_kind TEXT NOT NULL,
    original_name TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (owner_user_id, fingerprint)
);

-- Import jobs
CREATE TABLE IF NOT EXISTS import_jobs (
    job_id BLOB PRIMARY KEY,
    owner_user_id BLOB NOT NULL,
    source_kind TEXT NOT NULL,
    source_ref TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    total_files INTEGER NOT NULL DEFAULT 0,
    processed_files INTEGER NOT NULL DEFAULT 0,
    stored_files INTEGER NOT NULL DEFAULT 0,
    duplicate_files INTEGER NOT NULL DEFAULT 0,
    enumeration_complete INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_import_jobs_status ON import_jobs(status);
CREATE INDEX IF NOT EXISTS idx_import_jobs_owner ON import_jobs(owner_user_id);

-- Per-file import failures
CREATE TABLE IF NOT EXISTS import_job_errors (
    error_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id BLOB NOT NULL REFERENCES import_jobs(job_id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    code TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_import_job_errors_job ON import_job_errors(job_id);
"#;
