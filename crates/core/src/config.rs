//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// The endpoint is unauthenticated; restrict it at the network level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Resumable upload configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Idle time in seconds after which an unfinished session expires.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Largest chunk accepted by a single append.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Largest declared size a session may have.
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
    /// Reject sessions whose declared size cannot fit in the remaining quota.
    /// Advisory only; the binding check happens when the object is committed.
    #[serde(default = "default_quota_precheck")]
    pub quota_precheck: bool,
}

fn default_session_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_max_chunk_size() -> u64 {
    crate::MAX_CHUNK_SIZE
}

fn default_max_object_size() -> u64 {
    64 * 1024 * 1024 * 1024 // 64 GiB
}

fn default_quota_precheck() -> bool {
    true
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            max_chunk_size: default_max_chunk_size(),
            max_object_size: default_max_object_size(),
            quota_precheck: default_quota_precheck(),
        }
    }
}

impl UploadConfig {
    /// Get the session TTL as a Duration.
    pub fn session_ttl(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.session_ttl_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.session_ttl_secs == 0 {
            return Err("uploads.session_ttl_secs must be greater than 0".to_string());
        }
        if self.max_chunk_size == 0 {
            return Err("uploads.max_chunk_size must be greater than 0".to_string());
        }
        if self.max_object_size == 0 {
            return Err("uploads.max_object_size must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Import worker pool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Jobs running at once across all users.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Jobs running at once for a single user. Keep at 1 unless the quota
    /// ledger is the only guard you need between a user's own jobs.
    #[serde(default = "default_per_user_concurrency")]
    pub per_user_concurrency: usize,
    /// Deliveries of one job before it is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Attempts per file when storage writes fail.
    #[serde(default = "default_item_retry_attempts")]
    pub item_retry_attempts: u32,
    /// Base delay between per-file retries; doubles each attempt.
    #[serde(default = "default_item_retry_backoff_ms")]
    pub item_retry_backoff_ms: u64,
    /// Directory scans must stay below this root when set.
    #[serde(default)]
    pub scan_root: Option<PathBuf>,
    /// Seconds between checks for panicked job tasks.
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
}

fn default_max_workers() -> usize {
    8
}

fn default_per_user_concurrency() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    5
}

fn default_item_retry_attempts() -> u32 {
    3
}

fn default_item_retry_backoff_ms() -> u64 {
    250
}

fn default_watchdog_interval_secs() -> u64 {
    10
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            per_user_concurrency: default_per_user_concurrency(),
            max_attempts: default_max_attempts(),
            item_retry_attempts: default_item_retry_attempts(),
            item_retry_backoff_ms: default_item_retry_backoff_ms(),
            scan_root: None,
            watchdog_interval_secs: default_watchdog_interval_secs(),
        }
    }
}

impl ImportConfig {
    /// Delay before retry number `attempt` (1-based) of a single file.
    pub fn item_retry_backoff(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        std::time::Duration::from_millis(self.item_retry_backoff_ms.saturating_mul(factor))
    }

    pub fn watchdog_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("imports.max_workers must be greater than 0".to_string());
        }
        if self.per_user_concurrency == 0 {
            return Err("imports.per_user_concurrency must be greater than 0".to_string());
        }
        if self.max_attempts == 0 {
            return Err("imports.max_attempts must be greater than 0".to_string());
        }
        if self.item_retry_attempts == 0 {
            return Err("imports.item_retry_attempts must be greater than 0".to_string());
        }
        if self.watchdog_interval_secs == 0 {
            // tokio::time::interval panics on a zero period
            return Err("imports.watchdog_interval_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Quota defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Limit given to accounts provisioned on first use.
    #[serde(default = "default_limit_bytes")]
    pub default_limit_bytes: u64,
}

fn default_limit_bytes() -> u64 {
    15 * 1024 * 1024 * 1024 // 15 GiB
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limit_bytes: default_limit_bytes(),
        }
    }
}

/// Background housekeeping configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HousekeepingConfig {
    /// Seconds between housekeeping passes.
    #[serde(default = "default_housekeeping_interval_secs")]
    pub interval_secs: u64,
    /// How long terminal sessions and finished jobs are kept for polling.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Staging objects older than this are considered abandoned.
    #[serde(default = "default_staging_grace_secs")]
    pub staging_grace_secs: u64,
    /// Rows handled per query.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_housekeeping_interval_secs() -> u64 {
    60
}

fn default_retention_secs() -> u64 {
    7 * 86400 // 7 days
}

fn default_staging_grace_secs() -> u64 {
    6 * 3600
}

fn default_batch_size() -> u32 {
    500
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_housekeeping_interval_secs(),
            retention_secs: default_retention_secs(),
            staging_grace_secs: default_staging_grace_secs(),
            batch_size: default_batch_size(),
        }
    }
}

impl HousekeepingConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::seconds(i64::try_from(self.retention_secs).unwrap_or(i64::MAX))
    }

    pub fn staging_grace(&self) -> Duration {
        Duration::seconds(i64::try_from(self.staging_grace_secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("housekeeping.interval_secs must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("housekeeping.batch_size must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("storage.path must not be empty".to_string())
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default)]
    pub imports: ImportConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Item retries back off for a millisecond and the
    /// watchdog polls every second.
    pub fn for_testing() -> Self {
        Self {
            imports: ImportConfig {
                item_retry_backoff_ms: 1,
                watchdog_interval_secs: 1,
                ..ImportConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate every section, reporting the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.uploads.validate()?;
        self.imports.validate()?;
        self.housekeeping.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}
