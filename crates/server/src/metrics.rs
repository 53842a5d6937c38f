//! Prometheus metrics for the Keepsake server.
//!
//! Covers upload sessions, ingestion outcomes, import jobs and quota.
//! Labels never carry user or job ids.
//!
//! The `/metrics` endpoint is unauthenticated; restrict it at the network
//! level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload session metrics
pub static UPLOAD_SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_upload_sessions_created_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_FINALIZED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_upload_sessions_finalized_total",
        "Total number of upload sessions finalized into an import job",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_upload_sessions_aborted_total",
        "Total number of upload sessions aborted by the client",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_upload_sessions_expired_total",
        "Total number of upload sessions that expired",
    )
    .expect("metric creation failed")
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_upload_bytes_received_total",
        "Total bytes accepted by chunk appends",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keepsake_upload_errors_total",
            "Total upload errors by error code",
        ),
        &["code"],
    )
    .expect("metric creation failed")
});

// Ingestion metrics
pub static INGEST_OUTCOMES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keepsake_ingest_outcomes_total",
            "Ingested files by outcome (stored, duplicate, rejected)",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static BYTES_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_bytes_stored_total",
        "Total bytes moved into durable storage",
    )
    .expect("metric creation failed")
});

pub static BYTES_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_bytes_deduplicated_total",
        "Total bytes discarded because the owner already had the content",
    )
    .expect("metric creation failed")
});

pub static INGEST_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "keepsake_ingest_duration_seconds",
            "Time taken to hash, deduplicate and store one file",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0]),
    )
    .expect("metric creation failed")
});

pub static ITEM_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_ingest_item_retries_total",
        "Total per-file retries after storage write failures",
    )
    .expect("metric creation failed")
});

// Import job metrics
pub static JOBS_ENQUEUED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_import_jobs_enqueued_total",
        "Total number of import jobs enqueued",
    )
    .expect("metric creation failed")
});

pub static JOBS_FINISHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keepsake_import_jobs_finished_total",
            "Import jobs reaching a terminal status",
        ),
        &["status"],
    )
    .expect("metric creation failed")
});

pub static JOBS_REQUEUED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_import_jobs_requeued_total",
        "Import jobs put back in the queue after a crash or panic",
    )
    .expect("metric creation failed")
});

pub static JOBS_PANICKED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_import_jobs_panicked_total",
        "Import job tasks that panicked",
    )
    .expect("metric creation failed")
});

pub static JOBS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "keepsake_import_jobs_active",
        "Import jobs currently holding a worker slot",
    )
    .expect("metric creation failed")
});

// Quota metrics
pub static QUOTA_REJECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_quota_rejections_total",
        "Reservations refused for lack of quota",
    )
    .expect("metric creation failed")
});

// Housekeeping metrics
pub static STAGING_OBJECTS_SWEPT: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_staging_objects_swept_total",
        "Abandoned staging objects removed by housekeeping",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests and embedded routers can call it freely.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOAD_SESSIONS_CREATED.clone()),
            Box::new(UPLOAD_SESSIONS_FINALIZED.clone()),
            Box::new(UPLOAD_SESSIONS_ABORTED.clone()),
            Box::new(UPLOAD_SESSIONS_EXPIRED.clone()),
            Box::new(BYTES_RECEIVED.clone()),
            Box::new(UPLOAD_ERRORS.clone()),
            Box::new(INGEST_OUTCOMES.clone()),
            Box::new(BYTES_STORED.clone()),
            Box::new(BYTES_DEDUPLICATED.clone()),
            Box::new(INGEST_DURATION.clone()),
            Box::new(ITEM_RETRIES.clone()),
            Box::new(JOBS_ENQUEUED.clone()),
            Box::new(JOBS_FINISHED.clone()),
            Box::new(JOBS_REQUEUED.clone()),
            Box::new(JOBS_PANICKED.clone()),
            Box::new(JOBS_ACTIVE.clone()),
            Box::new(QUOTA_REJECTIONS.clone()),
            Box::new(STAGING_OBJECTS_SWEPT.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Count an upload error by its stable code.
pub fn record_upload_error(code: &str) {
    UPLOAD_ERRORS.with_label_values(&[code]).inc();
}

/// Count one ingest outcome.
pub fn record_ingest_outcome(outcome: &str) {
    INGEST_OUTCOMES.with_label_values(&[outcome]).inc();
}

/// Count a job reaching a terminal status.
pub fn record_job_finished(status: &str) {
    JOBS_FINISHED.with_label_values(&[status]).inc();
}
