//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/v1/health", get(handlers::health_check))
        .route("/v1/imports", post(handlers::enqueue_import))
        .route(
            "/v1/jobs/{job_id}/progress",
            get(handlers::get_job_progress),
        )
        .route(
            "/v1/users/{user_id}/quota",
            get(handlers::get_quota).put(handlers::put_quota),
        );

    // When enabled, /metrics must be network-restricted to the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
