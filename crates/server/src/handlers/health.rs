//! Health endpoint.

use crate::error::IngestResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub storage: &'static str,
}

/// GET /v1/health - Metadata and storage connectivity.
pub async fn health_check(State(state): State<AppState>) -> IngestResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;
    state.storage.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        storage: state.storage.backend_name(),
    }))
}
