//! Import job endpoints.

use crate::error::{IngestError, IngestResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use keepsake_core::{ImportRequest, JobId, ProgressResponse, UserId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Request body for `POST /v1/imports`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueImportRequest {
    pub owner_user_id: String,
    /// Directory on the server to scan.
    pub root: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueImportResponse {
    pub job_id: JobId,
}

fn parse_job_id(raw: &str) -> IngestResult<JobId> {
    JobId::parse(raw).map_err(|e| IngestError::ValidationError(format!("invalid job ID: {e}")))
}

/// POST /v1/imports - Queue a directory scan.
pub async fn enqueue_import(
    State(state): State<AppState>,
    Json(body): Json<EnqueueImportRequest>,
) -> IngestResult<(StatusCode, Json<EnqueueImportResponse>)> {
    let owner = UserId::parse(&body.owner_user_id)
        .map_err(|e| IngestError::ValidationError(format!("invalid user ID: {e}")))?;

    let job_id = state
        .coordinator
        .enqueue(ImportRequest::DirectoryScan {
            owner,
            root: body.root,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(EnqueueImportResponse { job_id })))
}

/// GET /v1/jobs/{job_id}/progress - Poll a job.
pub async fn get_job_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> IngestResult<Json<ProgressResponse>> {
    let job_id = parse_job_id(&job_id)?;
    let progress = state.coordinator.get_progress(job_id).await?;
    Ok(Json(progress.response()))
}
