//! Quota endpoints.

use crate::error::{IngestError, IngestResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use keepsake_core::{QuotaUsage, UserId};
use serde::Deserialize;

/// Request body for `PUT /v1/users/{user_id}/quota`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustQuotaRequest {
    pub quota: u64,
}

fn parse_user_id(raw: &str) -> IngestResult<UserId> {
    UserId::parse(raw).map_err(|e| IngestError::ValidationError(format!("invalid user ID: {e}")))
}

/// GET /v1/users/{user_id}/quota
pub async fn get_quota(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> IngestResult<Json<QuotaUsage>> {
    let user_id = parse_user_id(&user_id)?;
    Ok(Json(state.ledger.usage(user_id).await?))
}

/// PUT /v1/users/{user_id}/quota - Change the limit. Refused below current
/// usage.
pub async fn put_quota(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<AdjustQuotaRequest>,
) -> IngestResult<Json<QuotaUsage>> {
    let user_id = parse_user_id(&user_id)?;
    Ok(Json(state.ledger.adjust_limit(user_id, body.quota).await?))
}
