//! Trace retrieval endpoint

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use lexflow_core::{EntityIdType, TraceId, TraceRecord, UserFeedback};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Full state snapshot plus the feedback submitted against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TraceResponse {
    #[serde(flatten)]
    pub trace: TraceRecord,
    pub user_feedback: Vec<UserFeedback>,
}

/// GET /api/v1/queries/:trace_id
pub async fn fetch_trace(
    State(state): State<AppState>,
    Path(trace_id): Path<Uuid>,
) -> ApiResult<Json<TraceResponse>> {
    let trace_id = TraceId::new(trace_id);

    let trace = state
        .durable
        .fetch_trace(trace_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::trace_not_found(trace_id))?;

    let user_feedback = state
        .durable
        .user_feedback_for_trace(trace_id)
        .await
        .unwrap_or_default();

    Ok(Json(TraceResponse {
        trace,
        user_feedback,
    }))
}
