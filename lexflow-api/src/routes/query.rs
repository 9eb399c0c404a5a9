//! Query submission endpoint

use crate::error::{ApiError, ApiResult};
use crate::middleware::{PrincipalExtractor, RateLimitBypassed};
use crate::state::AppState;
use axum::{extract::State, Extension, Json};
use lexflow_core::{
    ProvisionalAnswer, QueryRequest, RequestStatus, StopReason, TraceId, TraceRecord, Warning,
    WarningKind,
};
use serde::{Deserialize, Serialize};

/// Response envelope for a processed query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SubmitQueryResponse {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub trace_id: TraceId,
    pub status: RequestStatus,
    pub stop_reason: Option<StopReason>,
    pub answer: Option<ProvisionalAnswer>,
    pub warnings: Vec<Warning>,
    /// Full execution trace, present when the request asked for it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceRecord>,
}

/// POST /api/v1/queries
///
/// Drives the query through the workflow and returns the answer with its
/// trace id. Partial answers are returned rather than refused whenever at
/// least one iteration completed; a deadline with zero iterations maps
/// to 408.
pub async fn submit_query(
    State(state): State<AppState>,
    PrincipalExtractor(principal): PrincipalExtractor,
    bypassed: Option<Extension<RateLimitBypassed>>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<SubmitQueryResponse>> {
    tracing::debug!(credential_id = %principal.credential_id, "query submitted");
    let return_trace = request.options.return_trace;

    let outcome = state
        .runtime
        .execute(request)
        .await
        .map_err(ApiError::from)?;

    let trace = outcome.trace;

    // Zero completed iterations on a tripped deadline is a refusal
    if trace.status == RequestStatus::Failed && trace.stop_reason == Some(StopReason::Timeout) {
        return Err(
            ApiError::from_code(crate::error::ErrorCode::RequestTimeout)
                .with_trace_id(trace.trace_id),
        );
    }

    let mut warnings = trace.warnings.clone();
    if bypassed.is_some() {
        warnings.push(Warning::new(
            WarningKind::RateLimitBypassed,
            "counter store unavailable, request admitted without quota charge",
        ));
    }

    if let Ok(metrics) = crate::telemetry::METRICS.as_ref() {
        metrics.record_workflow(
            trace.status.as_db_str(),
            trace
                .stop_reason
                .map(|r| r.as_db_str())
                .unwrap_or("none"),
            trace.total_duration_ms as f64 / 1000.0,
        );
        for warning in &warnings {
            metrics.record_degradation(&format!("{:?}", warning.kind));
        }
    }

    Ok(Json(SubmitQueryResponse {
        trace_id: trace.trace_id,
        status: trace.status,
        stop_reason: trace.stop_reason,
        answer: outcome.answer,
        warnings,
        trace: return_trace.then_some(trace),
    }))
}
