//! Feedback endpoints
//!
//! Three correction channels against a past trace: end-user ratings,
//! authority-weighted external-expert corrections, and entity-span
//! corrections. All are validated, persisted, and acknowledged with a
//! feedback id.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{extract::State, Json};
use lexflow_core::{
    CorrectionSpan, EntityCorrectionKind, EntityIdType, EntitySpanCorrection, ExpertCorrection,
    FeedbackId, StructuredCorrections, TraceId, UserFeedback,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Expert corrections per trace that trigger a retrain signal.
const RETRAIN_THRESHOLD: usize = 3;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct UserFeedbackRequest {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub trace_id: Uuid,
    /// Overall rating 1..=5
    pub rating: i32,
    pub text: Option<String>,
    #[serde(default)]
    pub category_ratings: BTreeMap<String, i32>,
    #[serde(default)]
    pub missing_information: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FeedbackResponse {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub feedback_id: FeedbackId,
}

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ExpertCorrectionRequest {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub trace_id: Uuid,
    pub expert_id: String,
    /// Authority weight in [0, 1]
    pub authority_weight: f32,
    #[serde(default)]
    pub corrections: StructuredCorrections,
    /// Overall rating 1..=5
    pub overall_rating: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ExpertCorrectionResponse {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub feedback_id: FeedbackId,
    /// Whether this correction pushed the trace over the retrain threshold
    pub retrain_threshold_crossed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EntityCorrectionRequest {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub trace_id: Uuid,
    pub kind: EntityCorrectionKind,
    pub span: CorrectionSpan,
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn require_trace(state: &AppState, trace_id: TraceId) -> ApiResult<()> {
    state
        .durable
        .fetch_trace(trace_id)
        .await
        .map_err(ApiError::from)?
        .map(|_| ())
        .ok_or_else(|| ApiError::trace_not_found(trace_id))
}

/// POST /api/v1/feedback/user
pub async fn submit_user_feedback(
    State(state): State<AppState>,
    Json(request): Json<UserFeedbackRequest>,
) -> ApiResult<Json<FeedbackResponse>> {
    if !(1..=5).contains(&request.rating) {
        return Err(ApiError::validation("rating must be between 1 and 5"));
    }
    for (category, rating) in &request.category_ratings {
        if !(1..=5).contains(rating) {
            return Err(ApiError::validation(format!(
                "category rating for '{}' must be between 1 and 5",
                category
            )));
        }
    }

    let trace_id = TraceId::new(request.trace_id);
    require_trace(&state, trace_id).await?;

    let feedback = UserFeedback {
        feedback_id: FeedbackId::now_v7(),
        trace_id,
        rating: request.rating,
        text: request.text,
        category_ratings: request.category_ratings,
        missing_information: request.missing_information,
        at: chrono::Utc::now(),
    };
    state
        .durable
        .record_user_feedback(&feedback)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(FeedbackResponse {
        feedback_id: feedback.feedback_id,
    }))
}

/// POST /api/v1/feedback/expert
pub async fn submit_expert_correction(
    State(state): State<AppState>,
    Json(request): Json<ExpertCorrectionRequest>,
) -> ApiResult<Json<ExpertCorrectionResponse>> {
    if !(0.0..=1.0).contains(&request.authority_weight) {
        return Err(ApiError::validation(
            "authority_weight must be between 0.0 and 1.0",
        ));
    }
    if !(1..=5).contains(&request.overall_rating) {
        return Err(ApiError::validation(
            "overall_rating must be between 1 and 5",
        ));
    }

    let trace_id = TraceId::new(request.trace_id);
    require_trace(&state, trace_id).await?;

    let correction = ExpertCorrection {
        feedback_id: FeedbackId::now_v7(),
        trace_id,
        expert_id: request.expert_id,
        authority_weight: request.authority_weight,
        corrections: request.corrections,
        overall_rating: request.overall_rating,
        at: chrono::Utc::now(),
    };
    state
        .durable
        .record_expert_feedback(&correction)
        .await
        .map_err(ApiError::from)?;

    let total = state
        .durable
        .expert_feedback_for_trace(trace_id)
        .await
        .map(|corrections| corrections.len())
        .unwrap_or(0);

    Ok(Json(ExpertCorrectionResponse {
        feedback_id: correction.feedback_id,
        retrain_threshold_crossed: total >= RETRAIN_THRESHOLD,
    }))
}

/// POST /api/v1/feedback/entity
pub async fn submit_entity_correction(
    State(state): State<AppState>,
    Json(request): Json<EntityCorrectionRequest>,
) -> ApiResult<Json<FeedbackResponse>> {
    if request.span.end < request.span.start {
        return Err(ApiError::validation("span end must not precede its start"));
    }
    if request.span.text.is_empty() {
        return Err(ApiError::validation("span text must not be empty"));
    }

    let trace_id = TraceId::new(request.trace_id);
    require_trace(&state, trace_id).await?;

    let correction = EntitySpanCorrection {
        feedback_id: FeedbackId::now_v7(),
        trace_id,
        kind: request.kind,
        span: request.span,
        at: chrono::Utc::now(),
    };
    state
        .durable
        .record_entity_feedback(&correction)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(FeedbackResponse {
        feedback_id: correction.feedback_id,
    }))
}

// ============================================================================
// TESTS
// ============================================================================
