//! Credential management endpoints (admin role only)

use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::middleware::AdminExtractor;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use lexflow_core::{
    CredentialId, CredentialRecord, EntityIdType, PrincipalRole, RateLimitTier, Timestamp,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CreateCredentialRequest {
    pub role: PrincipalRole,
    pub tier: RateLimitTier,
    pub description: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub expires_at: Option<Timestamp>,
}

/// The secret is returned exactly once, at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CreateCredentialResponse {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub credential_id: CredentialId,
    pub secret: String,
    pub role: PrincipalRole,
    pub tier: RateLimitTier,
}

/// Listing view: everything except the hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CredentialView {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub credential_id: CredentialId,
    pub role: PrincipalRole,
    pub tier: RateLimitTier,
    pub active: bool,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub expires_at: Option<Timestamp>,
    pub description: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub last_used_at: Option<Timestamp>,
}

impl From<CredentialRecord> for CredentialView {
    fn from(record: CredentialRecord) -> Self {
        Self {
            credential_id: record.credential_id,
            role: record.role,
            tier: record.tier,
            active: record.active,
            expires_at: record.expires_at,
            description: record.description,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
        }
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

/// Generate an opaque credential secret.
fn generate_secret() -> String {
    format!(
        "lx_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// POST /api/v1/admin/credentials
pub async fn create_credential(
    State(state): State<AppState>,
    AdminExtractor(_admin): AdminExtractor,
    Json(request): Json<CreateCredentialRequest>,
) -> ApiResult<Json<CreateCredentialResponse>> {
    let secret = generate_secret();
    let mut record = CredentialRecord::new(&secret, request.role, request.tier);
    record.description = request.description;
    record.expires_at = request.expires_at;

    state
        .durable
        .insert_credential(&record)
        .await
        .map_err(ApiError::from)?;

    tracing::info!(credential_id = %record.credential_id, role = ?record.role, "credential created");

    Ok(Json(CreateCredentialResponse {
        credential_id: record.credential_id,
        secret,
        role: record.role,
        tier: record.tier,
    }))
}

/// GET /api/v1/admin/credentials
pub async fn list_credentials(
    State(state): State<AppState>,
    AdminExtractor(_admin): AdminExtractor,
) -> ApiResult<Json<Vec<CredentialView>>> {
    let records = state
        .durable
        .list_credentials()
        .await
        .map_err(ApiError::from)?;
    Ok(Json(records.into_iter().map(CredentialView::from).collect()))
}

/// DELETE /api/v1/admin/credentials/:credential_id
pub async fn revoke_credential(
    State(state): State<AppState>,
    AdminExtractor(_admin): AdminExtractor,
    Path(credential_id): Path<Uuid>,
) -> ApiResult<Json<CredentialView>> {
    let credential_id = CredentialId::new(credential_id);

    let revoked = state
        .durable
        .set_credential_active(credential_id, false)
        .await
        .map_err(ApiError::from)?;
    if !revoked {
        return Err(ApiError::from_code(ErrorCode::CredentialNotFound));
    }

    tracing::info!(%credential_id, "credential revoked");

    let view = state
        .durable
        .list_credentials()
        .await
        .map_err(ApiError::from)?
        .into_iter()
        .find(|r| r.credential_id == credential_id)
        .map(CredentialView::from)
        .ok_or_else(|| ApiError::from_code(ErrorCode::CredentialNotFound))?;

    Ok(Json(view))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::gate_middleware;
    use crate::test_support::test_state_with_role;
    use axum::{
        body::Body,
        http::StatusCode,
        middleware,
        routing::{delete, get, post},
        Router,
    };
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/api/v1/admin/credentials", post(create_credential))
            .route("/api/v1/admin/credentials", get(list_credentials))
            .route(
                "/api/v1/admin/credentials/:credential_id",
                delete(revoke_credential),
            )
            .layer(middleware::from_fn_with_state(state.clone(), gate_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn test_create_and_revoke_credential() {
        let state = test_state_with_role("lx_admin_key", PrincipalRole::Admin).await;
        let app = app(state);

        let create = axum::http::Request::builder()
            .uri("/api/v1/admin/credentials")
            .method("POST")
            .header("x-api-key", "lx_admin_key")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"role": "user", "tier": "standard"}).to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(create).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let created: CreateCredentialResponse = serde_json::from_slice(&body).unwrap();
        assert!(created.secret.starts_with("lx_"));

        let revoke = axum::http::Request::builder()
            .uri(format!(
                "/api/v1/admin/credentials/{}",
                created.credential_id
            ))
            .method("DELETE")
            .header("x-api-key", "lx_admin_key")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(revoke).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let view: CredentialView = serde_json::from_slice(&body).unwrap();
        assert!(!view.active);
    }

    #[tokio::test]
    async fn test_admin_endpoints_forbidden_for_user_role() {
        let state = test_state_with_role("lx_user_key", PrincipalRole::User).await;

        let request = axum::http::Request::builder()
            .uri("/api/v1/admin/credentials")
            .header("x-api-key", "lx_user_key")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_revoke_unknown_credential_is_404() {
        let state = test_state_with_role("lx_admin_key", PrincipalRole::Admin).await;

        let request = axum::http::Request::builder()
            .uri(format!("/api/v1/admin/credentials/{}", Uuid::now_v7()))
            .method("DELETE")
            .header("x-api-key", "lx_admin_key")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_generated_secrets_are_distinct() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        assert!(a.len() > 40);
    }
}
