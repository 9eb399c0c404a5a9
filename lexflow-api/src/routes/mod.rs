//! Route handlers
//!
//! All business endpoints live under `/api/v1` behind the gate middleware;
//! health and metrics are unauthenticated.

pub mod admin;
pub mod feedback;
pub mod health;
pub mod query;
pub mod stats;
pub mod trace;

use crate::middleware::gate_middleware;
use crate::state::AppState;
use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};

/// CORS policy: permissive when no origins are configured (dev mode),
/// an explicit allow-list otherwise.
fn cors_layer(state: &AppState) -> CorsLayer {
    if state.api_config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .api_config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Assemble the full application router.
pub fn create_api_router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/queries", post(query::submit_query))
        .route("/queries/:trace_id", get(trace::fetch_trace))
        .route("/feedback/user", post(feedback::submit_user_feedback))
        .route("/feedback/expert", post(feedback::submit_expert_correction))
        .route("/feedback/entity", post(feedback::submit_entity_correction))
        .route("/stats", get(stats::statistics))
        .route(
            "/admin/credentials",
            post(admin::create_credential).get(admin::list_credentials),
        )
        .route(
            "/admin/credentials/:credential_id",
            delete(admin::revoke_credential),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gate_middleware,
        ));

    let cors = cors_layer(&state);

    Router::new()
        .nest("/api/v1", gated)
        .nest("/health", health::create_router())
        .route("/metrics", get(crate::telemetry::metrics_handler))
        .layer(middleware::from_fn(crate::telemetry::track_metrics))
        .layer(cors)
        .with_state(state)
}
