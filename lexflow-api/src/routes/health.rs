//! Health Check Endpoints
//!
//! Kubernetes-compatible health checks:
//! - /health/ping - simple liveness check
//! - /health/live - process alive check
//! - /health/ready - backend reachability
//!
//! No authentication required for health endpoints. The gate keeps serving
//! while any backend the degradation ladder can route around is down, so
//! readiness degrades rather than failing unless the durable store is out.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use lexflow_core::{BackendHealth, HealthStatus, SystemHealth};
use serde::{Deserialize, Serialize};
use std::time::Instant;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ReadinessResponse {
    #[serde(flatten)]
    pub health: SystemHealth,
    pub version: String,
    pub uptime_seconds: u64,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health/ping - Simple pong response
pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

/// GET /health/live - Process liveness check
pub async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "alive"})))
}

/// GET /health/ready - Readiness check (backend reachability)
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let mut backends = Vec::new();

    // Durable store: the one backend readiness cannot shrug off
    let started = Instant::now();
    match state.durable.stats().await {
        Ok(_) => backends.push(BackendHealth::healthy(
            "durable",
            started.elapsed().as_millis() as i64,
        )),
        Err(e) => backends.push(BackendHealth::unhealthy("durable", e.to_string())),
    }

    // Graph store, when configured
    if let Some(graph) = &state.graph {
        match graph.ping().await {
            Ok(latency) => backends.push(BackendHealth::healthy("graph", latency)),
            Err(e) => backends.push(BackendHealth::unhealthy("graph", e.to_string())),
        }
    }

    // Cache, when configured
    if let Some(cache) = &state.cache {
        let started = Instant::now();
        match cache.stats().await {
            Ok(_) => backends.push(BackendHealth::healthy(
                "cache",
                started.elapsed().as_millis() as i64,
            )),
            Err(e) => backends.push(BackendHealth::unhealthy("cache", e.to_string())),
        }
    }

    let health = SystemHealth::aggregate(backends);
    let status_code = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    let response = ReadinessResponse {
        health,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    };

    (status_code, Json(response))
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create health check router (no auth required)
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/live", get(liveness))
        .route("/ready", get(readiness))
}
