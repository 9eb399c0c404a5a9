//! Statistics endpoint

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{extract::State, Json};
use lexflow_storage::StoreStats;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CacheStatsView {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct StatsResponse {
    /// Counts per persisted record type
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub records: StoreStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStatsView>,
    pub uptime_seconds: u64,
}

/// GET /api/v1/stats
pub async fn statistics(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let records = state.durable.stats().await.map_err(ApiError::from)?;

    let cache = match &state.cache {
        Some(cache) => cache.stats().await.ok().map(|s| CacheStatsView {
            hits: s.hits,
            misses: s.misses,
            entry_count: s.entry_count,
            hit_rate: s.hit_rate(),
        }),
        None => None,
    };

    Ok(Json(StatsResponse {
        records,
        cache,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::gate_middleware;
    use crate::test_support::test_state;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_stats_counts_credentials() {
        let state = test_state("lx_test_key").await;
        let app = Router::new()
            .route("/api/v1/stats", get(statistics))
            .layer(middleware::from_fn_with_state(state.clone(), gate_middleware))
            .with_state(state);

        let request = axum::http::Request::builder()
            .uri("/api/v1/stats")
            .header("x-api-key", "lx_test_key")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: StatsResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.records.credentials, 1);
    }
}
