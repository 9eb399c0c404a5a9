//! Health reporting types shared by the API and the engine

use serde::{Deserialize, Serialize};

/// Health of a single backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Backend reachable and serving
    Healthy,
    /// Backend reachable but slow or partially failing
    Degraded,
    /// Backend unreachable
    Unhealthy,
    /// Not yet probed
    Unknown,
}

/// Probe result for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BackendHealth {
    pub backend: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub response_time_ms: Option<i64>,
}

impl BackendHealth {
    pub fn healthy(backend: impl Into<String>, response_time_ms: i64) -> Self {
        Self {
            backend: backend.into(),
            status: HealthStatus::Healthy,
            message: None,
            response_time_ms: Some(response_time_ms),
        }
    }

    pub fn unhealthy(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            response_time_ms: None,
        }
    }
}

/// Aggregate system health: the gate keeps serving while any backend that
/// the degradation ladder can route around is down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub backends: Vec<BackendHealth>,
}

impl SystemHealth {
    /// Fold backend probes into an overall verdict.
    ///
    /// Healthy iff every backend is healthy; unhealthy only when the durable
    /// store is down (nothing can be recorded); degraded otherwise.
    pub fn aggregate(backends: Vec<BackendHealth>) -> Self {
        let status = if backends
            .iter()
            .all(|b| b.status == HealthStatus::Healthy)
        {
            HealthStatus::Healthy
        } else if backends
            .iter()
            .any(|b| b.backend == "durable" && b.status == HealthStatus::Unhealthy)
        {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        Self { status, backends }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_healthy() {
        let health = SystemHealth::aggregate(vec![
            BackendHealth::healthy("graph", 4),
            BackendHealth::healthy("vector", 7),
            BackendHealth::healthy("durable", 2),
        ]);
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_degraded_when_graph_down() {
        let health = SystemHealth::aggregate(vec![
            BackendHealth::unhealthy("graph", "connection refused"),
            BackendHealth::healthy("durable", 2),
        ]);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_unhealthy_when_durable_down() {
        let health = SystemHealth::aggregate(vec![
            BackendHealth::healthy("graph", 4),
            BackendHealth::unhealthy("durable", "pool exhausted"),
        ]);
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }
}
