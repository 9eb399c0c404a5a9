//! Prometheus Metrics Definitions
//!
//! Defines the Lexflow metrics with appropriate labels and types.
//! Exposes a /metrics endpoint for Prometheus scraping.

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Workflow latency buckets (seconds) - whole requests, not single calls
const WORKFLOW_LATENCY_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0, 60.0, 120.0];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<LexflowMetrics>> = Lazy::new(LexflowMetrics::new);

/// Container for all Lexflow metrics.
#[derive(Clone)]
pub struct LexflowMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Completed workflow counter - labels: status, stop_reason
    pub workflow_requests_total: CounterVec,

    /// Workflow duration histogram - labels: status
    pub workflow_duration_seconds: HistogramVec,

    /// Rate-limit refusal counter - labels: tier
    pub rate_limit_refusals_total: CounterVec,

    /// Degradation counter - labels: kind
    pub degradations_total: CounterVec,
}

impl LexflowMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "lexflow_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| {
                ApiError::internal_error(format!("Failed to register http_requests_total: {}", e))
            })?,

            http_request_duration_seconds: register_histogram_vec!(
                "lexflow_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| {
                ApiError::internal_error(format!(
                    "Failed to register http_request_duration_seconds: {}",
                    e
                ))
            })?,

            workflow_requests_total: register_counter_vec!(
                "lexflow_workflow_requests_total",
                "Completed workflow requests",
                &["status", "stop_reason"]
            )
            .map_err(|e| {
                ApiError::internal_error(format!(
                    "Failed to register workflow_requests_total: {}",
                    e
                ))
            })?,

            workflow_duration_seconds: register_histogram_vec!(
                "lexflow_workflow_duration_seconds",
                "Workflow duration in seconds",
                &["status"],
                WORKFLOW_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| {
                ApiError::internal_error(format!(
                    "Failed to register workflow_duration_seconds: {}",
                    e
                ))
            })?,

            rate_limit_refusals_total: register_counter_vec!(
                "lexflow_rate_limit_refusals_total",
                "Requests refused by the sliding window",
                &["tier"]
            )
            .map_err(|e| {
                ApiError::internal_error(format!(
                    "Failed to register rate_limit_refusals_total: {}",
                    e
                ))
            })?,

            degradations_total: register_counter_vec!(
                "lexflow_degradations_total",
                "Degradation warnings recorded on workflow state",
                &["kind"]
            )
            .map_err(|e| {
                ApiError::internal_error(format!("Failed to register degradations_total: {}", e))
            })?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// Record a completed workflow.
    pub fn record_workflow(&self, status: &str, stop_reason: &str, duration_secs: f64) {
        self.workflow_requests_total
            .with_label_values(&[status, stop_reason])
            .inc();
        self.workflow_duration_seconds
            .with_label_values(&[status])
            .observe(duration_secs);
    }

    /// Record a sliding-window refusal.
    pub fn record_rate_limit_refusal(&self, tier: &str) {
        self.rate_limit_refusals_total
            .with_label_values(&[tier])
            .inc();
    }

    /// Record a degradation warning.
    pub fn record_degradation(&self, kind: &str) {
        self.degradations_total.with_label_values(&[kind]).inc();
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;

    #[test]
    fn test_metrics_creation() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        assert!(!metrics.http_requests_total.desc().is_empty());
        Ok(())
    }

    #[test]
    fn test_record_http_request() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        metrics.record_http_request("POST", "/api/v1/queries", 200, 1.2);
        Ok(())
    }

    #[test]
    fn test_record_workflow() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        metrics.record_workflow("success", "high-confidence-and-consensus", 2.5);
        metrics.record_workflow("partial", "timeout", 30.0);
        Ok(())
    }

    #[test]
    fn test_record_refusals_and_degradations() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        metrics.record_rate_limit_refusal("standard");
        metrics.record_degradation("enrichment-degraded");
        Ok(())
    }
}
