//! Telemetry: structured logging and Prometheus metrics

mod metrics;

pub use metrics::{metrics_handler, LexflowMetrics, METRICS};

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Middleware recording request count and latency for every route.
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    if let Ok(metrics) = METRICS.as_ref() {
        metrics.record_http_request(
            &method,
            &path,
            response.status().as_u16(),
            started.elapsed().as_secs_f64(),
        );
    }
    response
}

/// Initialize the tracing subscriber.
///
/// `LEXFLOW_LOG` overrides the filter (default "info"); `LEXFLOW_LOG_JSON`
/// switches to JSON lines for log shippers.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("LEXFLOW_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info,lexflow_engine=debug"));

    let json = std::env::var("LEXFLOW_LOG_JSON")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
