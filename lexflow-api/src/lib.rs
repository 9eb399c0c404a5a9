//! Lexflow API - REST gate for the legal-reasoning engine
//!
//! Fronts the workflow runtime with:
//! - Credential authentication (hash lookup, role, expiry)
//! - Sliding-window rate limiting over a shared counter store
//! - Query submission, trace retrieval, feedback, statistics, health
//! - Structured logging and Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use auth::{CredentialVerifier, Principal, CREDENTIAL_HEADER};
pub use config::{ApiConfig, LlmVendor};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use routes::create_api_router;
pub use state::AppState;
