//! Error Types for the Lexflow API
//!
//! This module defines error handling for the gate layer:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//!
//! All errors are serialized as JSON with appropriate HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lexflow_core::{GateError, LexflowError, TraceId};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each code maps to a specific HTTP status and mirrors the engine's error
/// taxonomy at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    // ========================================================================
    // Credential errors (401, 403)
    // ========================================================================
    /// No credential header supplied
    MissingCredential,

    /// Credential not recognized
    InvalidCredential,

    /// Credential exists but is deactivated
    InactiveCredential,

    /// Credential exists but has expired
    ExpiredCredential,

    /// Authenticated, but the role does not permit the operation
    ForbiddenRole,

    // ========================================================================
    // Quota (429)
    // ========================================================================
    /// Sliding-window quota exhausted
    QuotaExceeded,

    // ========================================================================
    // Validation errors (400)
    // ========================================================================
    /// Request body fails the schema
    ValidationFailed,

    /// An option is out of its permitted range
    OptionOutOfRange,

    // ========================================================================
    // Not found (404)
    // ========================================================================
    /// No trace with the given id
    TraceNotFound,

    /// No credential with the given id
    CredentialNotFound,

    // ========================================================================
    // Deadline (408)
    // ========================================================================
    /// The request deadline elapsed before any iteration completed
    RequestTimeout,

    // ========================================================================
    // Server errors (500, 503)
    // ========================================================================
    /// Broken internal invariant
    InternalError,

    /// A required backend is unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::MissingCredential
            | ErrorCode::InvalidCredential
            | ErrorCode::InactiveCredential
            | ErrorCode::ExpiredCredential => StatusCode::UNAUTHORIZED,

            ErrorCode::ForbiddenRole => StatusCode::FORBIDDEN,

            ErrorCode::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,

            ErrorCode::ValidationFailed | ErrorCode::OptionOutOfRange => StatusCode::BAD_REQUEST,

            ErrorCode::TraceNotFound | ErrorCode::CredentialNotFound => StatusCode::NOT_FOUND,

            ErrorCode::RequestTimeout => StatusCode::REQUEST_TIMEOUT,

            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::MissingCredential => "No credential supplied",
            ErrorCode::InvalidCredential => "Credential not recognized",
            ErrorCode::InactiveCredential => "Credential is inactive",
            ErrorCode::ExpiredCredential => "Credential has expired",
            ErrorCode::ForbiddenRole => "Role does not permit this operation",
            ErrorCode::QuotaExceeded => "Rate limit exceeded",
            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::OptionOutOfRange => "Option value out of range",
            ErrorCode::TraceNotFound => "Trace not found",
            ErrorCode::CredentialNotFound => "Credential not found",
            ErrorCode::RequestTimeout => "Request timed out",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// Present once a request has been admitted
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub trace_id: Option<TraceId>,
    /// Seconds to wait before retrying; only on quota refusals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            trace_id: None,
            retry_after: None,
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn trace_not_found(trace_id: TraceId) -> Self {
        Self::new(
            ErrorCode::TraceNotFound,
            format!("No trace with id {}", trace_id),
        )
    }

    pub fn quota_exceeded(retry_after: i64) -> Self {
        Self {
            code: ErrorCode::QuotaExceeded,
            message: ErrorCode::QuotaExceeded.default_message().to_string(),
            trace_id: None,
            retry_after: Some(retry_after),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<LexflowError> for ApiError {
    fn from(err: LexflowError) -> Self {
        match &err {
            LexflowError::Gate(gate) => match gate {
                GateError::MissingCredential => Self::from_code(ErrorCode::MissingCredential),
                GateError::InvalidCredential => Self::from_code(ErrorCode::InvalidCredential),
                GateError::InactiveCredential => Self::from_code(ErrorCode::InactiveCredential),
                GateError::ExpiredCredential => Self::from_code(ErrorCode::ExpiredCredential),
                GateError::ForbiddenRole { .. } => Self::from_code(ErrorCode::ForbiddenRole),
                GateError::QuotaExceeded { retry_after_secs } => {
                    Self::quota_exceeded(*retry_after_secs)
                }
            },
            LexflowError::Validation(v) => Self::new(ErrorCode::ValidationFailed, v.to_string()),
            LexflowError::Deadline(d) => Self::new(ErrorCode::RequestTimeout, d.to_string()),
            LexflowError::Backend(b) => Self::new(ErrorCode::ServiceUnavailable, b.to_string()),
            other => Self::internal_error(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status_code();
        let retry_after = self.retry_after;

        let mut response = (status, Json(self)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ErrorCode::MissingCredential.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ErrorCode::ForbiddenRole.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ErrorCode::QuotaExceeded.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ErrorCode::RequestTimeout.status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ErrorCode::ValidationFailed.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_gate_error_conversion() {
        let err: ApiError = LexflowError::Gate(GateError::QuotaExceeded {
            retry_after_secs: 42,
        })
        .into();
        assert_eq!(err.code, ErrorCode::QuotaExceeded);
        assert_eq!(err.retry_after, Some(42));
    }

    #[test]
    fn test_serialization_kebab_case() {
        let err = ApiError::from_code(ErrorCode::QuotaExceeded);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"quota-exceeded\""));
        assert!(!json.contains("trace_id"));
    }

    #[test]
    fn test_retry_after_header() {
        let response = ApiError::quota_exceeded(30).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("retry-after").unwrap().to_str().unwrap(),
            "30"
        );
    }
}
