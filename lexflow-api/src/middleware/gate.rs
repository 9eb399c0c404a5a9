//! Gate middleware: authentication + sliding-window rate limiting
//!
//! Runs in front of every endpoint:
//! 1. Resolves the `X-Api-Key` credential to a verified principal (401/403
//!    on failure; authentication never degrades).
//! 2. Charges the principal's sliding window in the shared counter store.
//!    Refusals get 429 with `Retry-After`; a counter-store outage fails
//!    open and marks the request `rate-limit-bypassed`.
//! 3. Attaches the rate-limit headers to every successful response and
//!    appends a usage record fire-and-forget.

use crate::auth::{Principal, CREDENTIAL_HEADER};
use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use lexflow_core::{EntityIdType, PrincipalRole, UsageId, UsageRecord};
use lexflow_storage::WindowDecision;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

// ============================================================================
// RATE-LIMIT HEADERS
// ============================================================================

/// The four headers attached to every gated response.
#[derive(Debug, Clone, Copy)]
struct RateLimitHeaders {
    limit: u32,
    remaining: u32,
    reset_epoch: i64,
    used: u32,
}

impl From<&WindowDecision> for RateLimitHeaders {
    fn from(decision: &WindowDecision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_epoch: decision.reset_epoch,
            used: decision.used,
        }
    }
}

impl RateLimitHeaders {
    fn apply(&self, headers: &mut axum::http::HeaderMap) {
        let pairs = [
            ("x-ratelimit-limit", self.limit.to_string()),
            ("x-ratelimit-remaining", self.remaining.to_string()),
            ("x-ratelimit-reset", self.reset_epoch.to_string()),
            ("x-ratelimit-used", self.used.to_string()),
        ];
        for (name, value) in pairs {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
    }
}

/// Marker injected when the counter store was unreachable and the request
/// was admitted without charging the window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitBypassed;

// ============================================================================
// MIDDLEWARE
// ============================================================================

pub async fn gate_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let client_addr = client_addr(&request);

    // 1. Authentication
    let presented = request
        .headers()
        .get(CREDENTIAL_HEADER)
        .and_then(|h| h.to_str().ok());
    let principal = state
        .verifier
        .verify(presented, PrincipalRole::Guest)
        .await
        .map_err(ApiError::from)?;

    // 2. Rate limit
    let mut headers: Option<RateLimitHeaders> = None;
    let mut bypassed = false;

    if state.engine_config.rate_limit.enabled {
        let quota = state
            .engine_config
            .rate_limit
            .quotas
            .for_tier(principal.tier);
        let window = Duration::from_secs(state.engine_config.rate_limit.window_secs as u64);

        match state
            .counter
            .charge(
                &principal.credential_id.to_string(),
                chrono::Utc::now(),
                window,
                quota,
            )
            .await
        {
            Ok(decision) => {
                if !decision.allowed {
                    if let Ok(metrics) = crate::telemetry::METRICS.as_ref() {
                        metrics.record_rate_limit_refusal(principal.tier.as_db_str());
                    }
                    record_usage(&state, &principal, &path, &method, 429, started, client_addr);
                    let mut response =
                        ApiError::quota_exceeded(decision.retry_after_secs).into_response();
                    RateLimitHeaders::from(&decision).apply(response.headers_mut());
                    return Ok(response);
                }
                headers = Some(RateLimitHeaders::from(&decision));
            }
            Err(e) => {
                // Fail-open on transient counter errors, never fail-closed
                tracing::warn!(error = %e, "counter store unavailable, rate limit bypassed");
                bypassed = true;
            }
        }
    }

    // 3. Hand off to the route
    request.extensions_mut().insert(principal.clone());
    if bypassed {
        request.extensions_mut().insert(RateLimitBypassed);
    }

    let mut response = next.run(request).await;

    if let Some(headers_out) = headers {
        headers_out.apply(response.headers_mut());
    }
    if bypassed {
        response
            .headers_mut()
            .insert("x-ratelimit-bypassed", HeaderValue::from_static("true"));
    }

    record_usage(
        &state,
        &principal,
        &path,
        &method,
        response.status().as_u16(),
        started,
        client_addr,
    );
    Ok(response)
}

fn client_addr(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return forwarded.trim().to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[allow(clippy::too_many_arguments)]
fn record_usage(
    state: &AppState,
    principal: &Principal,
    path: &str,
    method: &str,
    status: u16,
    started: Instant,
    client_addr: String,
) {
    let record = UsageRecord {
        usage_id: UsageId::now_v7(),
        credential_id: principal.credential_id,
        endpoint: path.to_string(),
        method: method.to_string(),
        status: status as i32,
        duration_ms: started.elapsed().as_millis() as i64,
        client_addr,
        at: chrono::Utc::now(),
    };
    let durable = state.durable.clone();
    tokio::spawn(async move {
        if let Err(e) = durable.append_usage(&record).await {
            tracing::warn!(error = %e, "usage record write failed");
        }
    });
}

// ============================================================================
// TYPED EXTRACTORS
// ============================================================================

/// Typed extractor for the verified principal.
///
/// The gate middleware must be applied to the route; without it the
/// extractor reports an internal error.
#[derive(Debug, Clone)]
pub struct PrincipalExtractor(pub Principal);

#[axum::async_trait]
impl<S> FromRequestParts<S> for PrincipalExtractor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(PrincipalExtractor)
            .ok_or_else(|| {
                ApiError::internal_error(
                    "Principal not found in request extensions. \
                     Ensure gate_middleware is applied to this route.",
                )
            })
    }
}

impl std::ops::Deref for PrincipalExtractor {
    type Target = Principal;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Extractor that additionally requires the admin role.
#[derive(Debug, Clone)]
pub struct AdminExtractor(pub Principal);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminExtractor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let PrincipalExtractor(principal) =
            PrincipalExtractor::from_request_parts(parts, state).await?;
        if !principal.role.satisfies(PrincipalRole::Admin) {
            return Err(ApiError::from_code(crate::error::ErrorCode::ForbiddenRole));
        }
        Ok(AdminExtractor(principal))
    }
}

// ============================================================================
// TESTS
// ============================================================================
