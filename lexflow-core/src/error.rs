//! Error types for Lexflow operations

use crate::{AgentKind, PrincipalRole};
use thiserror::Error;

/// Gate errors: credential verification and quota enforcement.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GateError {
    #[error("No credential supplied")]
    MissingCredential,

    #[error("Credential not recognized")]
    InvalidCredential,

    #[error("Credential is inactive")]
    InactiveCredential,

    #[error("Credential expired")]
    ExpiredCredential,

    #[error("Role {actual:?} does not satisfy required role {required:?}")]
    ForbiddenRole {
        required: PrincipalRole,
        actual: PrincipalRole,
    },

    #[error("Quota exceeded, retry after {retry_after_secs}s")]
    QuotaExceeded { retry_after_secs: i64 },
}

/// Input validation errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Value for {field} out of range: {value} ({reason})")]
    OutOfRange {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Transient backend errors. Recovered or degraded locally; never fatal
/// to the workflow.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("Graph store unavailable: {reason}")]
    GraphUnavailable { reason: String },

    #[error("Vector store unavailable: {reason}")]
    VectorUnavailable { reason: String },

    #[error("Cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    #[error("Counter store unavailable: {reason}")]
    CounterUnavailable { reason: String },

    #[error("Durable store unavailable: {reason}")]
    DurableUnavailable { reason: String },

    #[error("Upstream HTTP service returned {status}: {reason}")]
    HttpStatus { status: i32, reason: String },

    #[error("Connection pool exhausted for {backend}")]
    PoolExhausted { backend: String },
}

/// LLM gateway errors, handled by the JSON-output contract.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("No LLM provider configured")]
    ProviderNotConfigured,

    #[error("Response failed to parse after {attempts} attempts: {reason}")]
    ParseFailure { attempts: u32, reason: String },

    #[error("Response violated the expected schema: {reason}")]
    SchemaViolation { reason: String },

    #[error("LLM call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: i64 },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: i64,
    },

    #[error("Request to {provider} failed with status {status}: {message}")]
    Vendor {
        provider: String,
        status: i32,
        message: String,
    },
}

/// Deadline errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeadlineError {
    #[error("Node {node} timed out after {timeout_ms}ms")]
    NodeTimeout { node: String, timeout_ms: i64 },

    #[error("Request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: i64 },
}

/// Logic errors: broken invariants. These fail the request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LogicError {
    #[error("Execution plan invalid: {reason}")]
    PlanInvalid { reason: String },

    #[error("Claim has no provenance mapping: {claim}")]
    ProvenanceMissing { claim: String },

    #[error("Internal invariant broken: {reason}")]
    InvariantBroken { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Agent-level errors surfaced inside degraded agent results.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("Agent {agent:?} timed out after {timeout_ms}ms")]
    Timeout { agent: AgentKind, timeout_ms: i64 },

    #[error("Agent {agent:?} failed: {reason}")]
    Failed { agent: AgentKind, reason: String },

    #[error("Agent {agent:?} cancelled by request deadline")]
    Cancelled { agent: AgentKind },
}

/// Master error type for all Lexflow errors.
#[derive(Debug, Clone, Error)]
pub enum LexflowError {
    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Deadline error: {0}")]
    Deadline(#[from] DeadlineError),

    #[error("Logic error: {0}")]
    Logic(#[from] LogicError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

impl LexflowError {
    /// Whether this error class degrades to a warning rather than failing
    /// the request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LexflowError::Backend(_) | LexflowError::Gateway(_) | LexflowError::Agent(_)
        )
    }
}

/// Result type alias for Lexflow operations.
pub type LexflowResult<T> = Result<T, LexflowError>;
