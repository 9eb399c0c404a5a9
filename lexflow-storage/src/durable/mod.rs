//! Durable store
//!
//! Eight logical record types: traces, iterations, answers, user feedback,
//! expert feedback, entity feedback, credentials, usage. Writes from the
//! workflow runtime are best-effort: a failure is recorded as a warning on
//! the state and never retried in-band.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgConfig, PgStore};

use async_trait::async_trait;
use lexflow_core::{
    CredentialHash, CredentialId, CredentialRecord, EntitySpanCorrection, ExpertCorrection,
    IterationRecord, LexflowResult, ProvisionalAnswer, Timestamp, TraceId, TraceRecord,
    UsageRecord, UserFeedback,
};

/// Counts per record type, served by the statistics endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoreStats {
    pub traces: u64,
    pub iterations: u64,
    pub answers: u64,
    pub user_feedback: u64,
    pub expert_feedback: u64,
    pub entity_feedback: u64,
    pub credentials: u64,
    pub usage: u64,
}

/// The persistence boundary of the engine.
///
/// No cross-record transactions: each record is isolated, which is sufficient
/// for the runtime's correctness (iteration records are ordered by index,
/// traces are upserted once per request).
#[async_trait]
pub trait DurableStore: Send + Sync {
    // ------------------------------------------------------------------
    // Traces
    // ------------------------------------------------------------------

    /// Upsert the trace record. Called once at completion (success, failure,
    /// or timeout); an earlier admission stub is overwritten.
    async fn record_trace(&self, trace: &TraceRecord) -> LexflowResult<()>;

    async fn fetch_trace(&self, trace_id: TraceId) -> LexflowResult<Option<TraceRecord>>;

    // ------------------------------------------------------------------
    // Iterations & answers
    // ------------------------------------------------------------------

    /// Append one completed iteration.
    async fn append_iteration(
        &self,
        trace_id: TraceId,
        record: &IterationRecord,
    ) -> LexflowResult<()>;

    /// Record the answer produced at one iteration.
    async fn record_answer(
        &self,
        trace_id: TraceId,
        iteration: i32,
        answer: &ProvisionalAnswer,
    ) -> LexflowResult<()>;

    // ------------------------------------------------------------------
    // Feedback
    // ------------------------------------------------------------------

    async fn record_user_feedback(&self, feedback: &UserFeedback) -> LexflowResult<()>;

    async fn record_expert_feedback(&self, correction: &ExpertCorrection) -> LexflowResult<()>;

    async fn record_entity_feedback(
        &self,
        correction: &EntitySpanCorrection,
    ) -> LexflowResult<()>;

    async fn user_feedback_for_trace(&self, trace_id: TraceId)
        -> LexflowResult<Vec<UserFeedback>>;

    async fn expert_feedback_for_trace(
        &self,
        trace_id: TraceId,
    ) -> LexflowResult<Vec<ExpertCorrection>>;

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    async fn insert_credential(&self, record: &CredentialRecord) -> LexflowResult<()>;

    async fn credential_by_hash(
        &self,
        hash: &CredentialHash,
    ) -> LexflowResult<Option<CredentialRecord>>;

    async fn list_credentials(&self) -> LexflowResult<Vec<CredentialRecord>>;

    /// Flip the active flag. Returns false when the credential is unknown.
    async fn set_credential_active(
        &self,
        credential_id: CredentialId,
        active: bool,
    ) -> LexflowResult<bool>;

    /// Advance the last-used timestamp. Implementations must keep it
    /// monotonically non-decreasing.
    async fn touch_credential(
        &self,
        credential_id: CredentialId,
        at: Timestamp,
    ) -> LexflowResult<()>;

    // ------------------------------------------------------------------
    // Usage
    // ------------------------------------------------------------------

    async fn append_usage(&self, record: &UsageRecord) -> LexflowResult<()>;

    /// Usage records for a credential since an instant. Supports the
    /// sliding-window audit queries.
    async fn usage_count_since(
        &self,
        credential_id: CredentialId,
        since: Timestamp,
    ) -> LexflowResult<u64>;

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    async fn stats(&self) -> LexflowResult<StoreStats>;
}
