//! Core entity structures
//!
//! Value objects threaded through the workflow. Mutation discipline lives in
//! the engine crate; everything here is plain data.

use crate::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// QUERY REQUEST
// ============================================================================

/// Caller-supplied options for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct QueryOptions {
    /// Maximum refinement iterations (1..=10)
    pub max_iterations: i32,
    /// Whether to include the execution trace in the response
    pub return_trace: bool,
    /// Overall request timeout in milliseconds (1000..=120000)
    pub timeout_ms: i64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            return_trace: false,
            timeout_ms: 30_000,
        }
    }
}

/// Optional caller hints narrowing the query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct UserHints {
    pub jurisdiction: Option<String>,
    pub temporal_reference: Option<String>,
    pub role: Option<String>,
}

/// An incoming legal query. Immutable once admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct QueryRequest {
    /// Original natural-language query text
    pub text: String,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub session_id: Option<SessionId>,
    pub hints: Option<UserHints>,
    #[serde(default)]
    pub options: QueryOptions,
}

// ============================================================================
// QUERY UNDERSTANDING
// ============================================================================

/// A typed span extracted from the query text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EntitySpan {
    /// The matched text
    pub text: String,
    pub kind: EntityKind,
    /// Character offset of the span start
    pub start: usize,
    /// Character offset one past the span end
    pub end: usize,
    pub confidence: f32,
}

impl EntitySpan {
    /// Whether two spans overlap in the source text.
    pub fn overlaps(&self, other: &EntitySpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Read-only understanding of the query, written once by preprocessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct QueryContext {
    pub intent: IntentTag,
    pub intent_confidence: f32,
    /// 1 − overall understanding confidence, clamped to [0, 1]
    pub complexity: f32,
    pub entities: Vec<EntitySpan>,
    /// Controlled-vocabulary concept tags
    pub concepts: Vec<String>,
    /// Canonical norm citations found in the query
    pub norm_references: Vec<String>,
    /// Dates and temporal expressions
    pub temporal_hints: Vec<String>,
}

// ============================================================================
// ENRICHMENT
// ============================================================================

/// A single item fetched from the graph store during enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EnrichedItem {
    pub source_id: SourceId,
    /// Canonical citation string
    pub citation: String,
    pub summary: String,
    pub source: SourceTag,
    pub confidence: f32,
}

/// Graph-derived context assembled once per request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EnrichedContext {
    pub norms: Vec<EnrichedItem>,
    pub case_law: Vec<EnrichedItem>,
    pub doctrine: Vec<EnrichedItem>,
    pub community: Vec<EnrichedItem>,
    /// Concepts flagged as controversial in the graph
    pub controversy_flags: Vec<String>,
}

impl EnrichedContext {
    /// Total items across all categories.
    pub fn item_count(&self) -> usize {
        self.norms.len() + self.case_law.len() + self.doctrine.len() + self.community.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0 && self.controversy_flags.is_empty()
    }
}

// ============================================================================
// EXECUTION PLAN
// ============================================================================

/// One agent call in an execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentInvocation {
    pub agent: AgentKind,
    /// Query rewrites the agent should search for (original included)
    pub query_rewrites: Vec<String>,
    /// Backend-specific filters (jurisdiction, date range, ...)
    pub filters: BTreeMap<String, String>,
    pub top_k: i32,
}

impl AgentInvocation {
    pub fn new(agent: AgentKind, query: impl Into<String>) -> Self {
        Self {
            agent,
            query_rewrites: vec![query.into()],
            filters: BTreeMap::new(),
            top_k: 10,
        }
    }
}

/// Plan produced by the router. Immutable per iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ExecutionPlan {
    pub agents: Vec<AgentInvocation>,
    pub experts: Vec<ExpertKind>,
    pub synthesis: SynthesisMode,
    /// Total iterations the router considers worthwhile (≥ current iteration)
    pub iteration_budget: i32,
    pub rationale: String,
}

// ============================================================================
// RETRIEVAL RESULTS
// ============================================================================

/// A single retrieval hit, normalized across agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RetrievalHit {
    pub source_id: SourceId,
    pub citation: String,
    pub snippet: String,
    /// Relevance in [0, 1]
    pub relevance: f32,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub metadata: serde_json::Value,
}

/// Result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentResult {
    pub agent: AgentKind,
    pub source: SourceTag,
    /// Hits ordered by descending relevance
    pub hits: Vec<RetrievalHit>,
    pub latency_ms: i64,
    /// Present when the agent degraded; hits are empty or partial
    pub error: Option<String>,
}

impl AgentResult {
    /// An empty result carrying a degradation annotation.
    pub fn degraded(agent: AgentKind, source: SourceTag, error: impl Into<String>) -> Self {
        Self {
            agent,
            source,
            hits: Vec::new(),
            latency_ms: 0,
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// EXPERT OPINIONS
// ============================================================================

/// A legal basis cited by an expert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct LegalBasis {
    pub citation: String,
    /// Role this basis plays in the argument
    pub role: String,
    /// Weight in [0, 1]
    pub weight: f32,
}

/// Per-dimension confidence breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ConfidenceBreakdown {
    pub norm_clarity: f32,
    pub jurisprudence_alignment: f32,
    pub contextual_ambiguity: f32,
    pub source_availability: f32,
}

impl Default for ConfidenceBreakdown {
    fn default() -> Self {
        Self {
            norm_clarity: 0.5,
            jurisprudence_alignment: 0.5,
            contextual_ambiguity: 0.5,
            source_availability: 0.5,
        }
    }
}

/// Structured opinion produced by one reasoning expert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ExpertOpinion {
    pub expert: ExpertKind,
    /// Interpretation prose
    pub interpretation: String,
    /// Categorical conclusion label used for consensus arithmetic
    pub conclusion_label: String,
    pub legal_bases: Vec<LegalBasis>,
    pub reasoning_steps: Vec<String>,
    pub confidence: f32,
    pub breakdown: ConfidenceBreakdown,
    /// Limitations the expert states about its own opinion
    pub limitations: String,
    pub tokens_used: i64,
    pub latency_ms: i64,
    /// Model and seed recorded for reproducibility
    pub model_id: String,
    pub seed: Option<u64>,
    /// Retry and degradation annotations accumulated during the call
    #[serde(default)]
    pub error_annotations: Vec<String>,
}

// ============================================================================
// PROVISIONAL ANSWER
// ============================================================================

/// Mapping from one claim in the answer to its sources and experts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ProvenanceEntry {
    pub claim: String,
    pub source_ids: Vec<SourceId>,
    pub experts: Vec<ExpertKind>,
}

/// One preserved minority position in a divergent synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AlternativeInterpretation {
    pub position: String,
    pub summary: String,
    pub experts: Vec<ExpertKind>,
    pub confidence: f32,
}

/// Answer produced by the synthesizer at the end of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ProvisionalAnswer {
    pub text: String,
    /// Mode actually used (never `Auto`)
    pub synthesis_mode: SynthesisMode,
    /// Share of experts on the majority conclusion, in [0, 1]
    pub consensus: f32,
    pub confidence: f32,
    pub provenance: Vec<ProvenanceEntry>,
    pub experts_consulted: Vec<ExpertKind>,
    pub uncertainty_preserved: bool,
    /// Populated when the synthesis was divergent
    #[serde(default)]
    pub alternatives: Vec<AlternativeInterpretation>,
}

// ============================================================================
// ITERATION
// ============================================================================

/// Metrics attached to one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct IterationMetrics {
    pub confidence: f32,
    pub consensus: f32,
    /// User rating 1..=5, if submitted
    pub user_rating: Option<f32>,
    /// Authority-weighted community evaluation in [0, 1], if available
    pub rlcf_score: Option<f32>,
}

/// Append-only record of one completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct IterationRecord {
    /// 1-based, contiguous
    pub index: i32,
    pub plan: ExecutionPlan,
    pub answer: ProvisionalAnswer,
    pub metrics: IterationMetrics,
    pub feedback: Option<UserFeedback>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub started_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub completed_at: Timestamp,
}

/// Structured guidance handed to the next router invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RefinementDirective {
    /// Compact summary of the current answer
    pub answer_summary: String,
    /// Gaps implied by expert-stated limitations
    pub gaps: Vec<String>,
    /// Missing-information items from user feedback
    pub missing_information: Vec<String>,
    /// Concerns raised by external quality evaluation
    pub quality_concerns: Vec<String>,
}

impl RefinementDirective {
    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty()
            && self.missing_information.is_empty()
            && self.quality_concerns.is_empty()
    }
}

// ============================================================================
// WARNINGS
// ============================================================================

/// A non-fatal condition recorded on the workflow state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Warning {
    pub kind: WarningKind,
    pub detail: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub at: Timestamp,
}

impl Warning {
    pub fn new(kind: WarningKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            at: chrono::Utc::now(),
        }
    }
}

// ============================================================================
// TRACE RECORD
// ============================================================================

/// Full snapshot of one request, as persisted and as returned by the
/// fetch-by-trace-id endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TraceRecord {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub trace_id: TraceId,
    pub query: QueryRequest,
    pub status: RequestStatus,
    pub stop_reason: Option<StopReason>,
    /// Written once by preprocessing; absent when the request failed earlier
    pub query_context: Option<QueryContext>,
    pub enriched_context: Option<EnrichedContext>,
    /// Append-only, contiguous 1-based indices
    pub iterations: Vec<IterationRecord>,
    pub warnings: Vec<Warning>,
    pub total_duration_ms: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub completed_at: Option<Timestamp>,
}

impl TraceRecord {
    /// The current answer: always the iteration with the highest index.
    pub fn current_answer(&self) -> Option<&ProvisionalAnswer> {
        self.iterations.last().map(|record| &record.answer)
    }
}

// ============================================================================
// GATE RECORDS
// ============================================================================

/// A stored credential. The presented secret is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CredentialRecord {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub credential_id: CredentialId,
    pub hash: CredentialHash,
    pub role: PrincipalRole,
    pub tier: RateLimitTier,
    pub active: bool,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub expires_at: Option<Timestamp>,
    pub description: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub last_used_at: Option<Timestamp>,
}

impl CredentialRecord {
    /// Create an active credential from a raw secret.
    pub fn new(secret: &str, role: PrincipalRole, tier: RateLimitTier) -> Self {
        Self {
            credential_id: CredentialId::now_v7(),
            hash: CredentialHash::digest(secret),
            role,
            tier,
            active: true,
            expires_at: None,
            description: None,
            created_at: chrono::Utc::now(),
            last_used_at: None,
        }
    }

    /// Whether the credential is expired at the given instant.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Append-only usage record written by the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct UsageRecord {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub usage_id: UsageId,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub credential_id: CredentialId,
    pub endpoint: String,
    pub method: String,
    pub status: i32,
    pub duration_ms: i64,
    pub client_addr: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub at: Timestamp,
}

// ============================================================================
// FEEDBACK RECORDS
// ============================================================================

/// End-user feedback on an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct UserFeedback {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub feedback_id: FeedbackId,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub trace_id: TraceId,
    /// Overall rating 1..=5
    pub rating: i32,
    pub text: Option<String>,
    /// Per-category ratings 1..=5 (accuracy, clarity, completeness, ...)
    #[serde(default)]
    pub category_ratings: BTreeMap<String, i32>,
    /// Information the user says is missing
    #[serde(default)]
    pub missing_information: Vec<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub at: Timestamp,
}

/// Structured corrections attached to an external-expert review.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct StructuredCorrections {
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub concept_mapping: Option<serde_json::Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub routing_decision: Option<serde_json::Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub answer_quality: Option<serde_json::Value>,
}

/// Authority-weighted correction from an external domain expert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ExpertCorrection {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub feedback_id: FeedbackId,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub trace_id: TraceId,
    /// External reviewer identity (opaque to the engine)
    pub expert_id: String,
    /// Authority weight in [0, 1]
    pub authority_weight: f32,
    pub corrections: StructuredCorrections,
    /// Overall rating 1..=5
    pub overall_rating: i32,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub at: Timestamp,
}

/// The span payload of an entity correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CorrectionSpan {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub correct_label: Option<EntityKind>,
    pub incorrect_label: Option<EntityKind>,
}

/// A correction to entity extraction on a past trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EntitySpanCorrection {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub feedback_id: FeedbackId,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub trace_id: TraceId,
    pub kind: EntityCorrectionKind,
    pub span: CorrectionSpan,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub at: Timestamp,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_options_defaults() {
        let opts = QueryOptions::default();
        assert_eq!(opts.max_iterations, 3);
        assert_eq!(opts.timeout_ms, 30_000);
        assert!(!opts.return_trace);
    }

    #[test]
    fn test_entity_span_overlap() {
        let a = EntitySpan {
            text: "art. 1321 c.c.".to_string(),
            kind: EntityKind::NormReference,
            start: 10,
            end: 24,
            confidence: 0.95,
        };
        let b = EntitySpan {
            text: "1321".to_string(),
            kind: EntityKind::NormReference,
            start: 15,
            end: 19,
            confidence: 0.6,
        };
        let c = EntitySpan {
            text: "contratto".to_string(),
            kind: EntityKind::LegalConcept,
            start: 30,
            end: 39,
            confidence: 0.8,
        };
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_credential_record_expiry() {
        let mut record = CredentialRecord::new("lx_key", PrincipalRole::User, RateLimitTier::Standard);
        let now = chrono::Utc::now();
        assert!(!record.is_expired(now));

        record.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(record.is_expired(now));

        record.expires_at = Some(now + chrono::Duration::hours(1));
        assert!(!record.is_expired(now));
    }

    #[test]
    fn test_agent_invocation_defaults() {
        let inv = AgentInvocation::new(AgentKind::Vector, "contratto preliminare");
        assert_eq!(inv.top_k, 10);
        assert_eq!(inv.query_rewrites.len(), 1);
        assert!(inv.filters.is_empty());
    }

    #[test]
    fn test_enriched_context_counts() {
        let mut ctx = EnrichedContext::default();
        assert!(ctx.is_empty());
        ctx.norms.push(EnrichedItem {
            source_id: "norm:cc:1321".to_string(),
            citation: "Art. 1321 c.c.".to_string(),
            summary: "Nozione di contratto".to_string(),
            source: SourceTag::Normattiva,
            confidence: 0.9,
        });
        assert_eq!(ctx.item_count(), 1);
        assert!(!ctx.is_empty());
    }

    #[test]
    fn test_answer_serde_roundtrip() {
        let answer = ProvisionalAnswer {
            text: "Il contratto è l'accordo di due o più parti.".to_string(),
            synthesis_mode: SynthesisMode::Convergent,
            consensus: 1.0,
            confidence: 0.92,
            provenance: vec![ProvenanceEntry {
                claim: "Il contratto è l'accordo di due o più parti.".to_string(),
                source_ids: vec!["norm:cc:1321".to_string()],
                experts: vec![ExpertKind::Literal],
            }],
            experts_consulted: vec![ExpertKind::Literal],
            uncertainty_preserved: false,
            alternatives: Vec::new(),
        };
        let json = serde_json::to_string(&answer).unwrap();
        let back: ProvisionalAnswer = serde_json::from_str(&json).unwrap();
        assert_eq!(answer, back);
    }

    #[test]
    fn test_refinement_directive_emptiness() {
        let mut directive = RefinementDirective::default();
        assert!(directive.is_empty());
        directive.missing_information.push("recent case law".to_string());
        assert!(!directive.is_empty());
    }
}
