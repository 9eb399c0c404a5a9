//! Enum types for Lexflow entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// QUERY UNDERSTANDING
// ============================================================================

/// Classified intent of a legal query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum IntentTag {
    /// Locate the text of a norm
    NormSearch,
    /// Interpret the meaning or scope of a norm
    Interpretation,
    /// Check conduct against obligations
    ComplianceCheck,
    /// Draft or review a legal document
    DocumentDrafting,
    /// Identify sanctions and exposure
    RiskSpotting,
    /// Could not be classified
    Unknown,
}

impl IntentTag {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::NormSearch => "norm-search",
            Self::Interpretation => "interpretation",
            Self::ComplianceCheck => "compliance-check",
            Self::DocumentDrafting => "document-drafting",
            Self::RiskSpotting => "risk-spotting",
            Self::Unknown => "unknown",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "norm-search" => Ok(Self::NormSearch),
            "interpretation" => Ok(Self::Interpretation),
            "compliance-check" => Ok(Self::ComplianceCheck),
            "document-drafting" => Ok(Self::DocumentDrafting),
            "risk-spotting" => Ok(Self::RiskSpotting),
            "unknown" => Ok(Self::Unknown),
            _ => Err(EnumParseError::new("IntentTag", s)),
        }
    }
}

/// Kind of entity span extracted from a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    /// Reference to a codified norm (e.g. "art. 1321 c.c.")
    NormReference,
    /// Reference to case law (e.g. "Cass. civ. 12345/2020")
    CaseReference,
    /// A date or temporal expression
    Date,
    /// A party role (e.g. "debitore", "locatore")
    PartyRole,
    /// A controlled-vocabulary legal concept
    LegalConcept,
    /// Jurisdiction or territorial scope
    Jurisdiction,
    /// Anything else the extractor tagged
    Other,
}

// ============================================================================
// PLANNING & EXECUTION
// ============================================================================

/// Retrieval agent discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// Graph-store retrieval (norms, cases, doctrine, contributions)
    Graph,
    /// Normative-text HTTP service retrieval
    Http,
    /// Vector-store semantic retrieval
    Vector,
}

impl AgentKind {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Graph => "graph",
            Self::Http => "http",
            Self::Vector => "vector",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "graph" => Ok(Self::Graph),
            "http" => Ok(Self::Http),
            "vector" => Ok(Self::Vector),
            _ => Err(EnumParseError::new("AgentKind", s)),
        }
    }
}

/// Reasoning expert discriminator. Each variant embodies a distinct
/// interpretive methodology; dispatch is by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum ExpertKind {
    /// Textual/literal interpretation
    Literal,
    /// Purposive and systemic interpretation
    SystemicTeleological,
    /// Balancing of competing principles
    PrinciplesBalancer,
    /// Precedent-driven empirical analysis
    PrecedentAnalyst,
}

impl ExpertKind {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Literal => "literal",
            Self::SystemicTeleological => "systemic-teleological",
            Self::PrinciplesBalancer => "principles-balancer",
            Self::PrecedentAnalyst => "precedent-analyst",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "literal" => Ok(Self::Literal),
            "systemic-teleological" => Ok(Self::SystemicTeleological),
            "principles-balancer" => Ok(Self::PrinciplesBalancer),
            "precedent-analyst" => Ok(Self::PrecedentAnalyst),
            _ => Err(EnumParseError::new("ExpertKind", s)),
        }
    }

    /// All known experts, in canonical order.
    pub fn all() -> [ExpertKind; 4] {
        [
            Self::Literal,
            Self::SystemicTeleological,
            Self::PrinciplesBalancer,
            Self::PrecedentAnalyst,
        ]
    }
}

/// How expert opinions are folded into an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum SynthesisMode {
    /// Single integrated narrative, dissent subordinated
    Convergent,
    /// Multi-position narrative, dissent preserved
    Divergent,
    /// Synthesizer chooses post-hoc from opinion spread
    #[default]
    Auto,
}

impl SynthesisMode {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Convergent => "convergent",
            Self::Divergent => "divergent",
            Self::Auto => "auto",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "convergent" => Ok(Self::Convergent),
            "divergent" => Ok(Self::Divergent),
            "auto" => Ok(Self::Auto),
            _ => Err(EnumParseError::new("SynthesisMode", s)),
        }
    }
}

/// Origin of a retrieval hit or enrichment item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum SourceTag {
    /// Official normative texts
    Normattiva,
    /// Supreme court case law
    Cassazione,
    /// Doctrinal literature
    Doctrine,
    /// Community contributions
    Community,
    /// Vector-store semantic neighbors
    Vector,
}

impl SourceTag {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Normattiva => "normattiva",
            Self::Cassazione => "cassazione",
            Self::Doctrine => "doctrine",
            Self::Community => "community",
            Self::Vector => "vector",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "normattiva" => Ok(Self::Normattiva),
            "cassazione" => Ok(Self::Cassazione),
            "doctrine" => Ok(Self::Doctrine),
            "community" => Ok(Self::Community),
            "vector" => Ok(Self::Vector),
            _ => Err(EnumParseError::new("SourceTag", s)),
        }
    }
}

// ============================================================================
// ITERATION
// ============================================================================

/// Why the iteration controller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// Iteration budget exhausted
    MaxIterations,
    /// Confidence and consensus both above their thresholds
    HighConfidenceAndConsensus,
    /// Community-feedback evaluation approved the answer
    RlcfApproved,
    /// User rating at or above the satisfaction threshold
    UserSatisfied,
    /// Mean confidence/consensus delta below the improvement threshold
    NoImprovement,
    /// Confidence and consensus spread both below the convergence threshold
    Converged,
    /// Request deadline tripped; best-seen answer returned
    Timeout,
}

impl StopReason {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::MaxIterations => "max-iterations",
            Self::HighConfidenceAndConsensus => "high-confidence-and-consensus",
            Self::RlcfApproved => "rlcf-approved",
            Self::UserSatisfied => "user-satisfied",
            Self::NoImprovement => "no-improvement",
            Self::Converged => "converged",
            Self::Timeout => "timeout",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "max-iterations" => Ok(Self::MaxIterations),
            "high-confidence-and-consensus" => Ok(Self::HighConfidenceAndConsensus),
            "rlcf-approved" => Ok(Self::RlcfApproved),
            "user-satisfied" => Ok(Self::UserSatisfied),
            "no-improvement" => Ok(Self::NoImprovement),
            "converged" => Ok(Self::Converged),
            "timeout" => Ok(Self::Timeout),
            _ => Err(EnumParseError::new("StopReason", s)),
        }
    }
}

/// Final status of a processed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    /// All requested work completed
    Success,
    /// At least one iteration completed, but degraded or timed out
    Partial,
    /// No usable answer was produced
    Failed,
}

impl RequestStatus {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            _ => Err(EnumParseError::new("RequestStatus", s)),
        }
    }
}

/// Non-fatal conditions recorded on the workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum WarningKind {
    /// LLM understanding failed; heuristic-only context in use
    UnderstandingDegraded,
    /// Graph enrichment unavailable; understanding-only context in use
    EnrichmentDegraded,
    /// Counter store unreachable; request admitted without quota charge
    RateLimitBypassed,
    /// A retrieval agent failed or timed out
    AgentDegraded,
    /// An expert fell back to its minimal opinion
    ExpertDegraded,
    /// The synthesis narrative fell back to deterministic assembly
    SynthesisDegraded,
    /// A synthesized claim had no provenance mapping and was dropped
    ProvenanceDropped,
    /// Cache read or write skipped
    CacheUnavailable,
    /// A durable write failed (not retried in-band)
    DurableWriteFailed,
    /// Request deadline tripped
    Timeout,
}

// ============================================================================
// GATE
// ============================================================================

/// Role attached to a verified principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum PrincipalRole {
    Admin,
    User,
    Guest,
}

impl PrincipalRole {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Guest => "guest",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            "guest" => Ok(Self::Guest),
            _ => Err(EnumParseError::new("PrincipalRole", s)),
        }
    }

    /// Whether this role satisfies a required role.
    pub fn satisfies(&self, required: PrincipalRole) -> bool {
        match required {
            Self::Admin => matches!(self, Self::Admin),
            Self::User => matches!(self, Self::Admin | Self::User),
            Self::Guest => true,
        }
    }
}

/// Quota class attached to a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitTier {
    Unlimited,
    Premium,
    Standard,
    Limited,
}

impl RateLimitTier {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Unlimited => "unlimited",
            Self::Premium => "premium",
            Self::Standard => "standard",
            Self::Limited => "limited",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "unlimited" => Ok(Self::Unlimited),
            "premium" => Ok(Self::Premium),
            "standard" => Ok(Self::Standard),
            "limited" => Ok(Self::Limited),
            _ => Err(EnumParseError::new("RateLimitTier", s)),
        }
    }

    /// Requests allowed per sliding window.
    pub fn quota(&self) -> u32 {
        match self {
            Self::Unlimited => u32::MAX,
            Self::Premium => 1000,
            Self::Standard => 100,
            Self::Limited => 10,
        }
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Freshness class of an enrichment payload, driving cache TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum EntityClass {
    /// Official norms: stable for at least a week
    Norm,
    /// Case law: refreshed daily
    CaseLaw,
    /// Doctrine: refreshed every few days
    Doctrine,
    /// Community contributions: volatile
    Community,
    /// Consensus snapshots: short-lived
    Consensus,
}

impl EntityClass {
    /// Default cache TTL for payloads of this class.
    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::Norm => Duration::from_secs(7 * 24 * 3600),
            Self::CaseLaw => Duration::from_secs(24 * 3600),
            Self::Doctrine => Duration::from_secs(3 * 24 * 3600),
            Self::Community => Duration::from_secs(3600),
            Self::Consensus => Duration::from_secs(30 * 60),
        }
    }
}

// ============================================================================
// FEEDBACK
// ============================================================================

/// Kind of entity-span correction submitted against a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum EntityCorrectionKind {
    MissingEntity,
    SpuriousEntity,
    WrongBoundary,
    WrongType,
}

// ============================================================================
// PARSE ERROR
// ============================================================================

/// Error parsing an enum from its database string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub enum_name: &'static str,
    pub input: String,
}

impl EnumParseError {
    pub fn new(enum_name: &'static str, input: &str) -> Self {
        Self {
            enum_name,
            input: input.to_string(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} value: {}", self.enum_name, self.input)
    }
}

impl std::error::Error for EnumParseError {}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_tag_roundtrip() {
        for tag in [
            IntentTag::NormSearch,
            IntentTag::Interpretation,
            IntentTag::ComplianceCheck,
            IntentTag::DocumentDrafting,
            IntentTag::RiskSpotting,
            IntentTag::Unknown,
        ] {
            let s = tag.as_db_str();
            let parsed = IntentTag::from_db_str(s).unwrap();
            assert_eq!(tag, parsed);
        }
    }

    #[test]
    fn test_expert_kind_roundtrip() {
        for expert in ExpertKind::all() {
            let s = expert.as_db_str();
            let parsed = ExpertKind::from_db_str(s).unwrap();
            assert_eq!(expert, parsed);
        }
    }

    #[test]
    fn test_stop_reason_roundtrip() {
        for reason in [
            StopReason::MaxIterations,
            StopReason::HighConfidenceAndConsensus,
            StopReason::RlcfApproved,
            StopReason::UserSatisfied,
            StopReason::NoImprovement,
            StopReason::Converged,
            StopReason::Timeout,
        ] {
            let s = reason.as_db_str();
            let parsed = StopReason::from_db_str(s).unwrap();
            assert_eq!(reason, parsed);
        }
    }

    #[test]
    fn test_tier_quotas() {
        assert_eq!(RateLimitTier::Premium.quota(), 1000);
        assert_eq!(RateLimitTier::Standard.quota(), 100);
        assert_eq!(RateLimitTier::Limited.quota(), 10);
        assert_eq!(RateLimitTier::Unlimited.quota(), u32::MAX);
    }

    #[test]
    fn test_role_satisfies() {
        assert!(PrincipalRole::Admin.satisfies(PrincipalRole::User));
        assert!(PrincipalRole::Admin.satisfies(PrincipalRole::Admin));
        assert!(PrincipalRole::User.satisfies(PrincipalRole::Guest));
        assert!(!PrincipalRole::User.satisfies(PrincipalRole::Admin));
        assert!(!PrincipalRole::Guest.satisfies(PrincipalRole::User));
    }

    #[test]
    fn test_entity_class_ttl_ordering() {
        // Norms outlive doctrine, which outlives case law, down to consensus
        assert!(EntityClass::Norm.default_ttl() > EntityClass::Doctrine.default_ttl());
        assert!(EntityClass::Doctrine.default_ttl() > EntityClass::CaseLaw.default_ttl());
        assert!(EntityClass::CaseLaw.default_ttl() > EntityClass::Community.default_ttl());
        assert!(EntityClass::Community.default_ttl() > EntityClass::Consensus.default_ttl());
    }

    #[test]
    fn test_serde_kebab_case() {
        let json = serde_json::to_string(&IntentTag::NormSearch).unwrap();
        assert_eq!(json, "\"norm-search\"");
        let json = serde_json::to_string(&StopReason::HighConfidenceAndConsensus).unwrap();
        assert_eq!(json, "\"high-confidence-and-consensus\"");
    }

    #[test]
    fn test_enum_parse_error_message() {
        let err = IntentTag::from_db_str("bogus").unwrap_err();
        assert_eq!(err.to_string(), "invalid IntentTag value: bogus");
    }
}
