//! Preprocessing node
//!
//! Produces the read-only query context and the enriched context, once per
//! request, before the iteration loop:
//! 1. Heuristic pass: compiled regex tables over norm citations, dates,
//!    party roles, and a controlled concept lexicon.
//! 2. LLM pass under the JSON-output contract; heuristic spans win on
//!    overlap, the model supplements what the patterns missed.
//! 3. Graph enrichment keyed by intent shape, fingerprint-cached.
//!
//! Degradation ladder: LLM failure falls back to heuristic-only output,
//! graph failure to understanding-only enrichment, cache failure to
//! uncached enrichment. Preprocessing never aborts the workflow.

use lexflow_core::{
    EngineConfig, EnrichedContext, EntityKind, EntitySpan, IntentTag, QueryContext, QueryRequest,
    WarningKind,
};
use lexflow_llm::{call_structured, ChatProvider, ChatRequest, StructuredOutput};
use lexflow_retrieval::GraphClient;
use lexflow_storage::{CacheBackend, Fingerprint};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// HEURISTIC TABLES
// ============================================================================

static NORM_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // "art. 1321 c.c.", "artt. 1321-1322 c.p.c.", "art. 2 cost."
        Regex::new(r"(?i)artt?\.\s*\d+(?:\s*-\s*\d+)?(?:\s*(?:bis|ter|quater))?(?:\s*,?\s*comma\s*\d+)?\s*(?:c\.c\.|c\.p\.c\.|c\.p\.|cost\.)").expect("norm pattern"),
        // "d.lgs. 231/2001", "d.p.r. 445/2000"
        Regex::new(r"(?i)d\.\s*(?:lgs|p\.r|l)\.\s*(?:n\.\s*)?\d+/\d{4}").expect("decree pattern"),
        // "legge 241/1990", "l. 104/1992"
        Regex::new(r"(?i)(?:legge|l\.)\s*(?:n\.\s*)?\d+/\d{4}").expect("statute pattern"),
    ]
});

static CASE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    // "Cass. civ. 12345/2020", "Cass. Sez. Un. 500/1999"
    Regex::new(r"(?i)cass\.\s*(?:civ\.|pen\.|sez\.\s*un\.)?\s*(?:n\.\s*)?\d+/\d{4}")
        .expect("case pattern")
});

static DATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\b\d{1,2}/\d{1,2}/\d{4}\b").expect("numeric date pattern"),
        Regex::new(r"(?i)\b\d{1,2}\s+(?:gennaio|febbraio|marzo|aprile|maggio|giugno|luglio|agosto|settembre|ottobre|novembre|dicembre)\s+\d{4}\b").expect("verbal date pattern"),
    ]
});

const PARTY_ROLES: &[&str] = &[
    "venditore",
    "compratore",
    "acquirente",
    "locatore",
    "conduttore",
    "debitore",
    "creditore",
    "lavoratore",
    "datore di lavoro",
    "donante",
    "donatario",
    "minore",
    "tutore",
    "erede",
    "consumatore",
];

const CONCEPT_LEXICON: &[&str] = &[
    "contratto",
    "contratto preliminare",
    "donazione",
    "emancipazione",
    "obbligazione",
    "responsabilità",
    "risarcimento",
    "inadempimento",
    "prescrizione",
    "decadenza",
    "recesso",
    "garanzia",
    "locazione",
    "compravendita",
    "usufrutto",
    "ipoteca",
    "sanzione",
    "nullità",
    "annullabilità",
    "clausola vessatoria",
];

/// Run the compiled tables over the query text.
fn heuristic_entities(text: &str) -> Vec<EntitySpan> {
    let lowered = text.to_lowercase();
    let mut spans = Vec::new();

    for pattern in NORM_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            spans.push(EntitySpan {
                text: m.as_str().to_string(),
                kind: EntityKind::NormReference,
                start: m.start(),
                end: m.end(),
                confidence: 0.95,
            });
        }
    }

    for m in CASE_PATTERN.find_iter(text) {
        spans.push(EntitySpan {
            text: m.as_str().to_string(),
            kind: EntityKind::CaseReference,
            start: m.start(),
            end: m.end(),
            confidence: 0.95,
        });
    }

    for pattern in DATE_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            spans.push(EntitySpan {
                text: m.as_str().to_string(),
                kind: EntityKind::Date,
                start: m.start(),
                end: m.end(),
                confidence: 0.9,
            });
        }
    }

    // Offsets come from the lowercased text; spans that do not land on a
    // char boundary of the original are skipped
    for role in PARTY_ROLES {
        for (start, _) in lowered.match_indices(role) {
            if let Some(slice) = text.get(start..start + role.len()) {
                spans.push(EntitySpan {
                    text: slice.to_string(),
                    kind: EntityKind::PartyRole,
                    start,
                    end: start + role.len(),
                    confidence: 0.8,
                });
            }
        }
    }

    for concept in CONCEPT_LEXICON {
        for (start, _) in lowered.match_indices(concept) {
            if let Some(slice) = text.get(start..start + concept.len()) {
                spans.push(EntitySpan {
                    text: slice.to_string(),
                    kind: EntityKind::LegalConcept,
                    start,
                    end: start + concept.len(),
                    confidence: 0.85,
                });
            }
        }
    }

    // Longest-span-first so contained matches ("contratto" inside
    // "contratto preliminare") are dropped by the overlap filter
    spans.sort_by_key(|s| (s.start, std::cmp::Reverse(s.end)));
    let mut kept: Vec<EntitySpan> = Vec::new();
    for span in spans {
        if !kept.iter().any(|k| k.overlaps(&span)) {
            kept.push(span);
        }
    }
    kept
}

/// Rule-based intent guess used when the LLM pass is unavailable.
fn heuristic_intent(text: &str, entities: &[EntitySpan]) -> (IntentTag, f32) {
    let lowered = text.to_lowercase();
    let has_norm_ref = entities.iter().any(|e| e.kind == EntityKind::NormReference);

    if lowered.contains("redigere") || lowered.contains("bozza") || lowered.contains("redazione") {
        (IntentTag::DocumentDrafting, 0.6)
    } else if lowered.contains("rischi") || lowered.contains("sanzion") {
        (IntentTag::RiskSpotting, 0.6)
    } else if lowered.contains("conforme")
        || lowered.contains("adempiere")
        || lowered.contains("obblig")
    {
        (IntentTag::ComplianceCheck, 0.55)
    } else if has_norm_ref
        && (lowered.contains("cosa prevede")
            || lowered.contains("cosa dice")
            || lowered.contains("testo"))
    {
        (IntentTag::NormSearch, 0.75)
    } else if lowered.contains("può")
        || lowered.contains("significa")
        || lowered.contains("interpretazione")
        || lowered.ends_with('?')
    {
        (IntentTag::Interpretation, 0.5)
    } else {
        (IntentTag::Unknown, 0.3)
    }
}

// ============================================================================
// LLM UNDERSTANDING
// ============================================================================

#[derive(Debug, Deserialize)]
struct UnderstandingOutput {
    intent: String,
    intent_confidence: f32,
    entities: Vec<UnderstandingEntity>,
    concepts: Vec<String>,
    dates: Vec<String>,
    overall_confidence: f32,
}

#[derive(Debug, Deserialize)]
struct UnderstandingEntity {
    text: String,
    kind: String,
    start: usize,
    end: usize,
    confidence: f32,
}

impl StructuredOutput for UnderstandingOutput {
    fn schema_hint() -> &'static str {
        r#"{
  "intent": "norm-search|interpretation|compliance-check|document-drafting|risk-spotting|unknown",
  "intent_confidence": 0.0,
  "entities": [{"text": "...", "kind": "norm-reference|case-reference|date|party-role|legal-concept|jurisdiction|other", "start": 0, "end": 0, "confidence": 0.0}],
  "concepts": ["..."],
  "dates": ["..."],
  "overall_confidence": 0.0
}"#
    }

    fn validate(&self) -> Result<(), String> {
        IntentTag::from_db_str(&self.intent).map_err(|e| e.to_string())?;
        for value in [self.intent_confidence, self.overall_confidence] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("confidence {} out of range", value));
            }
        }
        for entity in &self.entities {
            if entity.end < entity.start {
                return Err(format!(
                    "entity '{}' has end {} before start {}",
                    entity.text, entity.end, entity.start
                ));
            }
        }
        Ok(())
    }
}

fn entity_kind_from_str(s: &str) -> EntityKind {
    match s {
        "norm-reference" => EntityKind::NormReference,
        "case-reference" => EntityKind::CaseReference,
        "date" => EntityKind::Date,
        "party-role" => EntityKind::PartyRole,
        "legal-concept" => EntityKind::LegalConcept,
        "jurisdiction" => EntityKind::Jurisdiction,
        _ => EntityKind::Other,
    }
}

const UNDERSTANDING_SYSTEM: &str = "You are the query-understanding stage of an \
Italian legal research engine. Classify the user's intent, extract typed entity \
spans with exact character offsets into the original text, list the legal \
concepts involved using lowercase Italian vocabulary, and extract any dates.";

// ============================================================================
// PREPROCESSOR
// ============================================================================

/// Outcome of the preprocessing node. Warnings are returned, not raised.
#[derive(Debug)]
pub struct PreprocessOutcome {
    pub query_context: QueryContext,
    pub enriched_context: EnrichedContext,
    pub warnings: Vec<(WarningKind, String)>,
}

/// The preprocessing node. Runs exactly once per request.
pub struct Preprocessor {
    chat: Arc<dyn ChatProvider>,
    graph: Option<GraphClient>,
    cache: Option<Arc<dyn CacheBackend>>,
    config: EngineConfig,
}

impl Preprocessor {
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        graph: Option<GraphClient>,
        cache: Option<Arc<dyn CacheBackend>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            chat,
            graph,
            cache,
            config,
        }
    }

    /// Produce query context and enriched context for a request.
    pub async fn run(&self, request: &QueryRequest) -> PreprocessOutcome {
        let mut warnings = Vec::new();

        let query_context = self.understand(&request.text, &mut warnings).await;
        let jurisdiction = request
            .hints
            .as_ref()
            .and_then(|h| h.jurisdiction.as_deref());
        let enriched_context = self
            .enrich(&query_context, jurisdiction, &mut warnings)
            .await;

        PreprocessOutcome {
            query_context,
            enriched_context,
            warnings,
        }
    }

    /// Query understanding: heuristic pass merged with the LLM pass.
    async fn understand(
        &self,
        text: &str,
        warnings: &mut Vec<(WarningKind, String)>,
    ) -> QueryContext {
        let heuristic = heuristic_entities(text);

        let llm_result = tokio::time::timeout(
            self.config.timeouts.preprocessing,
            call_structured::<UnderstandingOutput>(
                self.chat.as_ref(),
                UNDERSTANDING_SYSTEM,
                ChatRequest::new(text.to_string())
                    .with_temperature(self.config.llm.temperature_router),
                self.config.llm.json_max_retries,
            ),
        )
        .await;

        match llm_result {
            Ok(Ok(outcome)) => {
                let output = outcome.value;
                // serde can't know about the enum table; re-parse is safe here
                // because validate() already checked membership
                let intent = IntentTag::from_db_str(&output.intent).unwrap_or(IntentTag::Unknown);
                let entities = merge_entities(text, heuristic, &output.entities);
                let complexity = (1.0 - output.overall_confidence).clamp(0.0, 1.0);
                let norm_references = references_of(&entities, EntityKind::NormReference);
                let mut temporal_hints = references_of(&entities, EntityKind::Date);
                for date in output.dates {
                    if !temporal_hints.contains(&date) {
                        temporal_hints.push(date);
                    }
                }

                let mut concepts: Vec<String> = output
                    .concepts
                    .into_iter()
                    .map(|c| c.to_lowercase())
                    .collect();
                for span in entities
                    .iter()
                    .filter(|e| e.kind == EntityKind::LegalConcept)
                {
                    let lowered = span.text.to_lowercase();
                    if !concepts.contains(&lowered) {
                        concepts.push(lowered);
                    }
                }
                concepts.sort_unstable();
                concepts.dedup();

                QueryContext {
                    intent,
                    intent_confidence: output.intent_confidence,
                    complexity,
                    entities,
                    concepts,
                    norm_references,
                    temporal_hints,
                }
            }
            Ok(Err(e)) => {
                warnings.push((WarningKind::UnderstandingDegraded, e.to_string()));
                self.heuristic_only(text, heuristic)
            }
            Err(_) => {
                warnings.push((
                    WarningKind::UnderstandingDegraded,
                    format!(
                        "understanding timed out after {:?}",
                        self.config.timeouts.preprocessing
                    ),
                ));
                self.heuristic_only(text, heuristic)
            }
        }
    }

    fn heuristic_only(&self, text: &str, entities: Vec<EntitySpan>) -> QueryContext {
        let (intent, intent_confidence) = heuristic_intent(text, &entities);
        let mut concepts: Vec<String> = entities
            .iter()
            .filter(|e| e.kind == EntityKind::LegalConcept)
            .map(|e| e.text.to_lowercase())
            .collect();
        concepts.sort_unstable();
        concepts.dedup();

        QueryContext {
            intent,
            intent_confidence,
            // Heuristics alone never see past surface patterns
            complexity: (1.0 - intent_confidence).clamp(0.0, 1.0),
            norm_references: references_of(&entities, EntityKind::NormReference),
            temporal_hints: references_of(&entities, EntityKind::Date),
            entities,
            concepts,
        }
    }

    /// Graph enrichment with fingerprint caching and degradation.
    async fn enrich(
        &self,
        context: &QueryContext,
        jurisdiction: Option<&str>,
        warnings: &mut Vec<(WarningKind, String)>,
    ) -> EnrichedContext {
        if !self.config.enrichment_enabled {
            return EnrichedContext::default();
        }

        let Some(graph) = &self.graph else {
            warnings.push((
                WarningKind::EnrichmentDegraded,
                "graph-unavailable: no graph store configured".to_string(),
            ));
            return EnrichedContext::default();
        };

        let fingerprint = Fingerprint::for_enrichment(context, jurisdiction);

        // Cache read is strongly preferred before the expensive graph pass
        if self.config.cache_enabled {
            if let Some(cache) = &self.cache {
                match cache.get(&fingerprint).await {
                    Ok(Some(payload)) => {
                        if let Ok(cached) = serde_json::from_value::<EnrichedContext>(payload) {
                            tracing::debug!(%fingerprint, "enrichment cache hit");
                            return cached;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warnings.push((WarningKind::CacheUnavailable, e.to_string()));
                    }
                }
            }
        }

        let mut keys: Vec<String> = context.concepts.clone();
        keys.extend(context.norm_references.iter().cloned());

        let enriched = tokio::time::timeout(
            self.config.timeouts.preprocessing,
            graph.enrich(context.intent, &keys, self.config.agents.topk_default as i64),
        )
        .await;

        match enriched {
            Ok(Ok(enriched)) => {
                if self.config.cache_enabled {
                    if let Some(cache) = &self.cache {
                        let ttl = enrichment_ttl(&enriched, &self.config);
                        if let Ok(payload) = serde_json::to_value(&enriched) {
                            if let Err(e) = cache.put(&fingerprint, &payload, ttl).await {
                                warnings.push((WarningKind::CacheUnavailable, e.to_string()));
                            }
                        }
                    }
                }
                enriched
            }
            Ok(Err(e)) => {
                warnings.push((
                    WarningKind::EnrichmentDegraded,
                    format!("graph-unavailable: {}", e),
                ));
                EnrichedContext::default()
            }
            Err(_) => {
                warnings.push((
                    WarningKind::EnrichmentDegraded,
                    format!(
                        "graph-timeout: enrichment exceeded {:?}",
                        self.config.timeouts.preprocessing
                    ),
                ));
                EnrichedContext::default()
            }
        }
    }
}

/// The snapshot expires with its most volatile populated category.
fn enrichment_ttl(enriched: &EnrichedContext, config: &EngineConfig) -> Duration {
    use lexflow_core::EntityClass;

    let mut ttl = config.cache_ttl.for_class(EntityClass::Norm);
    if !enriched.case_law.is_empty() {
        ttl = ttl.min(config.cache_ttl.for_class(EntityClass::CaseLaw));
    }
    if !enriched.doctrine.is_empty() {
        ttl = ttl.min(config.cache_ttl.for_class(EntityClass::Doctrine));
    }
    if !enriched.community.is_empty() {
        ttl = ttl.min(config.cache_ttl.for_class(EntityClass::Community));
    }
    ttl
}

fn references_of(entities: &[EntitySpan], kind: EntityKind) -> Vec<String> {
    entities
        .iter()
        .filter(|e| e.kind == kind)
        .map(|e| e.text.clone())
        .collect()
}

/// Merge policy: heuristic spans win on overlap; the model supplements what
/// the patterns missed. Spans whose offsets don't match the text are dropped.
fn merge_entities(
    text: &str,
    heuristic: Vec<EntitySpan>,
    llm_entities: &[UnderstandingEntity],
) -> Vec<EntitySpan> {
    let mut merged = heuristic;

    for entity in llm_entities {
        if entity.end > text.len() {
            continue;
        }
        let candidate = EntitySpan {
            text: entity.text.clone(),
            kind: entity_kind_from_str(&entity.kind),
            start: entity.start,
            end: entity.end,
            confidence: entity.confidence.clamp(0.0, 1.0),
        };
        if !merged.iter().any(|kept| kept.overlaps(&candidate)) {
            merged.push(candidate);
        }
    }

    merged.sort_by_key(|s| s.start);
    merged
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use lexflow_llm::MockChatProvider;
    use lexflow_storage::MemoryCache;

    #[test]
    fn test_heuristic_norm_reference() {
        let spans = heuristic_entities("Cosa prevede l'art. 1321 c.c. sui contratti?");
        let norm = spans
            .iter()
            .find(|s| s.kind == EntityKind::NormReference)
            .expect("norm reference should be found");
        assert_eq!(norm.text, "art. 1321 c.c.");
    }

    #[test]
    fn test_heuristic_decree_and_case() {
        let spans =
            heuristic_entities("Sanzioni ex d.lgs. 231/2001 secondo Cass. civ. 12345/2020");
        assert!(spans.iter().any(|s| s.kind == EntityKind::NormReference));
        assert!(spans.iter().any(|s| s.kind == EntityKind::CaseReference));
    }

    #[test]
    fn test_heuristic_longest_span_wins() {
        let spans = heuristic_entities("È valido il contratto preliminare di vendita?");
        let concepts: Vec<&str> = spans
            .iter()
            .filter(|s| s.kind == EntityKind::LegalConcept)
            .map(|s| s.text.as_str())
            .collect();
        assert!(concepts.contains(&"contratto preliminare"));
        assert!(!concepts.contains(&"contratto"));
    }

    #[test]
    fn test_heuristic_intent_norm_search() {
        let text = "Cosa prevede l'art. 1321 c.c.?";
        let entities = heuristic_entities(text);
        let (intent, confidence) = heuristic_intent(text, &entities);
        assert_eq!(intent, IntentTag::NormSearch);
        assert!(confidence > 0.5);
    }

    #[test]
    fn test_merge_heuristic_wins_on_overlap() {
        let text = "Cosa prevede l'art. 1321 c.c.?";
        let heuristic = heuristic_entities(text);
        let llm = vec![
            UnderstandingEntity {
                // Overlaps the heuristic norm reference: dropped
                text: "1321".to_string(),
                kind: "norm-reference".to_string(),
                start: 20,
                end: 24,
                confidence: 0.7,
            },
            UnderstandingEntity {
                // New span: kept
                text: "prevede".to_string(),
                kind: "other".to_string(),
                start: 5,
                end: 12,
                confidence: 0.5,
            },
        ];

        let merged = merge_entities(text, heuristic.clone(), &llm);
        assert_eq!(merged.len(), heuristic.len() + 1);
        assert!(merged.iter().any(|s| s.text == "prevede"));
        assert!(!merged.iter().any(|s| s.text == "1321"));
    }

    #[test]
    fn test_merge_drops_out_of_bounds_span() {
        let text = "breve";
        let llm = vec![UnderstandingEntity {
            text: "fuori".to_string(),
            kind: "other".to_string(),
            start: 10,
            end: 20,
            confidence: 0.5,
        }];
        let merged = merge_entities(text, Vec::new(), &llm);
        assert!(merged.is_empty());
    }

    fn understanding_json() -> String {
        serde_json::json!({
            "intent": "norm-search",
            "intent_confidence": 0.92,
            "entities": [],
            "concepts": ["contratto"],
            "dates": [],
            "overall_confidence": 0.9
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_preprocess_happy_path() {
        let chat = Arc::new(MockChatProvider::fixed(understanding_json()));
        let preprocessor = Preprocessor::new(chat, None, None, EngineConfig::default());

        let request = QueryRequest {
            text: "Cosa prevede l'art. 1321 c.c. sul contratto?".to_string(),
            session_id: None,
            hints: None,
            options: Default::default(),
        };
        let outcome = preprocessor.run(&request).await;

        assert_eq!(outcome.query_context.intent, IntentTag::NormSearch);
        assert!((outcome.query_context.complexity - 0.1).abs() < 1e-5);
        assert!(outcome
            .query_context
            .norm_references
            .contains(&"art. 1321 c.c.".to_string()));
        assert!(outcome.query_context.concepts.contains(&"contratto".to_string()));
        // No graph configured but enrichment disabled by default config
        assert!(outcome.enriched_context.is_empty());
    }

    #[tokio::test]
    async fn test_preprocess_llm_failure_degrades_to_heuristics() {
        let chat = Arc::new(MockChatProvider::fixed("not json"));
        let mut config = EngineConfig::default();
        config.llm.json_max_retries = 1;
        let preprocessor = Preprocessor::new(chat, None, None, config);

        let request = QueryRequest {
            text: "Cosa prevede l'art. 1321 c.c.?".to_string(),
            session_id: None,
            hints: None,
            options: Default::default(),
        };
        let outcome = preprocessor.run(&request).await;

        assert_eq!(outcome.query_context.intent, IntentTag::NormSearch);
        assert!(outcome
            .warnings
            .iter()
            .any(|(kind, _)| *kind == WarningKind::UnderstandingDegraded));
    }

    #[tokio::test]
    async fn test_preprocess_enrichment_degrades_without_graph() {
        let chat = Arc::new(MockChatProvider::fixed(understanding_json()));
        let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new());
        let config = EngineConfig::standard();
        let preprocessor = Preprocessor::new(chat, None, Some(cache), config);

        let request = QueryRequest {
            text: "Cosa prevede l'art. 1321 c.c.?".to_string(),
            session_id: None,
            hints: None,
            options: Default::default(),
        };
        let outcome = preprocessor.run(&request).await;

        assert!(outcome.enriched_context.is_empty());
        assert!(outcome
            .warnings
            .iter()
            .any(|(kind, detail)| *kind == WarningKind::EnrichmentDegraded
                && detail.contains("graph-unavailable")));
    }

    #[test]
    fn test_enrichment_ttl_follows_most_volatile_category() {
        use lexflow_core::{EnrichedItem, SourceTag};

        let config = EngineConfig::default();
        let mut enriched = EnrichedContext::default();
        assert_eq!(
            enrichment_ttl(&enriched, &config),
            config.cache_ttl.norm
        );

        enriched.community.push(EnrichedItem {
            source_id: "contrib:1".to_string(),
            citation: "Contributo".to_string(),
            summary: String::new(),
            source: SourceTag::Community,
            confidence: 0.5,
        });
        assert_eq!(
            enrichment_ttl(&enriched, &config),
            config.cache_ttl.community
        );
    }
}
