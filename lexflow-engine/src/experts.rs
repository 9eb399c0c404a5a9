//! Reasoning experts
//!
//! Four experts share one invocation contract and differ only by prompt
//! template and tag. Selected experts run concurrently under a per-expert
//! timeout and shared cancellation; a failed expert returns its minimal
//! opinion with confidence 0.3 instead of aborting the workflow.

use lexflow_core::{
    AgentResult, ConfidenceBreakdown, EngineConfig, EnrichedContext, ExpertKind, ExpertOpinion,
    LegalBasis, QueryContext, RefinementDirective,
};
use lexflow_llm::{call_structured, ChatProvider, ChatRequest, StructuredOutput};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// OPINION SCHEMA
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpinionOutput {
    interpretation: String,
    conclusion_label: String,
    #[serde(default)]
    legal_bases: Vec<BasisOutput>,
    #[serde(default)]
    reasoning_steps: Vec<String>,
    confidence: f32,
    breakdown: BreakdownOutput,
    #[serde(default)]
    limitations: String,
}

#[derive(Debug, Deserialize)]
struct BasisOutput {
    citation: String,
    role: String,
    weight: f32,
}

#[derive(Debug, Deserialize)]
struct BreakdownOutput {
    norm_clarity: f32,
    jurisprudence_alignment: f32,
    contextual_ambiguity: f32,
    source_availability: f32,
}

impl StructuredOutput for OpinionOutput {
    fn schema_hint() -> &'static str {
        r#"{
  "interpretation": "reasoned analysis in Italian",
  "conclusion_label": "short categorical conclusion, e.g. 'valido' or 'non valido'",
  "legal_bases": [{"citation": "Art. 1321 c.c.", "role": "fondamento", "weight": 0.9}],
  "reasoning_steps": ["..."],
  "confidence": 0.0,
  "breakdown": {"norm_clarity": 0.0, "jurisprudence_alignment": 0.0, "contextual_ambiguity": 0.0, "source_availability": 0.0},
  "limitations": "what this analysis cannot establish"
}"#
    }

    fn validate(&self) -> Result<(), String> {
        if self.interpretation.trim().is_empty() {
            return Err("interpretation must not be empty".to_string());
        }
        if self.conclusion_label.trim().is_empty() {
            return Err("conclusion_label must not be empty".to_string());
        }
        for value in [
            self.confidence,
            self.breakdown.norm_clarity,
            self.breakdown.jurisprudence_alignment,
            self.breakdown.contextual_ambiguity,
            self.breakdown.source_availability,
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("confidence value {} out of range", value));
            }
        }
        for basis in &self.legal_bases {
            if !(0.0..=1.0).contains(&basis.weight) {
                return Err(format!(
                    "weight {} for '{}' out of range",
                    basis.weight, basis.citation
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// PROMPT TEMPLATES
// ============================================================================

/// Methodology instructions, one per expert tag.
fn system_prompt(expert: ExpertKind) -> &'static str {
    match expert {
        ExpertKind::Literal => {
            "You are a legal expert applying literal interpretation. Analyze the \
             question strictly through the text of the applicable provisions: \
             ordinary meaning of the words, grammatical structure, and the \
             definitions the statute itself supplies. Do not reach beyond what \
             the letter of the law supports."
        }
        ExpertKind::SystemicTeleological => {
            "You are a legal expert applying systemic and teleological \
             interpretation. Read each provision in the context of the statute \
             and the legal order as a whole, and weigh the purpose the \
             legislator pursued. Coherence of the system and ratio legis drive \
             your conclusions."
        }
        ExpertKind::PrinciplesBalancer => {
            "You are a legal expert balancing competing principles. Identify \
             the constitutional and general principles the question engages, \
             state the tension between them, and resolve it by proportionality. \
             Make the balancing explicit in your reasoning steps."
        }
        ExpertKind::PrecedentAnalyst => {
            "You are a legal expert reasoning from precedent. Ground every \
             conclusion in the case law supplied in the context, distinguish \
             conflicting lines of authority, and weigh the standing of each \
             court. Flag where jurisprudence is unsettled."
        }
    }
}

/// Shared input handed to every selected expert.
pub struct ExpertInput<'a> {
    pub query_text: &'a str,
    pub context: &'a QueryContext,
    pub enriched: &'a EnrichedContext,
    pub agent_results: &'a [AgentResult],
    pub directive: Option<&'a RefinementDirective>,
}

fn render_user_prompt(input: &ExpertInput<'_>) -> String {
    use std::fmt::Write;

    let mut prompt = String::with_capacity(2048);
    let _ = writeln!(prompt, "Question: {}", input.query_text);
    let _ = writeln!(
        prompt,
        "Intent: {}, complexity {:.2}",
        input.context.intent.as_db_str(),
        input.context.complexity
    );
    if !input.context.concepts.is_empty() {
        let _ = writeln!(prompt, "Concepts: {}", input.context.concepts.join(", "));
    }

    let _ = writeln!(prompt, "\nRetrieved sources:");
    for result in input.agent_results {
        for hit in result.hits.iter().take(5) {
            let _ = writeln!(
                prompt,
                "- [{}] {} — {}",
                hit.source_id,
                hit.citation,
                summarize(&hit.snippet, 280)
            );
        }
    }

    for item in input
        .enriched
        .norms
        .iter()
        .chain(input.enriched.case_law.iter())
        .chain(input.enriched.doctrine.iter())
        .take(10)
    {
        let _ = writeln!(
            prompt,
            "- [{}] {} — {}",
            item.source_id,
            item.citation,
            summarize(&item.summary, 200)
        );
    }

    if !input.enriched.controversy_flags.is_empty() {
        let _ = writeln!(
            prompt,
            "\nConcepts flagged controversial: {}",
            input.enriched.controversy_flags.join(", ")
        );
    }

    if let Some(directive) = input.directive {
        if !directive.is_empty() {
            let _ = writeln!(prompt, "\nRefinement guidance:");
            for gap in &directive.gaps {
                let _ = writeln!(prompt, "- address gap: {}", gap);
            }
            for item in &directive.missing_information {
                let _ = writeln!(prompt, "- user asked for: {}", item);
            }
            for concern in &directive.quality_concerns {
                let _ = writeln!(prompt, "- reviewer concern: {}", concern);
            }
        }
    }

    prompt
}

fn summarize(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// EXECUTION
// ============================================================================

/// Sampling seed passed to providers that honor one, and recorded on every
/// opinion so a run can be replayed.
const EXPERT_SEED: u64 = 1321;

/// The documented minimal opinion a failed expert returns.
fn fallback_opinion(expert: ExpertKind, model_id: &str, annotation: String) -> ExpertOpinion {
    ExpertOpinion {
        expert,
        interpretation: "Analisi non disponibile per questa prospettiva.".to_string(),
        conclusion_label: "indeterminato".to_string(),
        legal_bases: Vec::new(),
        reasoning_steps: Vec::new(),
        confidence: 0.3,
        breakdown: ConfidenceBreakdown::default(),
        limitations: "Opinione di ripiego generata dopo il fallimento della chiamata al modello."
            .to_string(),
        tokens_used: 0,
        latency_ms: 0,
        model_id: model_id.to_string(),
        seed: None,
        error_annotations: vec![annotation],
    }
}

/// Whether an opinion is the minimal fallback rather than a model response.
/// Fallback opinions consumed no tokens and always carry an annotation.
pub fn is_fallback(opinion: &ExpertOpinion) -> bool {
    opinion.tokens_used == 0 && !opinion.error_annotations.is_empty()
}

/// Run the selected experts concurrently.
///
/// Completion order is not defined; the returned list is keyed by expert tag
/// in the order the plan activated them.
pub async fn run_experts(
    chat: Arc<dyn ChatProvider>,
    experts: &[ExpertKind],
    input: &ExpertInput<'_>,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Vec<ExpertOpinion> {
    let user_prompt = render_user_prompt(input);
    let seed = EXPERT_SEED;

    let futures = experts.iter().map(|&expert| {
        let chat = chat.clone();
        let user_prompt = user_prompt.clone();
        let cancel = cancel.clone();
        let timeout = config.timeouts.expert;
        let temperature = config.llm.temperature_expert;
        let max_retries = config.llm.json_max_retries;
        async move {
            let started = Instant::now();
            let request = ChatRequest::new(user_prompt)
                .with_temperature(temperature)
                .with_max_tokens(2048)
                .with_seed(seed);

            let call = call_structured::<OpinionOutput>(
                chat.as_ref(),
                system_prompt(expert),
                request,
                max_retries,
            );

            let outcome = tokio::select! {
                outcome = tokio::time::timeout(timeout, call) => outcome,
                _ = cancel.cancelled() => {
                    tracing::debug!(?expert, "expert cancelled by request deadline");
                    return fallback_opinion(
                        expert,
                        chat.model_id(),
                        "cancelled by request deadline".to_string(),
                    );
                }
            };

            match outcome {
                Ok(Ok(json_outcome)) => {
                    let output = json_outcome.value;
                    ExpertOpinion {
                        expert,
                        interpretation: output.interpretation,
                        conclusion_label: output.conclusion_label.trim().to_lowercase(),
                        legal_bases: output
                            .legal_bases
                            .into_iter()
                            .map(|b| LegalBasis {
                                citation: b.citation,
                                role: b.role,
                                weight: b.weight,
                            })
                            .collect(),
                        reasoning_steps: output.reasoning_steps,
                        confidence: output.confidence,
                        breakdown: ConfidenceBreakdown {
                            norm_clarity: output.breakdown.norm_clarity,
                            jurisprudence_alignment: output.breakdown.jurisprudence_alignment,
                            contextual_ambiguity: output.breakdown.contextual_ambiguity,
                            source_availability: output.breakdown.source_availability,
                        },
                        limitations: output.limitations,
                        tokens_used: json_outcome.tokens_used,
                        latency_ms: started.elapsed().as_millis() as i64,
                        model_id: json_outcome.model_id,
                        seed: Some(seed),
                        error_annotations: json_outcome.annotations,
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(?expert, error = %e, "expert degraded to fallback opinion");
                    fallback_opinion(expert, chat.model_id(), e.to_string())
                }
                Err(_) => {
                    tracing::warn!(?expert, "expert timed out");
                    fallback_opinion(
                        expert,
                        chat.model_id(),
                        format!("timed out after {:?}", config.timeouts.expert),
                    )
                }
            }
        }
    });

    futures_util::future::join_all(futures).await
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use lexflow_core::IntentTag;
    use lexflow_llm::MockChatProvider;

    fn opinion_json(label: &str, confidence: f32) -> String {
        serde_json::json!({
            "interpretation": "Ai sensi dell'art. 1321 c.c. il contratto è l'accordo di due o più parti.",
            "conclusion_label": label,
            "legal_bases": [{"citation": "Art. 1321 c.c.", "role": "fondamento", "weight": 0.9}],
            "reasoning_steps": ["lettura del testo", "definizione codicistica"],
            "confidence": confidence,
            "breakdown": {
                "norm_clarity": 0.9,
                "jurisprudence_alignment": 0.8,
                "contextual_ambiguity": 0.2,
                "source_availability": 0.9
            },
            "limitations": "Non considera prassi applicative."
        })
        .to_string()
    }

    fn context() -> QueryContext {
        QueryContext {
            intent: IntentTag::NormSearch,
            intent_confidence: 0.9,
            complexity: 0.1,
            entities: Vec::new(),
            concepts: vec!["contratto".to_string()],
            norm_references: vec!["art. 1321 c.c.".to_string()],
            temporal_hints: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_experts_run_and_return_keyed_opinions() {
        let chat = Arc::new(MockChatProvider::fixed(opinion_json("valido", 0.9)));
        let ctx = context();
        let enriched = EnrichedContext::default();
        let input = ExpertInput {
            query_text: "Cosa prevede l'art. 1321 c.c.?",
            context: &ctx,
            enriched: &enriched,
            agent_results: &[],
            directive: None,
        };

        let opinions = run_experts(
            chat,
            &[ExpertKind::Literal, ExpertKind::SystemicTeleological],
            &input,
            &EngineConfig::default(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(opinions.len(), 2);
        assert_eq!(opinions[0].expert, ExpertKind::Literal);
        assert_eq!(opinions[1].expert, ExpertKind::SystemicTeleological);
        assert_eq!(opinions[0].conclusion_label, "valido");
        assert!(opinions[0].seed.is_some());
        assert!(!opinions[0].model_id.is_empty());
    }

    #[tokio::test]
    async fn test_failed_expert_returns_minimal_opinion() {
        let chat = Arc::new(MockChatProvider::fixed("not valid json"));
        let mut config = EngineConfig::default();
        config.llm.json_max_retries = 1;
        let ctx = context();
        let enriched = EnrichedContext::default();
        let input = ExpertInput {
            query_text: "Cosa prevede l'art. 1321 c.c.?",
            context: &ctx,
            enriched: &enriched,
            agent_results: &[],
            directive: None,
        };

        let opinions = run_experts(
            chat,
            &[ExpertKind::PrecedentAnalyst],
            &input,
            &config,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(opinions.len(), 1);
        assert!((opinions[0].confidence - 0.3).abs() < 1e-6);
        assert_eq!(opinions[0].conclusion_label, "indeterminato");
        assert!(!opinions[0].error_annotations.is_empty());
    }

    #[tokio::test]
    async fn test_fenced_json_retry_is_annotated() {
        // First response wrapped in prose + fence that still fails to parse,
        // second response clean: the opinion records one retry annotation
        let chat = Arc::new(MockChatProvider::scripted(vec![
            Ok("Ecco l'analisi richiesta: ```json\n{broken```".to_string()),
            Ok(opinion_json("valido", 0.85)),
        ]));
        let ctx = context();
        let enriched = EnrichedContext::default();
        let input = ExpertInput {
            query_text: "Cosa prevede l'art. 1321 c.c.?",
            context: &ctx,
            enriched: &enriched,
            agent_results: &[],
            directive: None,
        };

        let opinions = run_experts(
            chat,
            &[ExpertKind::Literal],
            &input,
            &EngineConfig::default(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(opinions.len(), 1);
        assert_eq!(opinions[0].error_annotations.len(), 1);
        assert_eq!(opinions[0].conclusion_label, "valido");
    }

    #[test]
    fn test_conclusion_labels_normalized() {
        let output: OpinionOutput =
            serde_json::from_str(&opinion_json("  Valido ", 0.8)).unwrap();
        assert!(output.validate().is_ok());
        // Normalization happens at conversion time
        assert_eq!("  Valido ".trim().to_lowercase(), "valido");
    }

    #[test]
    fn test_opinion_validation_rejects_bad_weight() {
        let mut json: serde_json::Value =
            serde_json::from_str(&opinion_json("valido", 0.8)).unwrap();
        json["legal_bases"][0]["weight"] = serde_json::json!(1.5);
        let output: OpinionOutput = serde_json::from_value(json).unwrap();
        assert!(output.validate().is_err());
    }
}
