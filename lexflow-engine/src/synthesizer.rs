//! Synthesizer node
//!
//! Folds expert opinions into a provisional answer. The narrative is asked
//! from the LLM as a list of claims, each carrying its own source ids and
//! expert tags; the final text is the concatenation of the claims that
//! survive provenance checking. A claim that cannot be mapped to at least
//! one retrieved source and one consulted expert is dropped with a warning.
//! On LLM failure the narrative is assembled deterministically from the
//! opinions themselves.

use lexflow_core::{
    AgentResult, AlternativeInterpretation, EngineConfig, ExpertKind, ExpertOpinion,
    ProvenanceEntry, ProvisionalAnswer, SourceId, SynthesisMode, WarningKind,
};
use lexflow_llm::{call_structured, ChatProvider, ChatRequest, StructuredOutput};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// CONSENSUS ARITHMETIC
// ============================================================================

/// Majority conclusion label and its share of the opinions.
pub fn majority_label(opinions: &[ExpertOpinion]) -> (String, f32) {
    if opinions.is_empty() {
        return (String::new(), 0.0);
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for opinion in opinions {
        *counts.entry(opinion.conclusion_label.as_str()).or_insert(0) += 1;
    }
    let (label, count) = counts
        .into_iter()
        .max_by_key(|(label, count)| (*count, std::cmp::Reverse(*label)))
        .expect("opinions is non-empty");
    (label.to_string(), count as f32 / opinions.len() as f32)
}

/// Auto-mode rule: convergent when the majority share reaches 0.75 and every
/// dissenting opinion is individually weak (confidence < 0.6).
fn auto_mode(opinions: &[ExpertOpinion]) -> SynthesisMode {
    let (majority, share) = majority_label(opinions);
    let dissent_strong = opinions
        .iter()
        .filter(|o| o.conclusion_label != majority)
        .any(|o| o.confidence >= 0.6);

    if share >= 0.75 && !dissent_strong {
        SynthesisMode::Convergent
    } else {
        SynthesisMode::Divergent
    }
}

/// Resolve the plan's mode to the mode actually used. Never returns `Auto`.
pub fn resolve_mode(plan_mode: SynthesisMode, opinions: &[ExpertOpinion]) -> SynthesisMode {
    // A single opinion is convergent by definition
    if opinions.len() <= 1 {
        return SynthesisMode::Convergent;
    }
    match plan_mode {
        SynthesisMode::Auto => auto_mode(opinions),
        explicit => explicit,
    }
}

/// Convergent confidence: mean of opinion confidences weighted by
/// confidence × expert authority.
fn convergent_confidence(opinions: &[ExpertOpinion], authority: &HashMap<ExpertKind, f32>) -> f32 {
    let mut numerator = 0.0f32;
    let mut denominator = 0.0f32;
    for opinion in opinions {
        let weight = opinion.confidence * authority.get(&opinion.expert).copied().unwrap_or(1.0);
        numerator += weight * opinion.confidence;
        denominator += weight;
    }
    if denominator > 0.0 {
        (numerator / denominator).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Divergent confidence: mean minus half the standard deviation, clamped to
/// [0.3, 0.6].
fn divergent_confidence(opinions: &[ExpertOpinion]) -> f32 {
    if opinions.is_empty() {
        return 0.3;
    }
    let n = opinions.len() as f32;
    let mean = opinions.iter().map(|o| o.confidence).sum::<f32>() / n;
    let variance = opinions
        .iter()
        .map(|o| (o.confidence - mean).powi(2))
        .sum::<f32>()
        / n;
    (mean - 0.5 * variance.sqrt()).clamp(0.3, 0.6)
}

// ============================================================================
// NARRATIVE SCHEMA
// ============================================================================

#[derive(Debug, Deserialize)]
struct SynthesisOutput {
    claims: Vec<ClaimOutput>,
    #[serde(default)]
    alternatives: Vec<AlternativeOutput>,
}

#[derive(Debug, Deserialize)]
struct ClaimOutput {
    text: String,
    source_ids: Vec<String>,
    experts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AlternativeOutput {
    position: String,
    summary: String,
    experts: Vec<String>,
    confidence: f32,
}

impl StructuredOutput for SynthesisOutput {
    fn schema_hint() -> &'static str {
        r#"{
  "claims": [{"text": "one sentence of the answer", "source_ids": ["id of a retrieved source"], "experts": ["literal"]}],
  "alternatives": [{"position": "label", "summary": "...", "experts": ["precedent-analyst"], "confidence": 0.0}]
}"#
    }

    fn validate(&self) -> Result<(), String> {
        if self.claims.is_empty() {
            return Err("synthesis must contain at least one claim".to_string());
        }
        for claim in &self.claims {
            if claim.text.trim().is_empty() {
                return Err("claim text must not be empty".to_string());
            }
        }
        for alternative in &self.alternatives {
            if !(0.0..=1.0).contains(&alternative.confidence) {
                return Err(format!(
                    "alternative confidence {} out of range",
                    alternative.confidence
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// SYNTHESIZER
// ============================================================================

const CONVERGENT_SYSTEM: &str = "You are the synthesis stage of an Italian \
legal research engine. Integrate the expert opinions below into a single \
coherent answer, subordinating dissent explicitly. Produce the answer as a \
list of claims: every claim must cite the ids of the retrieved sources it \
rests on and the experts that support it. Use only the source ids provided.";

const DIVERGENT_SYSTEM: &str = "You are the synthesis stage of an Italian \
legal research engine. The experts disagree: present each defensible position \
fairly, preserving the disagreement rather than resolving it. Produce the \
answer as a list of claims with the ids of the sources and the experts behind \
each, and list the alternative positions separately. Use only the source ids \
provided.";

/// Result of synthesis, with warnings for the state-writer.
#[derive(Debug)]
pub struct SynthesisOutcome {
    pub answer: ProvisionalAnswer,
    pub warnings: Vec<(WarningKind, String)>,
}

pub struct Synthesizer {
    chat: Arc<dyn ChatProvider>,
    config: EngineConfig,
    /// Per-expert authority multipliers; absent experts weigh 1.0
    authority: HashMap<ExpertKind, f32>,
}

impl Synthesizer {
    pub fn new(chat: Arc<dyn ChatProvider>, config: EngineConfig) -> Self {
        Self {
            chat,
            config,
            authority: HashMap::new(),
        }
    }

    pub fn with_authority(mut self, authority: HashMap<ExpertKind, f32>) -> Self {
        self.authority = authority;
        self
    }

    /// Merge opinions into a provisional answer.
    pub async fn synthesize(
        &self,
        query_text: &str,
        plan_mode: SynthesisMode,
        opinions: &[ExpertOpinion],
        agent_results: &[AgentResult],
        cancel: &CancellationToken,
    ) -> SynthesisOutcome {
        let mut warnings = Vec::new();
        let mode = resolve_mode(plan_mode, opinions);
        let (_, consensus) = majority_label(opinions);
        let consensus = if opinions.len() <= 1 { 1.0 } else { consensus };

        let mut confidence = match mode {
            SynthesisMode::Convergent => convergent_confidence(opinions, &self.authority),
            _ => divergent_confidence(opinions),
        };

        let valid_sources: HashSet<&str> = agent_results
            .iter()
            .flat_map(|r| r.hits.iter())
            .map(|h| h.source_id.as_str())
            .collect();
        let consulted: Vec<ExpertKind> = opinions.iter().map(|o| o.expert).collect();

        let zero_hits = valid_sources.is_empty();
        if zero_hits {
            confidence = confidence.min(0.5);
        }

        let narrative = self
            .narrative(query_text, mode, opinions, agent_results, cancel)
            .await;

        let (text, provenance, alternatives) = match narrative {
            Ok(output) => {
                let (text, provenance, dropped) =
                    accept_claims(&output.claims, &valid_sources, &consulted);
                for claim in dropped {
                    warnings.push((
                        WarningKind::ProvenanceDropped,
                        format!("claim without provenance dropped: {}", claim),
                    ));
                }
                let alternatives = convert_alternatives(output.alternatives, &consulted);
                if text.is_empty() {
                    // Every claim was dropped; fall back to the opinions
                    let (text, provenance) =
                        deterministic_narrative(opinions, mode, &valid_sources);
                    (text, provenance, alternatives)
                } else {
                    (text, provenance, alternatives)
                }
            }
            Err(e) => {
                warnings.push((
                    WarningKind::SynthesisDegraded,
                    format!("synthesis narrative degraded: {}", e),
                ));
                let (text, provenance) = deterministic_narrative(opinions, mode, &valid_sources);
                let alternatives = deterministic_alternatives(opinions, mode);
                (text, provenance, alternatives)
            }
        };

        let alternatives = if mode == SynthesisMode::Divergent && alternatives.is_empty() {
            deterministic_alternatives(opinions, mode)
        } else {
            alternatives
        };

        SynthesisOutcome {
            answer: ProvisionalAnswer {
                text,
                synthesis_mode: mode,
                consensus,
                confidence,
                provenance,
                experts_consulted: consulted,
                uncertainty_preserved: mode == SynthesisMode::Divergent || zero_hits,
                alternatives,
            },
            warnings,
        }
    }

    async fn narrative(
        &self,
        query_text: &str,
        mode: SynthesisMode,
        opinions: &[ExpertOpinion],
        agent_results: &[AgentResult],
        cancel: &CancellationToken,
    ) -> Result<SynthesisOutput, String> {
        let system = match mode {
            SynthesisMode::Divergent => DIVERGENT_SYSTEM,
            _ => CONVERGENT_SYSTEM,
        };
        let prompt = render_prompt(query_text, opinions, agent_results);
        let request = ChatRequest::new(prompt)
            .with_temperature(self.config.llm.temperature_expert)
            .with_max_tokens(2048);

        let call = call_structured::<SynthesisOutput>(
            self.chat.as_ref(),
            system,
            request,
            self.config.llm.json_max_retries,
        );

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.config.timeouts.synthesizer, call) => outcome,
            _ = cancel.cancelled() => return Err("cancelled by request deadline".to_string()),
        };

        match outcome {
            Ok(Ok(json_outcome)) => Ok(json_outcome.value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "timed out after {:?}",
                self.config.timeouts.synthesizer
            )),
        }
    }
}

fn render_prompt(
    query_text: &str,
    opinions: &[ExpertOpinion],
    agent_results: &[AgentResult],
) -> String {
    use std::fmt::Write;

    let mut prompt = String::with_capacity(2048);
    let _ = writeln!(prompt, "Question: {}", query_text);

    let _ = writeln!(prompt, "\nAvailable source ids:");
    for result in agent_results {
        for hit in &result.hits {
            let _ = writeln!(prompt, "- {} ({})", hit.source_id, hit.citation);
        }
    }

    let _ = writeln!(prompt, "\nExpert opinions:");
    for opinion in opinions {
        let _ = writeln!(
            prompt,
            "\n[{}] conclusion: {} (confidence {:.2})\n{}",
            opinion.expert.as_db_str(),
            opinion.conclusion_label,
            opinion.confidence,
            opinion.interpretation
        );
        if !opinion.limitations.is_empty() {
            let _ = writeln!(prompt, "Limitations: {}", opinion.limitations);
        }
    }

    prompt
}

/// Keep claims whose provenance checks out; return (text, entries, dropped).
fn accept_claims(
    claims: &[ClaimOutput],
    valid_sources: &HashSet<&str>,
    consulted: &[ExpertKind],
) -> (String, Vec<ProvenanceEntry>, Vec<String>) {
    let mut kept_text = Vec::new();
    let mut entries = Vec::new();
    let mut dropped = Vec::new();

    for claim in claims {
        let source_ids: Vec<SourceId> = claim
            .source_ids
            .iter()
            .filter(|id| valid_sources.contains(id.as_str()))
            .cloned()
            .collect();
        let experts: Vec<ExpertKind> = claim
            .experts
            .iter()
            .filter_map(|name| ExpertKind::from_db_str(name).ok())
            .filter(|e| consulted.contains(e))
            .collect();

        if source_ids.is_empty() || experts.is_empty() {
            dropped.push(claim.text.clone());
            continue;
        }

        kept_text.push(claim.text.trim().to_string());
        entries.push(ProvenanceEntry {
            claim: claim.text.trim().to_string(),
            source_ids,
            experts,
        });
    }

    (kept_text.join(" "), entries, dropped)
}

fn convert_alternatives(
    alternatives: Vec<AlternativeOutput>,
    consulted: &[ExpertKind],
) -> Vec<AlternativeInterpretation> {
    alternatives
        .into_iter()
        .map(|a| AlternativeInterpretation {
            position: a.position,
            summary: a.summary,
            experts: a
                .experts
                .iter()
                .filter_map(|name| ExpertKind::from_db_str(name).ok())
                .filter(|e| consulted.contains(e))
                .collect(),
            confidence: a.confidence.clamp(0.0, 1.0),
        })
        .collect()
}

/// Narrative assembled from the opinions themselves, used when the LLM
/// narrative is unavailable. Claims map to opinions; sources resolve by
/// citation match against the retrieved hits.
fn deterministic_narrative(
    opinions: &[ExpertOpinion],
    mode: SynthesisMode,
    valid_sources: &HashSet<&str>,
) -> (String, Vec<ProvenanceEntry>) {
    let (majority, _) = majority_label(opinions);

    let selected: Vec<&ExpertOpinion> = match mode {
        SynthesisMode::Convergent => opinions
            .iter()
            .filter(|o| o.conclusion_label == majority)
            .collect(),
        _ => opinions.iter().collect(),
    };

    let mut text_parts = Vec::new();
    let mut entries = Vec::new();

    for opinion in selected {
        text_parts.push(opinion.interpretation.clone());

        // A legal basis whose citation appears in a hit id maps the claim
        let source_ids: Vec<SourceId> = valid_sources
            .iter()
            .filter(|id| {
                opinion.legal_bases.iter().any(|b| {
                    let citation = b.citation.to_lowercase();
                    id.to_lowercase().contains(
                        citation
                            .trim_start_matches("art. ")
                            .split_whitespace()
                            .next()
                            .unwrap_or(&citation),
                    )
                })
            })
            .map(|id| id.to_string())
            .collect();

        if !source_ids.is_empty() {
            entries.push(ProvenanceEntry {
                claim: opinion.interpretation.clone(),
                source_ids,
                experts: vec![opinion.expert],
            });
        }
    }

    (text_parts.join("\n\n"), entries)
}

fn deterministic_alternatives(
    opinions: &[ExpertOpinion],
    mode: SynthesisMode,
) -> Vec<AlternativeInterpretation> {
    if mode != SynthesisMode::Divergent {
        return Vec::new();
    }

    let mut by_label: HashMap<&str, Vec<&ExpertOpinion>> = HashMap::new();
    for opinion in opinions {
        by_label
            .entry(opinion.conclusion_label.as_str())
            .or_default()
            .push(opinion);
    }

    let mut alternatives: Vec<AlternativeInterpretation> = by_label
        .into_iter()
        .map(|(label, group)| AlternativeInterpretation {
            position: label.to_string(),
            summary: group[0].interpretation.clone(),
            experts: group.iter().map(|o| o.expert).collect(),
            confidence: group.iter().map(|o| o.confidence).sum::<f32>() / group.len() as f32,
        })
        .collect();
    alternatives.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    alternatives
}

// ============================================================================
// TESTS
// ============================================================================
