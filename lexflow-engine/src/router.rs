//! Router node
//!
//! Renders one planning prompt per iteration and asks the LLM for a
//! structured execution plan. Invalid plans (no agents, no experts, unknown
//! tags, budget below the current iteration) count as schema violations and
//! feed the retry policy; after the attempts are exhausted the router falls
//! back to a deterministic default plan.

use lexflow_core::{
    AgentInvocation, AgentKind, EngineConfig, EnrichedContext, ExecutionPlan, ExpertKind,
    ProvisionalAnswer, QueryContext, RefinementDirective, SynthesisMode,
};
use lexflow_llm::{call_structured, ChatProvider, ChatRequest, StructuredOutput};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// PLAN SCHEMA
// ============================================================================

#[derive(Debug, Deserialize)]
struct PlanOutput {
    agents: Vec<PlanAgent>,
    experts: Vec<String>,
    #[serde(default)]
    synthesis: Option<String>,
    #[serde(default)]
    iteration_budget: Option<i32>,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct PlanAgent {
    agent: String,
    #[serde(default)]
    query_rewrites: Vec<String>,
    #[serde(default)]
    filters: BTreeMap<String, String>,
    #[serde(default)]
    top_k: Option<i32>,
}

impl StructuredOutput for PlanOutput {
    fn schema_hint() -> &'static str {
        r#"{
  "agents": [{"agent": "graph|http|vector", "query_rewrites": ["..."], "filters": {}, "top_k": 10}],
  "experts": ["literal", "systemic-teleological", "principles-balancer", "precedent-analyst"],
  "synthesis": "convergent|divergent|auto",
  "iteration_budget": 1,
  "rationale": "why this plan"
}"#
    }

    fn validate(&self) -> Result<(), String> {
        if self.agents.is_empty() {
            return Err("plan must name at least one agent".to_string());
        }
        if self.experts.is_empty() {
            return Err("plan must name at least one expert".to_string());
        }
        for agent in &self.agents {
            AgentKind::from_db_str(&agent.agent).map_err(|e| e.to_string())?;
            if let Some(top_k) = agent.top_k {
                if top_k <= 0 {
                    return Err(format!("top_k {} must be positive", top_k));
                }
            }
        }
        for expert in &self.experts {
            ExpertKind::from_db_str(expert).map_err(|e| e.to_string())?;
        }
        if let Some(synthesis) = &self.synthesis {
            SynthesisMode::from_db_str(synthesis).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Inputs the router consumes. All read-only.
pub struct RoutingInput<'a> {
    pub query_text: &'a str,
    pub context: &'a QueryContext,
    pub enriched: &'a EnrichedContext,
    pub current_iteration: i32,
    pub prior_answer: Option<&'a ProvisionalAnswer>,
    pub directive: Option<&'a RefinementDirective>,
}

/// What the router produced, and how.
#[derive(Debug)]
pub struct RoutingOutcome {
    pub plan: ExecutionPlan,
    /// True when the deterministic default plan was substituted
    pub fell_back: bool,
    /// Retry annotations from the JSON contract
    pub annotations: Vec<String>,
}

const ROUTER_SYSTEM: &str = "You are the routing stage of an Italian legal \
research engine. Given a legal query and its analysis, decide which retrieval \
agents to invoke (graph, http, vector), with what query rewrites and top-k, \
which reasoning experts to activate, how their opinions should be synthesized, \
and how many refinement iterations the question merits. Prefer few agents for \
simple lookups and the full panel for controversial questions.";

/// The LLM planner.
pub struct Router {
    chat: Arc<dyn ChatProvider>,
    config: EngineConfig,
}

impl Router {
    pub fn new(chat: Arc<dyn ChatProvider>, config: EngineConfig) -> Self {
        Self { chat, config }
    }

    /// Produce the plan for one iteration. Never fails: persistent LLM
    /// failure yields the deterministic fallback plan.
    pub async fn route(&self, input: &RoutingInput<'_>) -> RoutingOutcome {
        let prompt = render_prompt(input);
        let request = ChatRequest::new(prompt)
            .with_temperature(self.config.llm.temperature_router)
            .with_max_tokens(1024);

        let result = call_structured::<PlanOutput>(
            self.chat.as_ref(),
            ROUTER_SYSTEM,
            request,
            self.config.llm.json_max_retries,
        )
        .await;

        match result {
            Ok(outcome) => {
                match self.convert(outcome.value, input.current_iteration) {
                    Ok(plan) => RoutingOutcome {
                        plan,
                        fell_back: false,
                        annotations: outcome.annotations,
                    },
                    Err(reason) => {
                        tracing::warn!(%reason, "router produced an unusable plan, falling back");
                        let mut annotations = outcome.annotations;
                        annotations.push(reason);
                        RoutingOutcome {
                            plan: self.fallback_plan(input),
                            fell_back: true,
                            annotations,
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "router LLM failed, falling back");
                RoutingOutcome {
                    plan: self.fallback_plan(input),
                    fell_back: true,
                    annotations: vec![e.to_string()],
                }
            }
        }
    }

    /// Turn validated output into a plan, applying defaults for omitted
    /// fields. Budget below the current iteration is unusable.
    fn convert(&self, output: PlanOutput, current_iteration: i32) -> Result<ExecutionPlan, String> {
        let budget = output.iteration_budget.unwrap_or(current_iteration);
        if budget < current_iteration {
            return Err(format!(
                "iteration budget {} below current iteration {}",
                budget, current_iteration
            ));
        }

        let mut experts = Vec::new();
        for name in &output.experts {
            let expert = ExpertKind::from_db_str(name).map_err(|e| e.to_string())?;
            if !experts.contains(&expert) {
                experts.push(expert);
            }
        }

        let mut agents = Vec::new();
        for agent in output.agents {
            let kind = AgentKind::from_db_str(&agent.agent).map_err(|e| e.to_string())?;
            agents.push(AgentInvocation {
                agent: kind,
                query_rewrites: agent.query_rewrites,
                filters: agent.filters,
                top_k: agent.top_k.unwrap_or(self.config.agents.topk_default),
            });
        }

        let synthesis = output
            .synthesis
            .as_deref()
            .map(SynthesisMode::from_db_str)
            .transpose()
            .map_err(|e| e.to_string())?
            .unwrap_or(SynthesisMode::Auto);

        Ok(ExecutionPlan {
            agents,
            experts,
            synthesis,
            iteration_budget: budget,
            rationale: output.rationale,
        })
    }

    /// Deterministic default: graph + vector retrieval, literal +
    /// systemic-teleological reasoning, synthesis auto, budget = current.
    pub fn fallback_plan(&self, input: &RoutingInput<'_>) -> ExecutionPlan {
        let query = input.query_text.to_string();
        ExecutionPlan {
            agents: vec![
                AgentInvocation {
                    agent: AgentKind::Graph,
                    query_rewrites: vec![query.clone()],
                    filters: BTreeMap::new(),
                    top_k: self.config.agents.topk_default,
                },
                AgentInvocation {
                    agent: AgentKind::Vector,
                    query_rewrites: vec![query],
                    filters: BTreeMap::new(),
                    top_k: self.config.agents.topk_default,
                },
            ],
            experts: vec![ExpertKind::Literal, ExpertKind::SystemicTeleological],
            synthesis: SynthesisMode::Auto,
            iteration_budget: input.current_iteration,
            rationale: "default plan after router failure".to_string(),
        }
    }
}

/// Render the planning prompt: query, analysis digest, enrichment summary,
/// and the prior iteration's answer and directive when refining.
fn render_prompt(input: &RoutingInput<'_>) -> String {
    use std::fmt::Write;

    let mut prompt = String::with_capacity(1024);
    let _ = writeln!(prompt, "Query: {}", input.query_text);
    let _ = writeln!(
        prompt,
        "Intent: {} (confidence {:.2}), complexity {:.2}",
        input.context.intent.as_db_str(),
        input.context.intent_confidence,
        input.context.complexity
    );

    if !input.context.entities.is_empty() {
        let digest: Vec<String> = input
            .context
            .entities
            .iter()
            .take(12)
            .map(|e| format!("{:?}:{}", e.kind, e.text))
            .collect();
        let _ = writeln!(prompt, "Entities: {}", digest.join("; "));
    }
    if !input.context.concepts.is_empty() {
        let _ = writeln!(prompt, "Concepts: {}", input.context.concepts.join(", "));
    }

    let _ = writeln!(
        prompt,
        "Enrichment: {} norms, {} cases, {} doctrine, {} community",
        input.enriched.norms.len(),
        input.enriched.case_law.len(),
        input.enriched.doctrine.len(),
        input.enriched.community.len()
    );
    if !input.enriched.controversy_flags.is_empty() {
        let _ = writeln!(
            prompt,
            "Controversial concepts: {}",
            input.enriched.controversy_flags.join(", ")
        );
    }

    let _ = writeln!(prompt, "Current iteration: {}", input.current_iteration);

    if let Some(answer) = input.prior_answer {
        let _ = writeln!(
            prompt,
            "\nPrior answer (confidence {:.2}, consensus {:.2}):\n{}",
            answer.confidence,
            answer.consensus,
            truncate(&answer.text, 600)
        );
    }
    if let Some(directive) = input.directive {
        if !directive.gaps.is_empty() {
            let _ = writeln!(prompt, "Known gaps: {}", directive.gaps.join("; "));
        }
        if !directive.missing_information.is_empty() {
            let _ = writeln!(
                prompt,
                "User reports missing: {}",
                directive.missing_information.join("; ")
            );
        }
        if !directive.quality_concerns.is_empty() {
            let _ = writeln!(
                prompt,
                "Quality concerns: {}",
                directive.quality_concerns.join("; ")
            );
        }
    }

    prompt
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use lexflow_core::IntentTag;
    use lexflow_llm::MockChatProvider;

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

    fn input<'a>(context: &'a QueryContext, enriched: &'a EnrichedContext) -> RoutingInput<'a> {
        RoutingInput {
            query_text: "Cosa prevede l'art. 1321 c.c.?",
            context,
            enriched,
            current_iteration: 1,
            prior_answer: None,
            directive: None,
        }
    }

    fn plan_json() -> String {
        serde_json::json!({
            "agents": [
                {"agent": "graph", "query_rewrites": ["art. 1321 c.c."], "top_k": 5},
                {"agent": "vector", "query_rewrites": ["nozione di contratto"]}
            ],
            "experts": ["literal"],
            "synthesis": "convergent",
            "iteration_budget": 1,
            "rationale": "simple norm lookup"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_route_valid_plan() {
        let chat = Arc::new(MockChatProvider::fixed(plan_json()));
        let router = Router::new(chat, EngineConfig::default());
        let ctx = context();
        let enriched = EnrichedContext::default();

        let outcome = router.route(&input(&ctx, &enriched)).await;
        assert!(!outcome.fell_back);
        assert_eq!(outcome.plan.agents.len(), 2);
        assert_eq!(outcome.plan.agents[0].top_k, 5);
        // Omitted top_k takes the configured default
        assert_eq!(outcome.plan.agents[1].top_k, 10);
        assert_eq!(outcome.plan.experts, vec![ExpertKind::Literal]);
        assert_eq!(outcome.plan.synthesis, SynthesisMode::Convergent);
    }

    #[tokio::test]
    async fn test_route_omitted_synthesis_defaults_to_auto() {
        let json = serde_json::json!({
            "agents": [{"agent": "vector"}],
            "experts": ["literal"]
        })
        .to_string();
        let chat = Arc::new(MockChatProvider::fixed(json));
        let router = Router::new(chat, EngineConfig::default());
        let ctx = context();
        let enriched = EnrichedContext::default();

        let outcome = router.route(&input(&ctx, &enriched)).await;
        assert!(!outcome.fell_back);
        assert_eq!(outcome.plan.synthesis, SynthesisMode::Auto);
        assert_eq!(outcome.plan.iteration_budget, 1);
    }

    #[tokio::test]
    async fn test_route_rejects_empty_experts_then_falls_back() {
        let bad = serde_json::json!({"agents": [{"agent": "graph"}], "experts": []}).to_string();
        let chat = Arc::new(MockChatProvider::fixed(bad));
        let mut config = EngineConfig::default();
        config.llm.json_max_retries = 2;
        let router = Router::new(chat, config);
        let ctx = context();
        let enriched = EnrichedContext::default();

        let outcome = router.route(&input(&ctx, &enriched)).await;
        assert!(outcome.fell_back);
        assert_eq!(
            outcome.plan.experts,
            vec![ExpertKind::Literal, ExpertKind::SystemicTeleological]
        );
        assert_eq!(outcome.plan.agents.len(), 2);
        assert!(!outcome.annotations.is_empty());
    }

    #[tokio::test]
    async fn test_route_noisy_then_clean_retries() {
        let chat = Arc::new(MockChatProvider::scripted(vec![
            Ok("I suggest the following plan: {broken".to_string()),
            Ok(plan_json()),
        ]));
        let router = Router::new(chat, EngineConfig::default());
        let ctx = context();
        let enriched = EnrichedContext::default();

        let outcome = router.route(&input(&ctx, &enriched)).await;
        assert!(!outcome.fell_back);
        assert_eq!(outcome.annotations.len(), 1);
    }

    #[tokio::test]
    async fn test_budget_below_iteration_falls_back() {
        let json = serde_json::json!({
            "agents": [{"agent": "graph"}],
            "experts": ["literal"],
            "iteration_budget": 1
        })
        .to_string();
        let chat = Arc::new(MockChatProvider::fixed(json));
        let router = Router::new(chat, EngineConfig::default());
        let ctx = context();
        let enriched = EnrichedContext::default();

        let mut routing_input = input(&ctx, &enriched);
        routing_input.current_iteration = 2;

        let outcome = router.route(&routing_input).await;
        assert!(outcome.fell_back);
        assert_eq!(outcome.plan.iteration_budget, 2);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("nullità", 6), "nullit");
        assert_eq!(truncate("breve", 100), "breve");
    }
}
