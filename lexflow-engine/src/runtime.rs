//! Workflow runtime
//!
//! Drives one request through the fixed node order: preprocessing → router →
//! retrieval → experts → synthesizer → iteration controller, with refinement
//! looping back to the router only. The runtime is the single writer of the
//! workflow state; every node consumes snapshots and returns values.
//!
//! The request carries a cancellation token with a deadline equal to its
//! timeout. All fan-out respects the token; when it trips, partial artifacts
//! are captured and the best-seen answer is returned with a timeout warning.

use crate::experts::{run_experts, ExpertInput};
use crate::iteration::{IterationController, StopDecision};
use crate::preprocess::Preprocessor;
use crate::router::{Router, RoutingInput};
use crate::state::{IterationFrame, WorkflowState};
use crate::synthesizer::Synthesizer;
use lexflow_core::{
    EngineConfig, EnrichedContext, IterationMetrics, LexflowResult, ProvisionalAnswer,
    QueryRequest, RefinementDirective, StopReason, TraceRecord, UserFeedback, ValidationError,
    WarningKind,
};
use lexflow_llm::ChatProvider;
use lexflow_retrieval::{run_agents, AgentRegistry, GraphClient, RetrievalSnapshot};
use lexflow_storage::{CacheBackend, DurableStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a completed request hands back to the transport layer.
#[derive(Debug)]
pub struct WorkflowOutcome {
    pub trace: TraceRecord,
    /// The answer to surface: best-seen on timeout, current otherwise
    pub answer: Option<ProvisionalAnswer>,
}

/// The workflow runtime. One instance serves all requests; per-request state
/// lives on the stack of `execute`.
pub struct WorkflowRuntime {
    config: EngineConfig,
    chat: Arc<dyn ChatProvider>,
    preprocessor: Preprocessor,
    router: Router,
    synthesizer: Synthesizer,
    controller: IterationController,
    agents: AgentRegistry,
    durable: Arc<dyn DurableStore>,
}

impl WorkflowRuntime {
    pub fn new(
        config: EngineConfig,
        chat: Arc<dyn ChatProvider>,
        graph: Option<GraphClient>,
        cache: Option<Arc<dyn CacheBackend>>,
        agents: AgentRegistry,
        durable: Arc<dyn DurableStore>,
    ) -> LexflowResult<Self> {
        config.validate()?;
        Ok(Self {
            preprocessor: Preprocessor::new(chat.clone(), graph, cache, config.clone()),
            router: Router::new(chat.clone(), config.clone()),
            synthesizer: Synthesizer::new(chat.clone(), config.clone()),
            controller: IterationController::new(config.iteration.clone()),
            config,
            chat,
            agents,
            durable,
        })
    }

    /// Run one admitted request to completion.
    ///
    /// Returns Ok for success, partial success, and timeout (the trace tells
    /// them apart); Err only for validation and logic errors. A trace record
    /// is persisted in every case, including logic errors.
    pub async fn execute(&self, request: QueryRequest) -> LexflowResult<WorkflowOutcome> {
        validate_request(&request)?;

        let mut state = WorkflowState::admit(request);
        let trace_id = state.trace_id();
        tracing::info!(%trace_id, "request admitted");

        let deadline = Duration::from_millis(state.query().options.timeout_ms as u64);
        let cancel = CancellationToken::new();
        let timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                cancel.cancel();
            })
        };

        let result = self.drive(&mut state, &cancel).await;
        timer.abort();

        let stop_reason = match result {
            Ok(reason) => reason,
            Err(e) => {
                // Logic errors fail the request, but the trace is still
                // written for diagnosis
                let trace = state.snapshot(None);
                if let Err(write_err) = self.durable.record_trace(&trace).await {
                    tracing::error!(%trace_id, error = %write_err, "trace write failed after logic error");
                }
                return Err(e);
            }
        };

        let timed_out = stop_reason == Some(StopReason::Timeout);
        let answer = if timed_out {
            state.best_answer().cloned()
        } else {
            state.current_answer().cloned()
        };

        let mut trace = state.snapshot(stop_reason);
        if let Err(e) = self.durable.record_trace(&trace).await {
            tracing::warn!(%trace_id, error = %e, "trace write failed");
            trace
                .warnings
                .push(lexflow_core::Warning::new(WarningKind::DurableWriteFailed, e.to_string()));
        }

        tracing::info!(
            %trace_id,
            status = trace.status.as_db_str(),
            iterations = trace.iterations.len(),
            "request completed"
        );

        Ok(WorkflowOutcome { trace, answer })
    }

    /// The node graph proper. Returns the stop reason, or Err on a broken
    /// invariant.
    async fn drive(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> LexflowResult<Option<StopReason>> {
        // Preprocessing runs exactly once, before the loop
        let preprocessed = self.preprocessor.run(state.query()).await;
        for (kind, detail) in preprocessed.warnings {
            state.warn(kind, detail);
        }
        state.set_query_context(preprocessed.query_context)?;
        state.set_enriched_context(preprocessed.enriched_context)?;

        let effective_max = state
            .query()
            .options
            .max_iterations
            .min(self.config.iteration.max_iterations);

        let mut directive: Option<RefinementDirective> = None;

        loop {
            if cancel.is_cancelled() {
                state.warn(WarningKind::Timeout, "request deadline before iteration");
                return Ok(Some(StopReason::Timeout));
            }

            let iteration = state.next_iteration();
            let started_at = chrono::Utc::now();
            tracing::debug!(trace_id = %state.trace_id(), iteration, "iteration started");

            // -- Router ---------------------------------------------------
            let context = state.query_context().cloned().ok_or_else(|| {
                lexflow_core::LexflowError::Logic(lexflow_core::LogicError::InvariantBroken {
                    reason: "query context absent after preprocessing".to_string(),
                })
            })?;
            let enriched = state
                .enriched_context()
                .cloned()
                .unwrap_or_else(EnrichedContext::default);

            let routing = {
                let input = RoutingInput {
                    query_text: &state.query().text,
                    context: &context,
                    enriched: &enriched,
                    current_iteration: iteration,
                    prior_answer: state.current_answer(),
                    directive: directive.as_ref(),
                };
                self.router.route(&input).await
            };
            if routing.fell_back {
                tracing::debug!(trace_id = %state.trace_id(), "router used the fallback plan");
            }
            let plan = routing.plan;

            // -- Retrieval fan-out ---------------------------------------
            let snapshot = RetrievalSnapshot {
                query_text: state.query().text.clone(),
                intent: context.intent,
                norm_references: context.norm_references.clone(),
                jurisdiction: state
                    .query()
                    .hints
                    .as_ref()
                    .and_then(|h| h.jurisdiction.clone()),
            };
            let agent_results = run_agents(&self.agents, &snapshot, &plan.agents, cancel).await;
            for result in agent_results.iter().filter(|r| r.error.is_some()) {
                state.warn(
                    WarningKind::AgentDegraded,
                    format!(
                        "{}: {}",
                        result.agent.as_db_str(),
                        result.error.as_deref().unwrap_or("unknown")
                    ),
                );
            }

            // -- Expert fan-out ------------------------------------------
            let opinions = {
                let input = ExpertInput {
                    query_text: &state.query().text,
                    context: &context,
                    enriched: &enriched,
                    agent_results: &agent_results,
                    directive: directive.as_ref(),
                };
                run_experts(self.chat.clone(), &plan.experts, &input, &self.config, cancel).await
            };
            for opinion in opinions.iter().filter(|o| crate::experts::is_fallback(o)) {
                state.warn(
                    WarningKind::ExpertDegraded,
                    format!(
                        "{}: {}",
                        opinion.expert.as_db_str(),
                        opinion
                            .error_annotations
                            .last()
                            .map(String::as_str)
                            .unwrap_or("fallback opinion")
                    ),
                );
            }

            // -- Synthesis ------------------------------------------------
            let synthesis = self
                .synthesizer
                .synthesize(
                    &state.query().text,
                    plan.synthesis,
                    &opinions,
                    &agent_results,
                    cancel,
                )
                .await;
            for (kind, detail) in synthesis.warnings {
                state.warn(kind, detail);
            }
            let answer = synthesis.answer;

            // -- External signals ----------------------------------------
            let feedback = self.latest_user_feedback(state).await;
            let (rlcf_score, quality_concerns) = self.rlcf_evaluation(state).await;

            let metrics = IterationMetrics {
                confidence: answer.confidence,
                consensus: answer.consensus,
                user_rating: feedback.as_ref().map(|f| f.rating as f32),
                rlcf_score,
            };

            let frame = IterationFrame {
                index: iteration,
                plan,
                agent_results,
                opinions,
                answer,
                metrics,
                started_at,
                completed_at: chrono::Utc::now(),
            };

            // Durable writes are best-effort; the frame is pushed regardless
            let record = lexflow_core::IterationRecord {
                index: frame.index,
                plan: frame.plan.clone(),
                answer: frame.answer.clone(),
                metrics: frame.metrics.clone(),
                feedback: feedback.clone(),
                started_at: frame.started_at,
                completed_at: frame.completed_at,
            };
            if let Err(e) = self.durable.append_iteration(state.trace_id(), &record).await {
                state.warn(WarningKind::DurableWriteFailed, e.to_string());
            }
            if let Err(e) = self
                .durable
                .record_answer(state.trace_id(), frame.index, &frame.answer)
                .await
            {
                state.warn(WarningKind::DurableWriteFailed, e.to_string());
            }

            state.push_frame(frame)?;

            // -- Iteration controller ------------------------------------
            if cancel.is_cancelled() {
                state.warn(WarningKind::Timeout, "request deadline during iteration");
                return Ok(Some(StopReason::Timeout));
            }

            match self.controller.evaluate(
                state.frames(),
                effective_max,
                feedback.as_ref(),
                &quality_concerns,
            ) {
                StopDecision::Stop(reason) => {
                    tracing::debug!(trace_id = %state.trace_id(), ?reason, "iteration stopped");
                    return Ok(Some(reason));
                }
                StopDecision::Continue(next_directive) => {
                    tracing::debug!(trace_id = %state.trace_id(), "refinement continues");
                    directive = Some(next_directive);
                }
            }
        }
    }

    /// Latest user feedback submitted against this trace, if any.
    async fn latest_user_feedback(&self, state: &WorkflowState) -> Option<UserFeedback> {
        match self.durable.user_feedback_for_trace(state.trace_id()).await {
            Ok(mut feedback) => feedback.pop(),
            Err(e) => {
                tracing::debug!(error = %e, "user feedback lookup failed");
                None
            }
        }
    }

    /// Authority-weighted external evaluation and its stated concerns.
    async fn rlcf_evaluation(&self, state: &WorkflowState) -> (Option<f32>, Vec<String>) {
        let corrections = match self
            .durable
            .expert_feedback_for_trace(state.trace_id())
            .await
        {
            Ok(corrections) if !corrections.is_empty() => corrections,
            _ => return (None, Vec::new()),
        };

        let mut numerator = 0.0f32;
        let mut denominator = 0.0f32;
        let mut concerns = Vec::new();

        for correction in &corrections {
            let authority = correction.authority_weight.clamp(0.0, 1.0);
            numerator += authority * (correction.overall_rating as f32 / 5.0);
            denominator += authority;

            if let Some(quality) = &correction.corrections.answer_quality {
                if let Some(items) = quality.get("concerns").and_then(|c| c.as_array()) {
                    concerns.extend(
                        items
                            .iter()
                            .filter_map(|i| i.as_str())
                            .map(String::from),
                    );
                }
            }
        }

        let score = if denominator > 0.0 {
            Some(numerator / denominator)
        } else {
            None
        };
        (score, concerns)
    }
}

/// Reject out-of-range options before admission. No partial state is written
/// for rejected requests.
fn validate_request(request: &QueryRequest) -> LexflowResult<()> {
    if request.text.trim().is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "text".to_string(),
        }
        .into());
    }
    if !(1..=10).contains(&request.options.max_iterations) {
        return Err(ValidationError::OutOfRange {
            field: "options.max_iterations".to_string(),
            value: request.options.max_iterations.to_string(),
            reason: "must be between 1 and 10".to_string(),
        }
        .into());
    }
    if !(1000..=120_000).contains(&request.options.timeout_ms) {
        return Err(ValidationError::OutOfRange {
            field: "options.timeout_ms".to_string(),
            value: request.options.timeout_ms.to_string(),
            reason: "must be between 1000 and 120000".to_string(),
        }
        .into());
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lexflow_core::{
        AgentInvocation, AgentKind, IntentTag, QueryOptions, RequestStatus, RetrievalHit,
        SourceTag, SynthesisMode,
    };
    use lexflow_llm::{ChatRequest, ChatResponse, MockChatProvider};
    use lexflow_retrieval::RetrievalAgent;
    use lexflow_storage::MemoryStore;

    struct StubAgent {
        kind: AgentKind,
        source: SourceTag,
    }

    #[async_trait]
    impl RetrievalAgent for StubAgent {
        fn kind(&self) -> AgentKind {
            self.kind
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn run(
            &self,
            _snapshot: &RetrievalSnapshot,
            _invocation: &AgentInvocation,
        ) -> LexflowResult<lexflow_core::AgentResult> {
            Ok(lexflow_core::AgentResult {
                agent: self.kind,
                source: self.source,
                hits: vec![RetrievalHit {
                    source_id: "norm:cc:1321".to_string(),
                    citation: "Art. 1321 c.c.".to_string(),
                    snippet: "Il contratto è l'accordo di due o più parti.".to_string(),
                    relevance: 0.95,
                    metadata: serde_json::Value::Null,
                }],
                latency_ms: 1,
                error: None,
            })
        }
    }

    fn registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        registry.insert(
            AgentKind::Graph,
            Arc::new(StubAgent {
                kind: AgentKind::Graph,
                source: SourceTag::Normattiva,
            }) as Arc<dyn RetrievalAgent>,
        );
        registry.insert(
            AgentKind::Vector,
            Arc::new(StubAgent {
                kind: AgentKind::Vector,
                source: SourceTag::Vector,
            }) as Arc<dyn RetrievalAgent>,
        );
        registry
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

    fn plan_json(budget: i32) -> String {
        serde_json::json!({
            "agents": [
                {"agent": "graph", "query_rewrites": ["art. 1321 c.c."]},
                {"agent": "vector", "query_rewrites": ["nozione di contratto"]}
            ],
            "experts": ["literal"],
            "synthesis": "auto",
            "iteration_budget": budget,
            "rationale": "norm lookup"
        })
        .to_string()
    }

    fn opinion_json(confidence: f32) -> String {
        serde_json::json!({
            "interpretation": "Il contratto è l'accordo di due o più parti.",
            "conclusion_label": "definizione codicistica",
            "legal_bases": [{"citation": "Art. 1321 c.c.", "role": "fondamento", "weight": 0.9}],
            "reasoning_steps": ["lettura del testo"],
            "confidence": confidence,
            "breakdown": {
                "norm_clarity": 0.9,
                "jurisprudence_alignment": 0.8,
                "contextual_ambiguity": 0.2,
                "source_availability": 0.9
            },
            "limitations": "Non considera la giurisprudenza più recente."
        })
        .to_string()
    }

    fn synthesis_json() -> String {
        serde_json::json!({
            "claims": [{
                "text": "Ai sensi dell'art. 1321 c.c., il contratto è l'accordo di due o più parti.",
                "source_ids": ["norm:cc:1321"],
                "experts": ["literal"]
            }],
            "alternatives": []
        })
        .to_string()
    }

    fn request(text: &str) -> QueryRequest {
        QueryRequest {
            text: text.to_string(),
            session_id: None,
            hints: None,
            options: QueryOptions::default(),
        }
    }

    fn runtime(chat: Arc<dyn ChatProvider>, agents: AgentRegistry) -> WorkflowRuntime {
        WorkflowRuntime::new(
            EngineConfig::default(),
            chat,
            None,
            None,
            agents,
            Arc::new(MemoryStore::new()),
        )
        .expect("default config is valid")
    }

    #[tokio::test]
    async fn test_happy_path_convergent() {
        let chat = Arc::new(MockChatProvider::scripted(vec![
            Ok(understanding_json()),
            Ok(plan_json(1)),
            Ok(opinion_json(0.92)),
            Ok(synthesis_json()),
        ]));
        let runtime = runtime(chat, registry());

        let outcome = runtime
            .execute(request("Cosa prevede l'art. 1321 c.c. sui contratti?"))
            .await
            .unwrap();

        assert_eq!(outcome.trace.status, RequestStatus::Success);
        assert_eq!(
            outcome.trace.stop_reason,
            Some(StopReason::HighConfidenceAndConsensus)
        );
        assert_eq!(outcome.trace.iterations.len(), 1);

        let context = outcome.trace.query_context.as_ref().unwrap();
        assert_eq!(context.intent, IntentTag::NormSearch);
        assert!(context
            .norm_references
            .contains(&"art. 1321 c.c.".to_string()));

        let answer = outcome.answer.unwrap();
        assert_eq!(answer.synthesis_mode, SynthesisMode::Convergent);
        assert!((answer.consensus - 1.0).abs() < 1e-6);
        assert!(!answer.provenance.is_empty());
    }

    #[tokio::test]
    async fn test_refinement_loop_two_iterations() {
        // Iteration 1 at confidence 0.70 continues; iteration 2 at 0.92 stops
        let chat = Arc::new(MockChatProvider::scripted(vec![
            Ok(understanding_json()),
            Ok(plan_json(3)),
            Ok(opinion_json(0.70)),
            Ok(synthesis_json()),
            Ok(plan_json(3)),
            Ok(opinion_json(0.92)),
            Ok(synthesis_json()),
        ]));
        let runtime = runtime(chat, registry());

        let outcome = runtime
            .execute(request("Cosa prevede l'art. 1321 c.c.?"))
            .await
            .unwrap();

        assert_eq!(outcome.trace.iterations.len(), 2);
        assert_eq!(
            outcome.trace.stop_reason,
            Some(StopReason::HighConfidenceAndConsensus)
        );
        // Confidence is monotonically non-decreasing across the records
        let confidences: Vec<f32> = outcome
            .trace
            .iterations
            .iter()
            .map(|i| i.metrics.confidence)
            .collect();
        assert!(confidences.windows(2).all(|w| w[0] <= w[1]));
        // Indices are contiguous from 1
        let indices: Vec<i32> = outcome.trace.iterations.iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_degraded_success_without_graph_agent() {
        // The plan asks for graph + vector, but only vector is registered:
        // the graph result degrades, vector supplies hits, status is partial
        let chat = Arc::new(MockChatProvider::scripted(vec![
            Ok(understanding_json()),
            Ok(plan_json(1)),
            Ok(opinion_json(0.92)),
            Ok(synthesis_json()),
        ]));
        let mut agents = AgentRegistry::new();
        agents.insert(
            AgentKind::Vector,
            Arc::new(StubAgent {
                kind: AgentKind::Vector,
                source: SourceTag::Vector,
            }) as Arc<dyn RetrievalAgent>,
        );
        let runtime = runtime(chat, agents);

        let outcome = runtime
            .execute(request("Cosa prevede l'art. 1321 c.c.?"))
            .await
            .unwrap();

        assert_eq!(outcome.trace.status, RequestStatus::Partial);
        assert!(outcome
            .trace
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::AgentDegraded));
        // The vector agent still produced an answerable context
        assert!(!outcome.trace.iterations.is_empty());
        assert!(outcome.answer.is_some());
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_options() {
        let chat = Arc::new(MockChatProvider::fixed("unused"));
        let runtime = runtime(chat, registry());

        let mut bad = request("query");
        bad.options.timeout_ms = 500;
        assert!(runtime.execute(bad).await.is_err());

        let mut bad = request("query");
        bad.options.max_iterations = 11;
        assert!(runtime.execute(bad).await.is_err());

        let empty = request("   ");
        assert!(runtime.execute(empty).await.is_err());
    }

    #[tokio::test]
    async fn test_trace_persisted_with_usable_snapshot() {
        let chat = Arc::new(MockChatProvider::scripted(vec![
            Ok(understanding_json()),
            Ok(plan_json(1)),
            Ok(opinion_json(0.92)),
            Ok(synthesis_json()),
        ]));
        let durable = Arc::new(MemoryStore::new());
        let runtime = WorkflowRuntime::new(
            EngineConfig::default(),
            chat,
            None,
            None,
            registry(),
            durable.clone(),
        )
        .unwrap();

        let outcome = runtime
            .execute(request("Cosa prevede l'art. 1321 c.c.?"))
            .await
            .unwrap();

        let stored = durable
            .fetch_trace(outcome.trace.trace_id)
            .await
            .unwrap()
            .expect("trace should be persisted");
        assert_eq!(stored.trace_id, outcome.trace.trace_id);
        assert_eq!(stored.iterations.len(), 1);
        assert_eq!(stored.current_answer().unwrap().text, outcome.answer.unwrap().text);
    }

    /// Provider that answers slowly, for deadline tests.
    struct SlowChat {
        delay: Duration,
    }

    #[async_trait]
    impl ChatProvider for SlowChat {
        async fn chat(&self, _request: ChatRequest) -> LexflowResult<ChatResponse> {
            tokio::time::sleep(self.delay).await;
            Ok(ChatResponse {
                text: "not json".to_string(),
                model_id: "slow".to_string(),
                input_tokens: 1,
                output_tokens: 1,
            })
        }

        fn model_id(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_timeout_returns_partial_with_best_seen() {
        let chat = Arc::new(SlowChat {
            delay: Duration::from_millis(400),
        });
        let mut config = EngineConfig::default();
        config.llm.json_max_retries = 1;
        config.timeouts.preprocessing = Duration::from_millis(100);
        let runtime = WorkflowRuntime::new(
            config,
            chat,
            None,
            None,
            registry(),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let mut req = request("Cosa prevede l'art. 1321 c.c.?");
        req.options.timeout_ms = 1000;
        req.options.max_iterations = 5;

        let outcome = runtime.execute(req).await.unwrap();

        assert_eq!(outcome.trace.stop_reason, Some(StopReason::Timeout));
        assert!(outcome
            .trace
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::Timeout));
        // At least one iteration completed under degraded nodes: partial
        if outcome.trace.iterations.is_empty() {
            assert_eq!(outcome.trace.status, RequestStatus::Failed);
            assert!(outcome.answer.is_none());
        } else {
            assert_eq!(outcome.trace.status, RequestStatus::Partial);
            assert!(outcome.answer.is_some());
        }
    }
}
