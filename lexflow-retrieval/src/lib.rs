//! Lexflow Retrieval - Agent Fan-Out
//!
//! Three agent kinds behind one contract:
//! - Graph agent: parameterized Cypher over the legal knowledge graph
//! - HTTP agent: canonical article texts from the normative-text service
//! - Vector agent: k-NN semantic neighbors from the vector store
//!
//! All agents in a plan run concurrently under a shared cancellation token
//! with per-agent timeouts. A failed, timed-out, or cancelled agent yields an
//! empty result with an error annotation; the workflow never aborts on
//! retrieval. Results are merged deterministically by source tag.

mod graph;
mod http;
mod vector;

pub use graph::{GraphAgent, GraphClient};
pub use http::{HttpAgent, NormativeTextClient};
pub use vector::VectorAgent;

use async_trait::async_trait;
use lexflow_core::{
    AgentInvocation, AgentKind, AgentResult, IntentTag, LexflowResult, SourceTag,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// AGENT CONTRACT
// ============================================================================

/// Read-only view of the request handed to agents.
#[derive(Debug, Clone)]
pub struct RetrievalSnapshot {
    pub query_text: String,
    pub intent: IntentTag,
    /// Canonical norm citations found during preprocessing
    pub norm_references: Vec<String>,
    pub jurisdiction: Option<String>,
}

/// The common capability implemented by every retrieval agent.
///
/// Dispatch is by `kind()`; an agent never aborts the workflow, so `run`
/// errors are converted into degraded results by the fan-out executor.
#[async_trait]
pub trait RetrievalAgent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Per-invocation deadline for this agent.
    fn timeout(&self) -> Duration;

    async fn run(
        &self,
        snapshot: &RetrievalSnapshot,
        invocation: &AgentInvocation,
    ) -> LexflowResult<AgentResult>;
}

/// Registry of the agents available to the runtime, keyed by kind.
pub type AgentRegistry = HashMap<AgentKind, Arc<dyn RetrievalAgent>>;

// ============================================================================
// FAN-OUT EXECUTOR
// ============================================================================

/// Fallback source tag for a degraded result, by agent kind.
fn default_source(kind: AgentKind) -> SourceTag {
    match kind {
        AgentKind::Graph => SourceTag::Normattiva,
        AgentKind::Http => SourceTag::Normattiva,
        AgentKind::Vector => SourceTag::Vector,
    }
}

/// Execute every invocation of the plan concurrently.
///
/// Completion order is not defined; the returned list is deterministic
/// regardless: sorted by (source tag, agent kind), with per-result hits
/// ordered by descending relevance. When the token trips, in-flight agents
/// are abandoned and partial results collected.
pub async fn run_agents(
    registry: &AgentRegistry,
    snapshot: &RetrievalSnapshot,
    invocations: &[AgentInvocation],
    cancel: &CancellationToken,
) -> Vec<AgentResult> {
    let futures = invocations.iter().map(|invocation| {
        let agent = registry.get(&invocation.agent).cloned();
        let cancel = cancel.clone();
        async move {
            let Some(agent) = agent else {
                return AgentResult::degraded(
                    invocation.agent,
                    default_source(invocation.agent),
                    "agent not registered",
                );
            };

            let started = Instant::now();
            let run = agent.run(snapshot, invocation);

            let outcome = tokio::select! {
                outcome = tokio::time::timeout(agent.timeout(), run) => outcome,
                _ = cancel.cancelled() => {
                    tracing::debug!(agent = ?invocation.agent, "agent cancelled by request deadline");
                    return AgentResult::degraded(
                        invocation.agent,
                        default_source(invocation.agent),
                        "cancelled by request deadline",
                    );
                }
            };

            match outcome {
                Ok(Ok(mut result)) => {
                    result.latency_ms = started.elapsed().as_millis() as i64;
                    result
                        .hits
                        .sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
                    result
                }
                Ok(Err(e)) => {
                    tracing::warn!(agent = ?invocation.agent, error = %e, "agent degraded");
                    let mut result = AgentResult::degraded(
                        invocation.agent,
                        default_source(invocation.agent),
                        e.to_string(),
                    );
                    result.latency_ms = started.elapsed().as_millis() as i64;
                    result
                }
                Err(_) => {
                    tracing::warn!(agent = ?invocation.agent, "agent timed out");
                    let mut result = AgentResult::degraded(
                        invocation.agent,
                        default_source(invocation.agent),
                        format!("timed out after {:?}", agent.timeout()),
                    );
                    result.latency_ms = started.elapsed().as_millis() as i64;
                    result
                }
            }
        }
    });

    let mut results = futures_util::future::join_all(futures).await;
    results.sort_by_key(|r| (r.source.as_db_str(), r.agent.as_db_str()));
    results
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use lexflow_core::RetrievalHit;

    struct ScriptedAgent {
        kind: AgentKind,
        source: SourceTag,
        delay: Duration,
        timeout: Duration,
        fail: bool,
    }

    #[async_trait]
    impl RetrievalAgent for ScriptedAgent {
        fn kind(&self) -> AgentKind {
            self.kind
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        async fn run(
            &self,
            _snapshot: &RetrievalSnapshot,
            invocation: &AgentInvocation,
        ) -> LexflowResult<AgentResult> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(lexflow_core::BackendError::GraphUnavailable {
                    reason: "scripted failure".to_string(),
                }
                .into());
            }
            Ok(AgentResult {
                agent: self.kind,
                source: self.source,
                hits: vec![
                    RetrievalHit {
                        source_id: format!("{}:low", self.source.as_db_str()),
                        citation: "Art. 1322 c.c.".to_string(),
                        snippet: "Autonomia contrattuale".to_string(),
                        relevance: 0.4,
                        metadata: serde_json::Value::Null,
                    },
                    RetrievalHit {
                        source_id: format!("{}:high", self.source.as_db_str()),
                        citation: "Art. 1321 c.c.".to_string(),
                        snippet: "Nozione di contratto".to_string(),
                        relevance: 0.9,
                        metadata: serde_json::Value::Null,
                    },
                ],
                latency_ms: 0,
                error: None,
            })
        }
    }

    fn registry(agents: Vec<ScriptedAgent>) -> AgentRegistry {
        agents
            .into_iter()
            .map(|a| (a.kind, Arc::new(a) as Arc<dyn RetrievalAgent>))
            .collect()
    }

    fn snapshot() -> RetrievalSnapshot {
        RetrievalSnapshot {
            query_text: "Cosa prevede l'art. 1321 c.c.?".to_string(),
            intent: IntentTag::NormSearch,
            norm_references: vec!["art. 1321 c.c.".to_string()],
            jurisdiction: None,
        }
    }

    #[tokio::test]
    async fn test_fan_out_merges_by_source() {
        let registry = registry(vec![
            ScriptedAgent {
                kind: AgentKind::Vector,
                source: SourceTag::Vector,
                delay: Duration::from_millis(5),
                timeout: Duration::from_secs(1),
                fail: false,
            },
            ScriptedAgent {
                kind: AgentKind::Graph,
                source: SourceTag::Normattiva,
                delay: Duration::from_millis(30),
                timeout: Duration::from_secs(1),
                fail: false,
            },
        ]);
        let invocations = vec![
            AgentInvocation::new(AgentKind::Vector, "contratto"),
            AgentInvocation::new(AgentKind::Graph, "contratto"),
        ];

        let results = run_agents(
            &registry,
            &snapshot(),
            &invocations,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(results.len(), 2);
        // Deterministic order: "normattiva" < "vector", whatever finished first
        assert_eq!(results[0].source, SourceTag::Normattiva);
        assert_eq!(results[1].source, SourceTag::Vector);
        // Hits sorted by descending relevance
        assert!(results[0].hits[0].relevance >= results[0].hits[1].relevance);
    }

    #[tokio::test]
    async fn test_failed_agent_yields_degraded_result() {
        let registry = registry(vec![ScriptedAgent {
            kind: AgentKind::Graph,
            source: SourceTag::Normattiva,
            delay: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
            fail: true,
        }]);
        let invocations = vec![AgentInvocation::new(AgentKind::Graph, "contratto")];

        let results = run_agents(
            &registry,
            &snapshot(),
            &invocations,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].hits.is_empty());
        assert!(results[0].error.as_deref().unwrap().contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_slow_agent_times_out() {
        let registry = registry(vec![ScriptedAgent {
            kind: AgentKind::Http,
            source: SourceTag::Normattiva,
            delay: Duration::from_secs(5),
            timeout: Duration::from_millis(20),
            fail: false,
        }]);
        let invocations = vec![AgentInvocation::new(AgentKind::Http, "art. 1321 c.c.")];

        let results = run_agents(
            &registry,
            &snapshot(),
            &invocations,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_abandons_in_flight_agents() {
        let registry = registry(vec![
            ScriptedAgent {
                kind: AgentKind::Vector,
                source: SourceTag::Vector,
                delay: Duration::from_millis(1),
                timeout: Duration::from_secs(1),
                fail: false,
            },
            ScriptedAgent {
                kind: AgentKind::Graph,
                source: SourceTag::Normattiva,
                delay: Duration::from_secs(30),
                timeout: Duration::from_secs(60),
                fail: false,
            },
        ]);
        let invocations = vec![
            AgentInvocation::new(AgentKind::Vector, "contratto"),
            AgentInvocation::new(AgentKind::Graph, "contratto"),
        ];

        let cancel = CancellationToken::new();
        let cancel_soon = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_soon.cancel();
        });

        let results = run_agents(&registry, &snapshot(), &invocations, &cancel).await;

        assert_eq!(results.len(), 2);
        let graph = results
            .iter()
            .find(|r| r.agent == AgentKind::Graph)
            .unwrap();
        let vector = results
            .iter()
            .find(|r| r.agent == AgentKind::Vector)
            .unwrap();
        assert!(graph.error.as_deref().unwrap().contains("cancelled"));
        assert!(vector.error.is_none());
        assert_eq!(vector.hits.len(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_agent_is_degraded() {
        let registry = registry(vec![]);
        let invocations = vec![AgentInvocation::new(AgentKind::Vector, "contratto")];

        let results = run_agents(
            &registry,
            &snapshot(),
            &invocations,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].error.as_deref().unwrap().contains("not registered"));
    }
}
