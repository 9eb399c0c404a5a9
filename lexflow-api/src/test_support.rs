//! Shared fixtures for API-layer tests
//!
//! Builds an AppState over memory backends, a stub retrieval agent, and a
//! scripted chat provider so middleware and routes can be driven with
//! `tower::ServiceExt::oneshot`.

use crate::config::ApiConfig;
use crate::state::AppState;
use async_trait::async_trait;
use lexflow_core::{
    AgentInvocation, AgentKind, AgentResult, CredentialRecord, EngineConfig, LexflowResult,
    PrincipalRole, RateLimitTier, RetrievalHit, SourceTag,
};
use lexflow_engine::WorkflowRuntime;
use lexflow_llm::MockChatProvider;
use lexflow_retrieval::{AgentRegistry, RetrievalAgent, RetrievalSnapshot};
use lexflow_storage::{DurableStore, MemoryCounter, MemoryStore};
use std::sync::Arc;
use std::time::Duration;

struct StubVectorAgent;

#[async_trait]
impl RetrievalAgent for StubVectorAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Vector
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn run(
        &self,
        _snapshot: &RetrievalSnapshot,
        _invocation: &AgentInvocation,
    ) -> LexflowResult<AgentResult> {
        Ok(AgentResult {
            agent: AgentKind::Vector,
            source: SourceTag::Vector,
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

fn plan_json() -> String {
    serde_json::json!({
        "agents": [{"agent": "vector", "query_rewrites": ["nozione di contratto"]}],
        "experts": ["literal"],
        "synthesis": "auto",
        "iteration_budget": 1,
        "rationale": "norm lookup"
    })
    .to_string()
}

fn opinion_json() -> String {
    serde_json::json!({
        "interpretation": "Il contratto è l'accordo di due o più parti.",
        "conclusion_label": "definizione codicistica",
        "legal_bases": [{"citation": "Art. 1321 c.c.", "role": "fondamento", "weight": 0.9}],
        "reasoning_steps": ["lettura del testo"],
        "confidence": 0.92,
        "breakdown": {
            "norm_clarity": 0.9,
            "jurisprudence_alignment": 0.8,
            "contextual_ambiguity": 0.2,
            "source_availability": 0.9
        },
        "limitations": ""
    })
    .to_string()
}

fn synthesis_json() -> String {
    serde_json::json!({
        "claims": [{
            "text": "Il contratto è l'accordo di due o più parti.",
            "source_ids": ["norm:cc:1321"],
            "experts": ["literal"]
        }],
        "alternatives": []
    })
    .to_string()
}

/// One clean iteration: understanding, plan, opinion, synthesis. The high
/// confidence and full consensus stop the loop after iteration one.
fn scripted_chat() -> Arc<MockChatProvider> {
    Arc::new(MockChatProvider::scripted(vec![
        Ok(understanding_json()),
        Ok(plan_json()),
        Ok(opinion_json()),
        Ok(synthesis_json()),
    ]))
}

pub async fn state_with_credential(record: CredentialRecord) -> AppState {
    let durable: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    durable.insert_credential(&record).await.unwrap();

    let mut agents = AgentRegistry::new();
    agents.insert(
        AgentKind::Vector,
        Arc::new(StubVectorAgent) as Arc<dyn RetrievalAgent>,
    );

    let runtime = WorkflowRuntime::new(
        EngineConfig::default(),
        scripted_chat(),
        None,
        None,
        agents,
        durable.clone(),
    )
    .expect("default config is valid");

    AppState::new(
        Arc::new(runtime),
        durable,
        Arc::new(MemoryCounter::new()),
        None,
        None,
        EngineConfig::default(),
        ApiConfig::default(),
    )
}

/// State with one standard-tier user credential.
pub async fn test_state(secret: &str) -> AppState {
    state_with_credential(CredentialRecord::new(
        secret,
        PrincipalRole::User,
        RateLimitTier::Standard,
    ))
    .await
}

/// State with one user credential on the given tier.
pub async fn test_state_with_tier(secret: &str, tier: RateLimitTier) -> AppState {
    state_with_credential(CredentialRecord::new(secret, PrincipalRole::User, tier)).await
}

/// State with one standard-tier credential of the given role.
pub async fn test_state_with_role(secret: &str, role: PrincipalRole) -> AppState {
    state_with_credential(CredentialRecord::new(
        secret,
        role,
        RateLimitTier::Standard,
    ))
    .await
}
