//! Vector store retrieval agent
//!
//! Embeds each query rewrite, runs k-NN against the Qdrant collection
//! (cosine over unit-normalized vectors), deduplicates hits across rewrites
//! keeping the maximum score, and returns the top-k.

use crate::{RetrievalAgent, RetrievalSnapshot};
use async_trait::async_trait;
use lexflow_core::{
    AgentInvocation, AgentKind, AgentResult, BackendError, LexflowError, LexflowResult,
    RetrievalHit, SourceTag,
};
use lexflow_llm::EmbeddingProvider;
use qdrant_client::qdrant::{self, value::Kind, QueryPointsBuilder};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn vector_err(e: impl std::fmt::Display) -> LexflowError {
    LexflowError::Backend(BackendError::VectorUnavailable {
        reason: e.to_string(),
    })
}

fn payload_str(payload: &HashMap<String, qdrant::Value>, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| match &v.kind {
            Some(Kind::StringValue(s)) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

fn point_id_string(id: &Option<qdrant::PointId>) -> String {
    match id.as_ref().and_then(|p| p.point_id_options.as_ref()) {
        Some(qdrant::point_id::PointIdOptions::Num(n)) => n.to_string(),
        Some(qdrant::point_id::PointIdOptions::Uuid(s)) => s.clone(),
        None => String::new(),
    }
}

/// Retrieval agent over the vector store.
pub struct VectorAgent {
    client: Arc<Qdrant>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
    timeout: Duration,
}

impl VectorAgent {
    pub fn new(
        client: Arc<Qdrant>,
        embedder: Arc<dyn EmbeddingProvider>,
        collection: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            embedder,
            collection: collection.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RetrievalAgent for VectorAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Vector
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        snapshot: &RetrievalSnapshot,
        invocation: &AgentInvocation,
    ) -> LexflowResult<AgentResult> {
        let mut rewrites = invocation.query_rewrites.clone();
        if rewrites.is_empty() {
            rewrites.push(snapshot.query_text.clone());
        }

        let texts: Vec<&str> = rewrites.iter().map(String::as_str).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        // Dedup across rewrites: keep the best score per source id
        let mut best: HashMap<String, RetrievalHit> = HashMap::new();

        for embedding in embeddings {
            let response = self
                .client
                .query(
                    QueryPointsBuilder::new(&self.collection)
                        .query(embedding)
                        .limit(invocation.top_k as u64)
                        .with_payload(true),
                )
                .await
                .map_err(vector_err)?;

            for point in response.result {
                let payload: HashMap<String, qdrant::Value> =
                    point.payload.into_iter().collect();

                let source_id = {
                    let from_payload = payload_str(&payload, "source_id");
                    if from_payload.is_empty() {
                        point_id_string(&point.id)
                    } else {
                        from_payload
                    }
                };

                let hit = RetrievalHit {
                    source_id: source_id.clone(),
                    citation: payload_str(&payload, "citation"),
                    snippet: payload_str(&payload, "text"),
                    relevance: point.score.clamp(0.0, 1.0),
                    metadata: serde_json::json!({
                        "collection": self.collection,
                    }),
                };

                match best.get(&source_id) {
                    Some(existing) if existing.relevance >= hit.relevance => {}
                    _ => {
                        best.insert(source_id, hit);
                    }
                }
            }
        }

        let mut hits: Vec<RetrievalHit> = best.into_values().collect();
        hits.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        hits.truncate(invocation.top_k as usize);

        Ok(AgentResult {
            agent: AgentKind::Vector,
            source: SourceTag::Vector,
            hits,
            latency_ms: 0,
            error: None,
        })
    }
}

impl std::fmt::Debug for VectorAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorAgent")
            .field("collection", &self.collection)
            .field("dimensions", &self.embedder.dimensions())
            .finish()
    }
}
