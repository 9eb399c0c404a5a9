//! Graph store client and graph retrieval agent
//!
//! The legal knowledge graph holds `Norm`, `Case`, `Doctrine`, and
//! `Contribution` nodes linked to `Concept` nodes. The same client serves
//! preprocessing enrichment and the graph agent; queries are parameterized
//! Cypher, never string-built from user input.

use crate::{RetrievalAgent, RetrievalSnapshot};
use async_trait::async_trait;
use lexflow_core::{
    AgentInvocation, AgentKind, AgentResult, BackendError, EnrichedContext, EnrichedItem,
    IntentTag, LexflowError, LexflowResult, RetrievalHit, SourceTag,
};
use neo4rs::{Graph, Query};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn graph_err(e: impl std::fmt::Display) -> LexflowError {
    LexflowError::Backend(BackendError::GraphUnavailable {
        reason: e.to_string(),
    })
}

// ============================================================================
// GRAPH CLIENT
// ============================================================================

/// Connection handle to the legal knowledge graph.
///
/// neo4rs pools bolt connections internally; the handle is cheap to clone
/// and shared between enrichment and the graph agent.
#[derive(Clone)]
pub struct GraphClient {
    graph: Arc<Graph>,
}

impl GraphClient {
    /// Connect to the graph store.
    pub async fn connect(uri: &str, user: &str, password: &str) -> LexflowResult<Self> {
        let graph = Graph::new(uri, user, password).await.map_err(graph_err)?;
        Ok(Self {
            graph: Arc::new(graph),
        })
    }

    /// Round-trip probe for health reporting. Returns latency in ms.
    pub async fn ping(&self) -> LexflowResult<i64> {
        let started = Instant::now();
        let mut rows = self
            .graph
            .execute(Query::new("RETURN 1 AS one".to_string()))
            .await
            .map_err(graph_err)?;
        let _ = rows.next().await.map_err(graph_err)?;
        Ok(started.elapsed().as_millis() as i64)
    }

    async fn fetch_items(
        &self,
        cypher: &str,
        keys: &[String],
        limit: i64,
        source: SourceTag,
    ) -> LexflowResult<Vec<EnrichedItem>> {
        let query = Query::new(cypher.to_string())
            .param("keys", keys.to_vec())
            .param("limit", limit);

        let mut rows = self.graph.execute(query).await.map_err(graph_err)?;
        let mut items = Vec::new();

        while let Some(row) = rows.next().await.map_err(graph_err)? {
            let source_id: String = row.get("id").map_err(graph_err)?;
            let citation: String = row.get("citation").map_err(graph_err)?;
            let summary: String = row.get("summary").map_err(graph_err)?;
            let confidence: f64 = row.get("confidence").map_err(graph_err)?;

            items.push(EnrichedItem {
                source_id,
                citation,
                summary,
                source,
                confidence: (confidence as f32).clamp(0.0, 1.0),
            });
        }

        Ok(items)
    }

    /// Norms related to the given entity keys.
    pub async fn related_norms(
        &self,
        keys: &[String],
        limit: i64,
    ) -> LexflowResult<Vec<EnrichedItem>> {
        self.fetch_items(
            "MATCH (n:Norm)-[:ABOUT]->(c:Concept)
             WHERE c.name IN $keys OR n.citation IN $keys
             RETURN n.id AS id, n.citation AS citation,
                    coalesce(n.summary, '') AS summary,
                    coalesce(n.weight, 0.8) AS confidence
             ORDER BY confidence DESC LIMIT $limit",
            keys,
            limit,
            SourceTag::Normattiva,
        )
        .await
    }

    /// Case law related to the given entity keys.
    pub async fn related_case_law(
        &self,
        keys: &[String],
        limit: i64,
    ) -> LexflowResult<Vec<EnrichedItem>> {
        self.fetch_items(
            "MATCH (k:Case)-[:INTERPRETS]->(n:Norm)-[:ABOUT]->(c:Concept)
             WHERE c.name IN $keys OR n.citation IN $keys
             RETURN k.id AS id, k.citation AS citation,
                    coalesce(k.holding, '') AS summary,
                    coalesce(k.weight, 0.7) AS confidence
             ORDER BY confidence DESC LIMIT $limit",
            keys,
            limit,
            SourceTag::Cassazione,
        )
        .await
    }

    /// Doctrine related to the given entity keys.
    pub async fn related_doctrine(
        &self,
        keys: &[String],
        limit: i64,
    ) -> LexflowResult<Vec<EnrichedItem>> {
        self.fetch_items(
            "MATCH (d:Doctrine)-[:DISCUSSES]->(c:Concept)
             WHERE c.name IN $keys
             RETURN d.id AS id, d.citation AS citation,
                    coalesce(d.thesis, '') AS summary,
                    coalesce(d.weight, 0.6) AS confidence
             ORDER BY confidence DESC LIMIT $limit",
            keys,
            limit,
            SourceTag::Doctrine,
        )
        .await
    }

    /// Community contributions related to the given entity keys.
    pub async fn community_contributions(
        &self,
        keys: &[String],
        limit: i64,
    ) -> LexflowResult<Vec<EnrichedItem>> {
        self.fetch_items(
            "MATCH (k:Contribution)-[:ABOUT]->(c:Concept)
             WHERE c.name IN $keys
             RETURN k.id AS id, coalesce(k.title, k.id) AS citation,
                    coalesce(k.body, '') AS summary,
                    coalesce(k.consensus, 0.5) AS confidence
             ORDER BY confidence DESC LIMIT $limit",
            keys,
            limit,
            SourceTag::Community,
        )
        .await
    }

    /// Concepts among the given keys that the graph flags as controversial.
    pub async fn controversy_flags(&self, keys: &[String]) -> LexflowResult<Vec<String>> {
        let query = Query::new(
            "MATCH (c:Concept)
             WHERE c.name IN $keys AND c.controversial = true
             RETURN c.name AS name"
                .to_string(),
        )
        .param("keys", keys.to_vec());

        let mut rows = self.graph.execute(query).await.map_err(graph_err)?;
        let mut flags = Vec::new();
        while let Some(row) = rows.next().await.map_err(graph_err)? {
            let name: String = row.get("name").map_err(graph_err)?;
            flags.push(name);
        }
        Ok(flags)
    }

    /// Enrich a query's context, with the category emphasis chosen per
    /// intent. Each intent maps to a distinct query shape.
    pub async fn enrich(
        &self,
        intent: IntentTag,
        keys: &[String],
        limit: i64,
    ) -> LexflowResult<EnrichedContext> {
        let mut context = EnrichedContext::default();
        if keys.is_empty() {
            return Ok(context);
        }

        match intent {
            IntentTag::NormSearch => {
                context.norms = self.related_norms(keys, limit).await?;
                context.case_law = self.related_case_law(keys, limit / 2).await?;
            }
            IntentTag::Interpretation => {
                context.norms = self.related_norms(keys, limit).await?;
                context.doctrine = self.related_doctrine(keys, limit).await?;
                context.case_law = self.related_case_law(keys, limit / 2).await?;
            }
            IntentTag::ComplianceCheck => {
                context.norms = self.related_norms(keys, limit).await?;
                context.case_law = self.related_case_law(keys, limit).await?;
            }
            IntentTag::DocumentDrafting => {
                context.norms = self.related_norms(keys, limit).await?;
                context.doctrine = self.related_doctrine(keys, limit / 2).await?;
            }
            IntentTag::RiskSpotting => {
                context.case_law = self.related_case_law(keys, limit).await?;
                context.norms = self.related_norms(keys, limit / 2).await?;
            }
            IntentTag::Unknown => {
                context.norms = self.related_norms(keys, limit / 2).await?;
                context.case_law = self.related_case_law(keys, limit / 2).await?;
                context.doctrine = self.related_doctrine(keys, limit / 2).await?;
            }
        }

        context.community = self.community_contributions(keys, limit / 2).await?;
        context.controversy_flags = self.controversy_flags(keys).await?;
        Ok(context)
    }

    /// Full-text search used by the graph agent.
    pub async fn search(&self, terms: &[String], limit: i64) -> LexflowResult<Vec<RetrievalHit>> {
        let query = Query::new(
            "CALL db.index.fulltext.queryNodes('legal_sources', $needle)
             YIELD node, score
             RETURN node.id AS id, node.citation AS citation,
                    coalesce(node.summary, node.holding, node.body, '') AS snippet,
                    labels(node)[0] AS category, score
             LIMIT $limit"
                .to_string(),
        )
        .param("needle", terms.join(" OR "))
        .param("limit", limit);

        let mut rows = self.graph.execute(query).await.map_err(graph_err)?;
        let mut hits = Vec::new();
        let mut max_score: f64 = 0.0;

        let mut raw: Vec<(String, String, String, String, f64)> = Vec::new();
        while let Some(row) = rows.next().await.map_err(graph_err)? {
            let id: String = row.get("id").map_err(graph_err)?;
            let citation: String = row.get("citation").map_err(graph_err)?;
            let snippet: String = row.get("snippet").map_err(graph_err)?;
            let category: String = row.get("category").map_err(graph_err)?;
            let score: f64 = row.get("score").map_err(graph_err)?;
            max_score = max_score.max(score);
            raw.push((id, citation, snippet, category, score));
        }

        for (id, citation, snippet, category, score) in raw {
            // Lucene scores are unbounded; normalize against the best hit
            let relevance = if max_score > 0.0 {
                (score / max_score) as f32
            } else {
                0.0
            };
            hits.push(RetrievalHit {
                source_id: id,
                citation,
                snippet,
                relevance,
                metadata: serde_json::json!({ "category": category }),
            });
        }

        Ok(hits)
    }
}

impl std::fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphClient").finish()
    }
}

// ============================================================================
// GRAPH AGENT
// ============================================================================

/// Map a graph node label to its source tag.
fn category_source(category: &str) -> SourceTag {
    match category {
        "Case" => SourceTag::Cassazione,
        "Doctrine" => SourceTag::Doctrine,
        "Contribution" => SourceTag::Community,
        _ => SourceTag::Normattiva,
    }
}

/// Retrieval agent over the knowledge graph.
pub struct GraphAgent {
    client: GraphClient,
    timeout: Duration,
}

impl GraphAgent {
    pub fn new(client: GraphClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl RetrievalAgent for GraphAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Graph
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        snapshot: &RetrievalSnapshot,
        invocation: &AgentInvocation,
    ) -> LexflowResult<AgentResult> {
        let mut terms = invocation.query_rewrites.clone();
        if terms.is_empty() {
            terms.push(snapshot.query_text.clone());
        }

        let mut hits = self.client.search(&terms, invocation.top_k as i64).await?;
        hits.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        hits.truncate(invocation.top_k as usize);

        // Label the result with the dominant category of its hits
        let source = hits
            .iter()
            .filter_map(|h| h.metadata.get("category").and_then(|c| c.as_str()))
            .fold(std::collections::HashMap::new(), |mut acc, c| {
                *acc.entry(category_source(c)).or_insert(0usize) += 1;
                acc
            })
            .into_iter()
            .max_by_key(|(tag, count)| (*count, std::cmp::Reverse(tag.as_db_str())))
            .map(|(tag, _)| tag)
            .unwrap_or(SourceTag::Normattiva);

        Ok(AgentResult {
            agent: AgentKind::Graph,
            source,
            hits,
            latency_ms: 0,
            error: None,
        })
    }
}
