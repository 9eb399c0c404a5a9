//! Normative-text service client and HTTP retrieval agent
//!
//! The external service resolves canonical article references to their
//! official texts. 5xx and network errors are retried twice with a short
//! backoff; a persistent failure degrades to an empty result upstream.

use crate::{RetrievalAgent, RetrievalSnapshot};
use async_trait::async_trait;
use lexflow_core::{
    AgentInvocation, AgentKind, AgentResult, BackendError, LexflowError, LexflowResult,
    RetrievalHit, SourceTag,
};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

// ============================================================================
// CLIENT
// ============================================================================

/// One resolved article from the normative-text service.
#[derive(Debug, Clone, Deserialize)]
pub struct ArticleText {
    pub id: String,
    pub citation: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// HTTP client for the normative-text retrieval service.
pub struct NormativeTextClient {
    client: Client,
    base_url: String,
    retries: u32,
}

impl NormativeTextClient {
    pub fn new(base_url: impl Into<String>, retries: u32) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            retries,
        }
    }

    /// Resolve one article reference, retrying on 5xx and network errors.
    pub async fn fetch_article(&self, reference: &str) -> LexflowResult<ArticleText> {
        let url = format!("{}/articles", self.base_url);
        let mut last_error: Option<LexflowError> = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
            }

            let result = self
                .client
                .get(&url)
                .query(&[("ref", reference)])
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<ArticleText>().await.map_err(|e| {
                            LexflowError::Backend(BackendError::HttpStatus {
                                status: status.as_u16() as i32,
                                reason: format!("malformed article payload: {}", e),
                            })
                        });
                    }

                    let error = LexflowError::Backend(BackendError::HttpStatus {
                        status: status.as_u16() as i32,
                        reason: format!("article lookup failed for '{}'", reference),
                    });

                    // Only 5xx is worth retrying; 4xx means the reference is bad
                    if status.is_server_error() {
                        tracing::debug!(%reference, %status, attempt, "retrying article lookup");
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
                Err(e) => {
                    tracing::debug!(%reference, error = %e, attempt, "article lookup network error");
                    last_error = Some(LexflowError::Backend(BackendError::HttpStatus {
                        status: 0,
                        reason: format!("network error: {}", e),
                    }));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            LexflowError::Backend(BackendError::HttpStatus {
                status: 0,
                reason: "article lookup failed with no attempts".to_string(),
            })
        }))
    }
}

impl std::fmt::Debug for NormativeTextClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormativeTextClient")
            .field("base_url", &self.base_url)
            .field("retries", &self.retries)
            .finish()
    }
}

// ============================================================================
// HTTP AGENT
// ============================================================================

/// Retrieval agent over the normative-text service.
///
/// References come from the preprocessed norm citations; a rewrite that looks
/// like a citation is accepted too. Each resolved article is an exact text,
/// so relevance is fixed at 1.0.
pub struct HttpAgent {
    client: NormativeTextClient,
    timeout: Duration,
}

impl HttpAgent {
    pub fn new(client: NormativeTextClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn looks_like_reference(text: &str) -> bool {
        let lowered = text.to_lowercase();
        lowered.starts_with("art.")
            || lowered.starts_with("artt.")
            || lowered.contains("d.lgs.")
            || lowered.contains("d.p.r.")
    }
}

#[async_trait]
impl RetrievalAgent for HttpAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Http
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        &self,
        snapshot: &RetrievalSnapshot,
        invocation: &AgentInvocation,
    ) -> LexflowResult<AgentResult> {
        let mut references: Vec<String> = snapshot.norm_references.clone();
        references.extend(
            invocation
                .query_rewrites
                .iter()
                .filter(|r| Self::looks_like_reference(r))
                .cloned(),
        );
        let mut seen = std::collections::HashSet::new();
        references.retain(|r| seen.insert(r.to_lowercase()));

        let mut hits = Vec::new();
        let mut first_error: Option<String> = None;

        for reference in references.iter().take(invocation.top_k as usize) {
            match self.client.fetch_article(reference).await {
                Ok(article) => hits.push(RetrievalHit {
                    source_id: article.id,
                    citation: article.citation,
                    snippet: article.text,
                    relevance: 1.0,
                    metadata: article.metadata,
                }),
                Err(e) => {
                    tracing::warn!(%reference, error = %e, "article lookup degraded");
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        Ok(AgentResult {
            agent: AgentKind::Http,
            source: SourceTag::Normattiva,
            hits,
            latency_ms: 0,
            error: first_error,
        })
    }
}
