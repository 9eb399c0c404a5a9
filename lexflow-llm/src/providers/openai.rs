//! OpenAI-compatible chat and embedding adapters
//!
//! Works against api.openai.com and any gateway speaking the same wire
//! format (the usual way a self-hosted router is fronted).

use crate::{ChatProvider, ChatRequest, ChatResponse, EmbeddingProvider};
use async_trait::async_trait;
use lexflow_core::{GatewayError, LexflowError, LexflowResult};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: i32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    model: String,
    choices: Vec<Choice>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    index: usize,
}

fn map_status_error(provider: &str, status: StatusCode, message: String) -> LexflowError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => LexflowError::Gateway(GatewayError::RateLimited {
            provider: provider.to_string(),
            retry_after_ms: 1000,
        }),
        _ => LexflowError::Gateway(GatewayError::Vendor {
            provider: provider.to_string(),
            status: status.as_u16() as i32,
            message,
        }),
    }
}

// ============================================================================
// CHAT PROVIDER
// ============================================================================

/// Chat-completions adapter for OpenAI-compatible endpoints.
pub struct OpenAiChatProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiChatProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.into(),
        }
    }

    /// Override the API base URL (for gateways and tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn chat(&self, request: ChatRequest) -> LexflowResult<ChatResponse> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system {
            messages.push(WireMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(WireMessage {
            role: "user",
            content: request.user,
        });

        let body = CompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            seed: request.seed,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                LexflowError::Gateway(GatewayError::Vendor {
                    provider: "openai".to_string(),
                    status: 0,
                    message: format!("HTTP request failed: {}", e),
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status_error("openai", status, message));
        }

        let parsed: CompletionResponse = response.json().await.map_err(|e| {
            LexflowError::Gateway(GatewayError::Vendor {
                provider: "openai".to_string(),
                status: status.as_u16() as i32,
                message: format!("Failed to parse response: {}", e),
            })
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                LexflowError::Gateway(GatewayError::Vendor {
                    provider: "openai".to_string(),
                    status: status.as_u16() as i32,
                    message: "Response contained no choices".to_string(),
                })
            })?;

        Ok(ChatResponse {
            text,
            model_id: parsed.model,
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Debug for OpenAiChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

// ============================================================================
// EMBEDDING PROVIDER
// ============================================================================

/// Embeddings adapter for OpenAI-compatible endpoints.
///
/// Dimensions are requested explicitly so the vector store schema stays
/// stable regardless of the model default.
pub struct OpenAiEmbeddingProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: i32,
}

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, dimensions: i32) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.into(),
            dimensions,
        }
    }

    /// Override the API base URL (for gateways and tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> LexflowResult<Vec<f32>> {
        let mut batch = self.embed_batch(&[text]).await?;
        batch.pop().ok_or_else(|| {
            LexflowError::Gateway(GatewayError::Vendor {
                provider: "openai".to_string(),
                status: 0,
                message: "Embedding response was empty".to_string(),
            })
        })
    }

    async fn embed_batch(&self, texts: &[&str]) -> LexflowResult<Vec<Vec<f32>>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts.to_vec(),
            dimensions: Some(self.dimensions),
        };

        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                LexflowError::Gateway(GatewayError::Vendor {
                    provider: "openai".to_string(),
                    status: 0,
                    message: format!("HTTP request failed: {}", e),
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status_error("openai", status, message));
        }

        let mut parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            LexflowError::Gateway(GatewayError::Vendor {
                provider: "openai".to_string(),
                status: status.as_u16() as i32,
                message: format!("Failed to parse response: {}", e),
            })
        })?;

        // The API may reorder; restore input order by index
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimensions(&self) -> i32 {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Debug for OpenAiEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbeddingProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_request_serializes_seed_only_when_set() {
        let without_seed = CompletionRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![],
            max_tokens: 10,
            temperature: 0.2,
            seed: None,
        };
        let json = serde_json::to_string(&without_seed).unwrap();
        assert!(!json.contains("seed"));

        let with_seed = CompletionRequest {
            seed: Some(42),
            ..without_seed
        };
        let json = serde_json::to_string(&with_seed).unwrap();
        assert!(json.contains("\"seed\":42"));
    }

    #[test]
    fn test_debug_redacts_key() {
        let provider = OpenAiChatProvider::new("sk-secret", "gpt-4o-mini");
        assert!(!format!("{:?}", provider).contains("sk-secret"));
    }
}
