//! Anthropic (Claude) chat adapter with request pacing

use crate::{ChatProvider, ChatRequest, ChatResponse};
use async_trait::async_trait;
use lexflow_core::{GatewayError, LexflowError, LexflowResult};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
    max_tokens: i32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    model: String,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: i64,
    output_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct VendorError {
    error: VendorErrorBody,
}

#[derive(Debug, Deserialize)]
struct VendorErrorBody {
    message: String,
}

// ============================================================================
// PROVIDER
// ============================================================================

/// Anthropic messages-API adapter.
///
/// Concurrency toward the vendor is bounded by a semaphore sized to the
/// configured requests-per-minute budget.
pub struct AnthropicChatProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    permits: Arc<Semaphore>,
}

impl AnthropicChatProvider {
    /// Create a new adapter.
    ///
    /// # Arguments
    /// * `api_key` - Anthropic API key
    /// * `model` - Model name (e.g. "claude-3-5-sonnet-20241022")
    /// * `requests_per_minute` - Vendor-side pacing budget
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        requests_per_minute: u32,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            model: model.into(),
            permits: Arc::new(Semaphore::new((requests_per_minute as usize).max(1))),
        }
    }

    /// Override the API base URL (for gateways and tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn extract_text(content: Vec<ContentBlock>) -> String {
        content
            .into_iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl ChatProvider for AnthropicChatProvider {
    async fn chat(&self, request: ChatRequest) -> LexflowResult<ChatResponse> {
        let _permit = self.permits.acquire().await.map_err(|e| {
            LexflowError::Gateway(GatewayError::Vendor {
                provider: "anthropic".to_string(),
                status: 0,
                message: format!("pacing semaphore closed: {}", e),
            })
        })?;

        let body = MessageRequest {
            model: self.model.clone(),
            system: request.system,
            messages: vec![Message {
                role: "user",
                content: request.user,
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                LexflowError::Gateway(GatewayError::Vendor {
                    provider: "anthropic".to_string(),
                    status: 0,
                    message: format!("HTTP request failed: {}", e),
                })
            })?;

        let status = response.status();
        if status.is_success() {
            let parsed: MessageResponse = response.json().await.map_err(|e| {
                LexflowError::Gateway(GatewayError::Vendor {
                    provider: "anthropic".to_string(),
                    status: status.as_u16() as i32,
                    message: format!("Failed to parse response: {}", e),
                })
            })?;

            Ok(ChatResponse {
                text: Self::extract_text(parsed.content),
                model_id: parsed.model,
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
            })
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = serde_json::from_str::<VendorError>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);

            Err(match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    LexflowError::Gateway(GatewayError::RateLimited {
                        provider: "anthropic".to_string(),
                        retry_after_ms: 1000,
                    })
                }
                _ => LexflowError::Gateway(GatewayError::Vendor {
                    provider: "anthropic".to_string(),
                    status: status.as_u16() as i32,
                    message,
                }),
            })
        }
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Debug for AnthropicChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicChatProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_joins_blocks() {
        let content = vec![
            ContentBlock::Text {
                text: "prima".to_string(),
            },
            ContentBlock::Text {
                text: "seconda".to_string(),
            },
        ];
        assert_eq!(
            AnthropicChatProvider::extract_text(content),
            "prima\nseconda"
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let provider = AnthropicChatProvider::new("sk-ant-secret", "claude-3-5-sonnet-20241022", 50);
        let debug = format!("{:?}", provider);
        assert!(!debug.contains("sk-ant-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
