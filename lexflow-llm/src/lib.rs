//! Lexflow LLM - Gateway Abstraction Layer
//!
//! Provider-agnostic async traits for chat completion and embeddings.
//! Features:
//! - Async traits with tokio support
//! - OpenAI-compatible and Anthropic adapters
//! - Layered JSON-output contract (cleanup, strict parse, validation, retry)
//! - Deterministic mock providers for testing

mod json_contract;
pub mod providers;

pub use json_contract::*;

use async_trait::async_trait;
use lexflow_core::{GatewayError, LexflowResult};

// ============================================================================
// CHAT PROVIDER TRAIT
// ============================================================================

/// A single chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// System prompt, if any
    pub system: Option<String>,
    /// User message content
    pub user: String,
    pub max_tokens: i32,
    pub temperature: f32,
    /// Sampling seed recorded for reproducibility, where supported
    pub seed: Option<u64>,
}

impl ChatRequest {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            system: None,
            user: user.into(),
            max_tokens: 2048,
            temperature: 0.3,
            seed: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// A chat completion response.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    pub model_id: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl ChatResponse {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

/// Async trait for chat completion providers.
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Run one chat completion.
    async fn chat(&self, request: ChatRequest) -> LexflowResult<ChatResponse>;

    /// Get the model identifier for this provider.
    fn model_id(&self) -> &str;
}

// ============================================================================
// EMBEDDING PROVIDER TRAIT
// ============================================================================

/// Async trait for embedding providers.
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate a unit-normalized embedding for a single text.
    async fn embed(&self, text: &str) -> LexflowResult<Vec<f32>>;

    /// Generate embeddings for multiple texts in a batch.
    async fn embed_batch(&self, texts: &[&str]) -> LexflowResult<Vec<Vec<f32>>>;

    /// Get the number of dimensions this provider produces.
    fn dimensions(&self) -> i32;

    /// Get the model identifier for this provider.
    fn model_id(&self) -> &str;
}

// ============================================================================
// MOCK PROVIDERS
// ============================================================================

/// Mock chat provider returning scripted responses, in order.
///
/// When the script runs out, the last entry repeats. Entries of `Err` raise
/// a vendor error, which exercises the retry path of the JSON contract.
pub struct MockChatProvider {
    model_id: String,
    script: std::sync::Mutex<Vec<Result<String, String>>>,
    calls: std::sync::atomic::AtomicU32,
}

impl MockChatProvider {
    /// Provider that always returns the same text.
    pub fn fixed(text: impl Into<String>) -> Self {
        Self {
            model_id: "mock-chat".to_string(),
            script: std::sync::Mutex::new(vec![Ok(text.into())]),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Provider that plays through a script of responses.
    pub fn scripted(responses: Vec<Result<String, String>>) -> Self {
        assert!(!responses.is_empty(), "script must not be empty");
        Self {
            model_id: "mock-chat".to_string(),
            script: std::sync::Mutex::new(responses),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Number of chat calls made so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn chat(&self, request: ChatRequest) -> LexflowResult<ChatResponse> {
        let index = self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed) as usize;
        let script = self.script.lock().expect("mock script lock");
        let entry = script.get(index).unwrap_or_else(|| {
            script.last().expect("script is non-empty")
        });

        match entry {
            Ok(text) => Ok(ChatResponse {
                text: text.clone(),
                model_id: self.model_id.clone(),
                input_tokens: (request.user.len() / 4) as i64,
                output_tokens: (text.len() / 4) as i64,
            }),
            Err(message) => Err(GatewayError::Vendor {
                provider: "mock".to_string(),
                status: 500,
                message: message.clone(),
            }
            .into()),
        }
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Mock embedding provider producing deterministic unit vectors.
#[derive(Debug, Clone)]
pub struct MockEmbeddingProvider {
    model_id: String,
    dimensions: i32,
}

impl MockEmbeddingProvider {
    pub fn new(model_id: impl Into<String>, dimensions: i32) -> Self {
        Self {
            model_id: model_id.into(),
            dimensions,
        }
    }

    fn generate_embedding(&self, text: &str) -> Vec<f32> {
        let mut data = vec![0.0f32; self.dimensions as usize];

        for (i, byte) in text.bytes().enumerate() {
            let idx = i % self.dimensions as usize;
            data[idx] += (byte as f32) / 255.0;
        }

        let norm: f32 = data.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut data {
                *x /= norm;
            }
        }

        data
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new("mock-embed", 1024)
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> LexflowResult<Vec<f32>> {
        Ok(self.generate_embedding(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> LexflowResult<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    fn dimensions(&self) -> i32 {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_chat_fixed() {
        let provider = MockChatProvider::fixed("ciao");
        let response = provider.chat(ChatRequest::new("hello")).await.unwrap();
        assert_eq!(response.text, "ciao");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_chat_scripted_exhaustion() {
        let provider = MockChatProvider::scripted(vec![
            Ok("first".to_string()),
            Ok("second".to_string()),
        ]);
        assert_eq!(provider.chat(ChatRequest::new("q")).await.unwrap().text, "first");
        assert_eq!(provider.chat(ChatRequest::new("q")).await.unwrap().text, "second");
        // Script exhausted: last entry repeats
        assert_eq!(provider.chat(ChatRequest::new("q")).await.unwrap().text, "second");
    }

    #[tokio::test]
    async fn test_mock_chat_error_entry() {
        let provider = MockChatProvider::scripted(vec![Err("boom".to_string())]);
        let err = provider.chat(ChatRequest::new("q")).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_mock_embedding_dimensions() {
        let provider = MockEmbeddingProvider::default();
        let embedding = provider.embed("contratto").await.unwrap();
        assert_eq!(embedding.len(), 1024);
    }

    #[tokio::test]
    async fn test_mock_embedding_deterministic() {
        let provider = MockEmbeddingProvider::default();
        let e1 = provider.embed("contratto").await.unwrap();
        let e2 = provider.embed("contratto").await.unwrap();
        assert_eq!(e1, e2);
    }

    #[tokio::test]
    async fn test_mock_embedding_unit_norm() {
        let provider = MockEmbeddingProvider::default();
        let embedding = provider.embed("locazione abitativa").await.unwrap();
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
