//! LLM provider adapters
//!
//! Each adapter wraps one vendor API behind the gateway traits. The engine
//! only ever sees `ChatProvider` / `EmbeddingProvider` trait objects.

mod anthropic;
mod openai;

pub use anthropic::AnthropicChatProvider;
pub use openai::{OpenAiChatProvider, OpenAiEmbeddingProvider};
