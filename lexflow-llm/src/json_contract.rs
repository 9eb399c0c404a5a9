//! JSON-output contract for structured LLM calls
//!
//! Every LLM call that must return structured data goes through the layered
//! defense implemented here:
//! 1. Schema-in-prompt: the expected JSON shape is embedded in the system
//!    prompt and surrounding prose is forbidden.
//! 2. Content cleanup: whitespace and code fences are stripped on receipt.
//! 3. Strict parse: `serde_json` into the typed schema.
//! 4. Semantic validation: range and enum checks; a validation failure counts
//!    as a parse failure for retry purposes.
//! 5. Retry with exponential backoff (0.5s, 1s, 2s), then a typed error the
//!    caller maps to its documented fallback object.

use crate::{ChatProvider, ChatRequest};
use lexflow_core::{GatewayError, LexflowError, LexflowResult};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

/// A type that can be requested from an LLM as structured JSON.
pub trait StructuredOutput: DeserializeOwned {
    /// JSON shape description embedded in the system prompt.
    fn schema_hint() -> &'static str;

    /// Semantic validation beyond what serde enforces (ranges, non-empty
    /// lists). Errors here trigger a retry, same as a parse failure.
    fn validate(&self) -> Result<(), String>;
}

/// Result of a structured call, with the telemetry the caller records.
#[derive(Debug, Clone)]
pub struct JsonOutcome<T> {
    pub value: T,
    /// Attempts consumed (1 = first response parsed cleanly)
    pub attempts: u32,
    /// One annotation per failed attempt
    pub annotations: Vec<String>,
    pub model_id: String,
    pub tokens_used: i64,
    pub latency_ms: i64,
}

/// Strip a leading/trailing markdown code fence and surrounding whitespace.
///
/// Models occasionally wrap JSON in ```json fences or prepend prose despite
/// instructions; everything before the first fence is discarded when a fence
/// is present.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();

    let Some(fence_start) = trimmed.find("```") else {
        return trimmed;
    };

    // Skip the fence line itself (``` or ```json)
    let after_fence = &trimmed[fence_start + 3..];
    let body = match after_fence.find('\n') {
        Some(newline) => &after_fence[newline + 1..],
        None => after_fence,
    };

    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Append the JSON-only instruction and schema to a base system prompt.
fn schema_system_prompt<T: StructuredOutput>(base: &str) -> String {
    format!(
        "{}\n\nRespond with a single JSON object matching this schema, \
         with no surrounding prose and no code fences:\n{}",
        base,
        T::schema_hint()
    )
}

/// Backoff before retry `n` (1-based): 0.5s, 1s, 2s, ...
fn backoff_delay(retry: u32) -> Duration {
    Duration::from_millis(500u64.saturating_mul(1 << (retry - 1).min(4)))
}

/// Run a structured LLM call under the JSON-output contract.
///
/// `max_attempts` counts total attempts, not retries. On persistent failure
/// the returned error is `GatewayError::ParseFailure`; the caller is expected
/// to substitute its documented fallback object without aborting the
/// workflow.
pub async fn call_structured<T: StructuredOutput>(
    provider: &dyn ChatProvider,
    system: &str,
    request: ChatRequest,
    max_attempts: u32,
) -> LexflowResult<JsonOutcome<T>> {
    let max_attempts = max_attempts.max(1);
    let request = request.with_system(schema_system_prompt::<T>(system));
    let started = Instant::now();

    let mut annotations: Vec<String> = Vec::new();
    let mut tokens_used: i64 = 0;
    let mut model_id = provider.model_id().to_string();

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
        }

        let response = match provider.chat(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(attempt, error = %e, "LLM call failed");
                annotations.push(format!("attempt {}: {}", attempt, e));
                continue;
            }
        };

        tokens_used += response.total_tokens();
        model_id = response.model_id.clone();

        let cleaned = strip_code_fences(&response.text);
        let parsed: T = match serde_json::from_str(cleaned) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(attempt, error = %e, "structured output failed to parse");
                annotations.push(format!("attempt {}: parse failure: {}", attempt, e));
                continue;
            }
        };

        if let Err(reason) = parsed.validate() {
            tracing::debug!(attempt, %reason, "structured output failed validation");
            annotations.push(format!("attempt {}: schema violation: {}", attempt, reason));
            continue;
        }

        return Ok(JsonOutcome {
            value: parsed,
            attempts: attempt,
            annotations,
            model_id,
            tokens_used,
            latency_ms: started.elapsed().as_millis() as i64,
        });
    }

    let reason = annotations
        .last()
        .cloned()
        .unwrap_or_else(|| "no attempts recorded".to_string());
    Err(LexflowError::Gateway(GatewayError::ParseFailure {
        attempts: max_attempts,
        reason,
    }))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockChatProvider;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        label: String,
        confidence: f32,
    }

    impl StructuredOutput for Verdict {
        fn schema_hint() -> &'static str {
            r#"{"label": "string", "confidence": 0.0}"#
        }

        fn validate(&self) -> Result<(), String> {
            if self.label.is_empty() {
                return Err("label must not be empty".to_string());
            }
            if !(0.0..=1.0).contains(&self.confidence) {
                return Err(format!("confidence {} out of range", self.confidence));
            }
            Ok(())
        }
    }

    #[test]
    fn test_strip_plain_json() {
        let raw = r#"  {"label": "valido", "confidence": 0.9}  "#;
        assert_eq!(
            strip_code_fences(raw),
            r#"{"label": "valido", "confidence": 0.9}"#
        );
    }

    #[test]
    fn test_strip_fenced_json() {
        let raw = "```json\n{\"label\": \"valido\", \"confidence\": 0.9}\n```";
        assert_eq!(
            strip_code_fences(raw),
            "{\"label\": \"valido\", \"confidence\": 0.9}"
        );
    }

    #[test]
    fn test_strip_fence_with_leading_prose() {
        let raw = "Here is the JSON you asked for:\n```json\n{\"label\": \"x\", \"confidence\": 0.5}\n```";
        assert_eq!(
            strip_code_fences(raw),
            "{\"label\": \"x\", \"confidence\": 0.5}"
        );
    }

    #[test]
    fn test_strip_unterminated_fence() {
        let raw = "```json\n{\"label\": \"x\", \"confidence\": 0.5}";
        assert_eq!(
            strip_code_fences(raw),
            "{\"label\": \"x\", \"confidence\": 0.5}"
        );
    }

    #[tokio::test]
    async fn test_clean_response_single_attempt() {
        let provider = MockChatProvider::fixed(r#"{"label": "valido", "confidence": 0.9}"#);
        let outcome: JsonOutcome<Verdict> =
            call_structured(&provider, "You are a test.", ChatRequest::new("q"), 3)
                .await
                .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.annotations.is_empty());
        assert_eq!(outcome.value.label, "valido");
    }

    #[tokio::test]
    async fn test_noisy_then_clean_retries_once() {
        let provider = MockChatProvider::scripted(vec![
            Ok("Certainly! The verdict is as follows: not json".to_string()),
            Ok(r#"{"label": "valido", "confidence": 0.8}"#.to_string()),
        ]);
        let outcome: JsonOutcome<Verdict> =
            call_structured(&provider, "You are a test.", ChatRequest::new("q"), 3)
                .await
                .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.annotations.len(), 1);
        assert!(outcome.annotations[0].contains("parse failure"));
    }

    #[tokio::test]
    async fn test_validation_failure_counts_as_parse_failure() {
        let provider = MockChatProvider::scripted(vec![
            Ok(r#"{"label": "valido", "confidence": 7.5}"#.to_string()),
            Ok(r#"{"label": "valido", "confidence": 0.75}"#.to_string()),
        ]);
        let outcome: JsonOutcome<Verdict> =
            call_structured(&provider, "You are a test.", ChatRequest::new("q"), 3)
                .await
                .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.annotations[0].contains("schema violation"));
    }

    #[tokio::test]
    async fn test_persistent_failure_is_typed_error() {
        let provider = MockChatProvider::fixed("not json at all");
        let result: LexflowResult<JsonOutcome<Verdict>> =
            call_structured(&provider, "You are a test.", ChatRequest::new("q"), 2).await;
        match result {
            Err(LexflowError::Gateway(GatewayError::ParseFailure { attempts, .. })) => {
                assert_eq!(attempts, 2);
            }
            other => panic!("expected ParseFailure, got {:?}", other.map(|o| o.attempts)),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(3), Duration::from_millis(2000));
    }
}
