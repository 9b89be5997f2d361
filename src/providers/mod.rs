//! Provider adapters and their registry.
//!
//! An adapter translates between the canonical request/response types and
//! one provider's wire format:
//!
//! ```text
//! Request ──► build_request ──► assigns {url, body, headers, model}
//!                                       │
//!                         HTTP executor │ (telemetry, breaker, retry)
//!                                       ▼
//! ChatResponse ◄── parse_response ◄── raw JSON body
//! StreamChunks ◄── stream_decoder ◄── raw byte stream
//! ```
//!
//! The OpenAI-compatible family (openai, groq, mistral, openrouter,
//! perplexity, xai) shares one adapter parameterized by a profile; the
//! remaining providers have dedicated adapters.

pub mod anthropic;
pub mod bedrock;
pub mod gemini;
pub mod local;
pub mod mock;
pub mod ollama;
pub mod openai_compat;
pub mod sigv4;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::config::{ProviderDefaults, ResolvedConfig};
use crate::error::{LlmError, Result};
use crate::pipeline::Request;
use crate::streaming::StreamDecoder;
use crate::types::{
    ChatResponse, EmbeddingResponse, FunctionCall, ModelInfo, ToolCall, Usage,
};

/// Translates canonical requests to one provider's wire format and back.
pub trait ProviderAdapter: Send + Sync {
    /// Provider tag this adapter serves.
    fn tag(&self) -> &'static str;

    /// Built-in configuration defaults (env prefix, base URL, model).
    fn defaults(&self) -> ProviderDefaults;

    /// Assemble `assigns.{request_url, request_body, request_headers, model}`
    /// from the request's messages and options.
    fn build_request(&self, req: &mut Request) -> Result<()>;

    /// Convert a raw non-streaming body into the canonical response.
    fn parse_response(&self, body: &Value, model: &str) -> Result<ChatResponse>;

    /// The decoder for this provider's streaming wire format.
    fn stream_decoder(&self, req: &Request) -> Box<dyn StreamDecoder>;

    /// Assemble an embeddings request. Providers without an embeddings
    /// endpoint keep the default.
    fn build_embeddings_request(&self, req: &mut Request) -> Result<()> {
        let _ = req;
        Err(LlmError::Validation(format!(
            "provider '{}' does not support embeddings",
            self.tag()
        )))
    }

    /// Parse an embeddings response body.
    fn parse_embeddings_response(&self, body: &Value, model: &str) -> Result<EmbeddingResponse> {
        let _ = (body, model);
        Err(LlmError::Validation(format!(
            "provider '{}' does not support embeddings",
            self.tag()
        )))
    }

    /// URL for dynamic model listing, when the provider has one.
    fn models_url(&self, config: &ResolvedConfig) -> Option<String> {
        let _ = config;
        None
    }

    /// Parse the model-listing body.
    fn parse_models(&self, body: &Value) -> Vec<ModelInfo> {
        let _ = body;
        Vec::new()
    }

    /// Whether requests must be signed after building (AWS SigV4).
    fn requires_signing(&self) -> bool {
        false
    }

    /// Add signature headers to a built request.
    fn sign_request(&self, req: &mut Request) -> Result<()> {
        let _ = req;
        Ok(())
    }
}

/// Process-wide adapter lookup, keyed by provider tag.
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.list())
            .finish()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
            Arc::new(openai_compat::OpenAiCompatAdapter::openai()),
            Arc::new(openai_compat::OpenAiCompatAdapter::groq()),
            Arc::new(openai_compat::OpenAiCompatAdapter::mistral()),
            Arc::new(openai_compat::OpenAiCompatAdapter::openrouter()),
            Arc::new(openai_compat::OpenAiCompatAdapter::perplexity()),
            Arc::new(openai_compat::OpenAiCompatAdapter::xai()),
            Arc::new(anthropic::AnthropicAdapter),
            Arc::new(gemini::GeminiAdapter),
            Arc::new(bedrock::BedrockAdapter),
            Arc::new(ollama::OllamaAdapter),
            Arc::new(local::LocalAdapter),
        ];
        Self {
            adapters: adapters.into_iter().map(|a| (a.tag(), a)).collect(),
        }
    }
}

impl AdapterRegistry {
    /// Registry with no adapters (tests install their own).
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Install (or replace) an adapter.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.tag(), adapter);
    }

    /// Adapter for a provider tag.
    pub fn get(&self, tag: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(tag).cloned()
    }

    /// Registered tags, sorted.
    pub fn list(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.adapters.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

/// Map an embedded `{"error": ...}` object to a provider error.
pub(crate) fn check_provider_error(body: &Value, provider: &str) -> Result<()> {
    if let Some(error) = body.get("error") {
        if !error.is_null() {
            return Err(LlmError::Provider {
                provider: provider.to_string(),
                payload: error.clone(),
            });
        }
    }
    Ok(())
}

/// Usage accounting from an OpenAI-style `usage` object, including the
/// `*_tokens_details` counters for cached/reasoning/audio tokens.
pub(crate) fn usage_from_openai(usage: Option<&Value>) -> Usage {
    let Some(usage) = usage else {
        return Usage::default();
    };
    let get = |key: &str| usage.get(key).and_then(Value::as_u64).map(|v| v as u32);
    let input_tokens = get("prompt_tokens").or_else(|| get("input_tokens")).unwrap_or(0);
    let output_tokens = get("completion_tokens")
        .or_else(|| get("output_tokens"))
        .unwrap_or(0);
    Usage {
        input_tokens,
        output_tokens,
        total_tokens: get("total_tokens").unwrap_or(input_tokens + output_tokens),
        cached_tokens: usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        reasoning_tokens: usage
            .get("completion_tokens_details")
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        audio_tokens: usage
            .get("completion_tokens_details")
            .and_then(|d| d.get("audio_tokens"))
            .and_then(Value::as_u64)
            .map(|v| v as u32),
    }
}

/// Normalize tool calls from an OpenAI-style message.
///
/// Modern `tool_calls` arrays pass through; the legacy top-level
/// `function_call` shape is rewritten into a one-element `tool_calls` list
/// with a generated id.
pub(crate) fn normalize_tool_calls(message: &Value) -> Option<Vec<ToolCall>> {
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        let calls: Vec<ToolCall> = calls
            .iter()
            .filter_map(|call| {
                let function = call.get("function")?;
                Some(ToolCall {
                    id: call
                        .get("id")
                        .and_then(Value::as_str)
                        .map_or_else(generated_call_id, str::to_string),
                    call_type: call
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("function")
                        .to_string(),
                    function: FunctionCall {
                        name: function
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        arguments: function
                            .get("arguments")
                            .and_then(Value::as_str)
                            .unwrap_or("{}")
                            .to_string(),
                    },
                })
            })
            .collect();
        return (!calls.is_empty()).then_some(calls);
    }

    let legacy = message.get("function_call")?;
    Some(vec![ToolCall {
        id: generated_call_id(),
        call_type: "function".to_string(),
        function: FunctionCall {
            name: legacy
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            arguments: legacy
                .get("arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}")
                .to_string(),
        },
    }])
}

fn generated_call_id() -> String {
    format!("call_{}", &Uuid::new_v4().simple().to_string()[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_default_covers_all_providers() {
        let registry = AdapterRegistry::default();
        assert_eq!(
            registry.list(),
            vec![
                "anthropic",
                "bedrock",
                "gemini",
                "groq",
                "local",
                "mistral",
                "ollama",
                "openai",
                "openrouter",
                "perplexity",
                "xai",
            ]
        );
        assert!(registry.get("openai").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_check_provider_error() {
        assert!(check_provider_error(&json!({"choices": []}), "openai").is_ok());
        let err = check_provider_error(
            &json!({"error": {"message": "model not found", "code": 404}}),
            "openai",
        )
        .unwrap_err();
        match err {
            LlmError::Provider { provider, payload } => {
                assert_eq!(provider, "openai");
                assert_eq!(payload["code"], 404);
            }
            other => panic!("expected Provider error, got {other:?}"),
        }
    }

    #[test]
    fn test_usage_mapping_with_details() {
        let usage = usage_from_openai(Some(&json!({
            "prompt_tokens": 100,
            "completion_tokens": 40,
            "total_tokens": 140,
            "prompt_tokens_details": {"cached_tokens": 60},
            "completion_tokens_details": {"reasoning_tokens": 25, "audio_tokens": 3},
        })));
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 40);
        assert_eq!(usage.total_tokens, 140);
        assert_eq!(usage.cached_tokens, Some(60));
        assert_eq!(usage.reasoning_tokens, Some(25));
        assert_eq!(usage.audio_tokens, Some(3));
    }

    #[test]
    fn test_usage_total_derived_when_absent() {
        let usage = usage_from_openai(Some(&json!({
            "prompt_tokens": 10,
            "completion_tokens": 5,
        })));
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn test_usage_missing_is_zero() {
        assert_eq!(usage_from_openai(None), Usage::default());
    }

    #[test]
    fn test_tool_calls_passthrough() {
        let calls = normalize_tool_calls(&json!({
            "tool_calls": [{
                "id": "call_abc",
                "type": "function",
                "function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"},
            }],
        }))
        .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].function.name, "get_weather");
    }

    #[test]
    fn test_legacy_function_call_rewritten() {
        let calls = normalize_tool_calls(&json!({
            "function_call": {"name": "lookup", "arguments": "{}"},
        }))
        .unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].call_type, "function");
        assert_eq!(calls[0].function.name, "lookup");
    }

    #[test]
    fn test_no_tool_calls() {
        assert!(normalize_tool_calls(&json!({"content": "plain"})).is_none());
        assert!(normalize_tool_calls(&json!({"tool_calls": []})).is_none());
    }
}
