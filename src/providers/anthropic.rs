//! Anthropic messages API adapter.
//!
//! Chat-only provider: `POST {base}/v1/messages` with `x-api-key` and
//! `anthropic-version` headers. System messages are lifted out of the
//! message list into the top-level `system` field; responses carry content
//! as a list of typed blocks. Streaming is SSE with Anthropic's own event
//! payloads (`content_block_delta`, `message_delta`, `message_stop`).

use serde_json::{json, Value};

use super::ProviderAdapter;
use crate::config::ProviderDefaults;
use crate::error::{LlmError, Result};
use crate::pipeline::Request;
use crate::streaming::sse::SseDecoder;
use crate::streaming::StreamDecoder;
use crate::types::{
    ChatResponse, ContentPart, FunctionCall, MessageContent, ResponseMetadata, Role, ToolCall,
    Usage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The messages API requires max_tokens; applied when the caller sets none.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Adapter for the Anthropic messages API.
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    fn content_to_json(content: &MessageContent) -> Value {
        match content {
            MessageContent::Text(text) => json!(text),
            MessageContent::Parts(parts) => json!(parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                    ContentPart::ImageUrl { url } => Some(json!({
                        "type": "image",
                        "source": {"type": "url", "url": url},
                    })),
                    // The messages API has no audio input block.
                    ContentPart::AudioInput { .. } => None,
                })
                .collect::<Vec<_>>()),
        }
    }

    fn build_body(req: &Request) -> Value {
        let options = &req.options;

        // System content comes from the option and from any system-role
        // messages, which the messages API does not accept in the list.
        let mut system_parts: Vec<String> = Vec::new();
        if let Some(ref system) = options.system {
            system_parts.push(system.clone());
        }
        let mut messages = Vec::new();
        for message in &req.messages {
            match message.role {
                Role::System => system_parts.push(message.content.as_text()),
                Role::User | Role::Tool => messages.push(json!({
                    "role": "user",
                    "content": Self::content_to_json(&message.content),
                })),
                Role::Assistant => messages.push(json!({
                    "role": "assistant",
                    "content": Self::content_to_json(&message.content),
                })),
            }
        }

        let mut body = json!({
            "model": req.config.model,
            "messages": messages,
            "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(ref stop) = options.stop {
            body["stop_sequences"] = json!(stop);
        }
        if let Some(ref tools) = options.tools {
            body["tools"] = tools.clone();
        }
        if let Some(ref tool_choice) = options.tool_choice {
            body["tool_choice"] = tool_choice.clone();
        }
        if options.stream {
            body["stream"] = json!(true);
        }
        body
    }

    /// Streaming payload shape shared with the Bedrock Anthropic family.
    fn stream_payload(value: &Value) -> Option<crate::types::StreamChunk> {
        crate::streaming::eventstream::BedrockFamily::Anthropic.chunk_from_payload(value)
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn tag(&self) -> &'static str {
        "anthropic"
    }

    fn defaults(&self) -> ProviderDefaults {
        ProviderDefaults {
            env_prefix: "ANTHROPIC",
            api_key_aliases: &[],
            default_base_url: "https://api.anthropic.com",
            default_model: "claude-3-5-haiku-latest",
            requires_api_key: true,
        }
    }

    fn build_request(&self, req: &mut Request) -> Result<()> {
        req.assigns.request_url = Some(format!("{}/v1/messages", req.config.base_url));
        req.assigns.request_body = Some(Self::build_body(req));
        let mut headers = vec![(
            "anthropic-version".to_string(),
            ANTHROPIC_VERSION.to_string(),
        )];
        if let Some(ref key) = req.config.api_key {
            headers.push(("x-api-key".to_string(), key.clone()));
        }
        req.assigns.request_headers = headers;
        req.assigns.model = Some(req.config.model.clone());
        Ok(())
    }

    fn parse_response(&self, body: &Value, model: &str) -> Result<ChatResponse> {
        if body.get("type").and_then(Value::as_str) == Some("error") {
            return Err(LlmError::Provider {
                provider: "anthropic".to_string(),
                payload: body.get("error").cloned().unwrap_or_else(|| body.clone()),
            });
        }

        let blocks = body
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| LlmError::Protocol("response has no content blocks".into()))?;

        let content: String = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();

        let tool_calls: Vec<ToolCall> = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
            .map(|b| ToolCall {
                id: b
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: b
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: b
                        .get("input")
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| "{}".to_string()),
                },
            })
            .collect();

        let usage = body.get("usage");
        let input_tokens = usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let output_tokens = usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        Ok(ChatResponse {
            content,
            model: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(model)
                .to_string(),
            usage: Usage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
                cached_tokens: usage
                    .and_then(|u| u.get("cache_read_input_tokens"))
                    .and_then(Value::as_u64)
                    .map(|v| v as u32),
                reasoning_tokens: None,
                audio_tokens: None,
            },
            cost: None,
            finish_reason: body
                .get("stop_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            refusal: None,
            logprobs: None,
            metadata: ResponseMetadata {
                provider: "anthropic".to_string(),
                role: body
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("assistant")
                    .to_string(),
                from_cache: false,
                cost_details: None,
                raw_response: Some(body.clone()),
            },
        })
    }

    fn stream_decoder(&self, _req: &Request) -> Box<dyn StreamDecoder> {
        Box::new(SseDecoder::with_extractor(Self::stream_payload))
    }
}
