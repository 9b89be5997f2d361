//! Google Gemini generate-content adapter.
//!
//! `POST {base}/v1beta/models/{model}:generateContent` with the
//! `x-goog-api-key` header. Messages map to `contents` with `user`/`model`
//! roles; system content goes to `systemInstruction`; sampling knobs live
//! under `generationConfig`. Streaming uses `:streamGenerateContent?alt=sse`
//! and SSE payloads with `candidates[0].content.parts[].text`.

use serde_json::{json, Value};

use super::ProviderAdapter;
use crate::config::{ProviderDefaults, ResolvedConfig};
use crate::error::{LlmError, Result};
use crate::pipeline::Request;
use crate::streaming::sse::SseDecoder;
use crate::streaming::StreamDecoder;
use crate::types::{
    ChatResponse, ContentPart, EmbeddingResponse, MessageContent, ModelInfo, ResponseMetadata,
    Role, StreamChunk, Usage,
};

/// Adapter for the Gemini generate-content API.
pub struct GeminiAdapter;

impl GeminiAdapter {
    fn parts_to_json(content: &MessageContent) -> Value {
        match content {
            MessageContent::Text(text) => json!([{"text": text}]),
            MessageContent::Parts(parts) => json!(parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(json!({"text": text})),
                    ContentPart::ImageUrl { url } => Some(json!({
                        "file_data": {"file_uri": url},
                    })),
                    ContentPart::AudioInput { data, format } => Some(json!({
                        "inline_data": {"mime_type": format!("audio/{format}"), "data": data},
                    })),
                })
                .collect::<Vec<_>>()),
        }
    }

    fn build_body(req: &Request) -> Value {
        let options = &req.options;

        let mut system_parts: Vec<String> = Vec::new();
        if let Some(ref system) = options.system {
            system_parts.push(system.clone());
        }
        let mut contents = Vec::new();
        for message in &req.messages {
            match message.role {
                Role::System => system_parts.push(message.content.as_text()),
                Role::User | Role::Tool => contents.push(json!({
                    "role": "user",
                    "parts": Self::parts_to_json(&message.content),
                })),
                Role::Assistant => contents.push(json!({
                    "role": "model",
                    "parts": Self::parts_to_json(&message.content),
                })),
            }
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(temperature) = options.temperature {
            generation_config.insert("temperature".into(), json!(temperature));
        }
        if let Some(max_tokens) = options.max_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if let Some(top_p) = options.top_p {
            generation_config.insert("topP".into(), json!(top_p));
        }
        if let Some(ref stop) = options.stop {
            generation_config.insert("stopSequences".into(), json!(stop));
        }
        if let Some(n) = options.n {
            generation_config.insert("candidateCount".into(), json!(n));
        }
        if options
            .response_format
            .as_ref()
            .and_then(|f| f.get("type"))
            .and_then(Value::as_str)
            == Some("json_object")
        {
            generation_config.insert("responseMimeType".into(), json!("application/json"));
        }

        let mut body = json!({"contents": contents});
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({
                "parts": [{"text": system_parts.join("\n\n")}],
            });
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }
        if let Some(ref tools) = options.tools {
            body["tools"] = tools.clone();
        }
        body
    }

    fn headers(config: &ResolvedConfig) -> Vec<(String, String)> {
        config
            .api_key
            .as_ref()
            .map(|key| vec![("x-goog-api-key".to_string(), key.clone())])
            .unwrap_or_default()
    }

    /// Streaming payload shape: `candidates[0].content.parts[].text`.
    fn stream_payload(value: &Value) -> Option<StreamChunk> {
        let candidate = value.get("candidates").and_then(|c| c.get(0))?;
        let text: String = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        let finish = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty());

        if text.is_empty() && finish.is_none() {
            return None;
        }
        Some(StreamChunk {
            content: (!text.is_empty()).then_some(text),
            finish_reason: finish.map(str::to_string),
            model: None,
            metadata: None,
        })
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn tag(&self) -> &'static str {
        "gemini"
    }

    fn defaults(&self) -> ProviderDefaults {
        ProviderDefaults {
            env_prefix: "GEMINI",
            api_key_aliases: &["GOOGLE_API_KEY"],
            default_base_url: "https://generativelanguage.googleapis.com",
            default_model: "gemini-2.0-flash",
            requires_api_key: true,
        }
    }

    fn build_request(&self, req: &mut Request) -> Result<()> {
        let action = if req.options.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        req.assigns.request_url = Some(format!(
            "{}/v1beta/models/{}:{}",
            req.config.base_url, req.config.model, action
        ));
        req.assigns.request_body = Some(Self::build_body(req));
        req.assigns.request_headers = Self::headers(&req.config);
        req.assigns.model = Some(req.config.model.clone());
        Ok(())
    }

    fn parse_response(&self, body: &Value, model: &str) -> Result<ChatResponse> {
        super::check_provider_error(body, "gemini")?;

        let candidate = body
            .get("candidates")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LlmError::Protocol("response has no candidates".into()))?;
        let content: String = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();

        let usage = body.get("usageMetadata");
        let count = |key: &str| {
            usage
                .and_then(|u| u.get(key))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32
        };
        let input_tokens = count("promptTokenCount");
        let output_tokens = count("candidatesTokenCount");

        Ok(ChatResponse {
            content,
            model: body
                .get("modelVersion")
                .and_then(Value::as_str)
                .unwrap_or(model)
                .to_string(),
            usage: Usage {
                input_tokens,
                output_tokens,
                total_tokens: usage
                    .and_then(|u| u.get("totalTokenCount"))
                    .and_then(Value::as_u64)
                    .map_or(input_tokens + output_tokens, |v| v as u32),
                cached_tokens: usage
                    .and_then(|u| u.get("cachedContentTokenCount"))
                    .and_then(Value::as_u64)
                    .map(|v| v as u32),
                reasoning_tokens: usage
                    .and_then(|u| u.get("thoughtsTokenCount"))
                    .and_then(Value::as_u64)
                    .map(|v| v as u32),
                audio_tokens: None,
            },
            cost: None,
            finish_reason: candidate
                .get("finishReason")
                .and_then(Value::as_str)
                .map(str::to_string),
            tool_calls: None,
            refusal: None,
            logprobs: None,
            metadata: ResponseMetadata {
                provider: "gemini".to_string(),
                role: "assistant".to_string(),
                from_cache: false,
                cost_details: None,
                raw_response: Some(body.clone()),
            },
        })
    }

    fn stream_decoder(&self, _req: &Request) -> Box<dyn StreamDecoder> {
        Box::new(SseDecoder::with_extractor(Self::stream_payload))
    }

    fn build_embeddings_request(&self, req: &mut Request) -> Result<()> {
        let model = &req.config.model;
        req.assigns.request_url = Some(format!(
            "{}/v1beta/models/{}:batchEmbedContents",
            req.config.base_url, model
        ));
        req.assigns.request_body = Some(json!({
            "requests": req
                .inputs
                .iter()
                .map(|input| json!({
                    "model": format!("models/{model}"),
                    "content": {"parts": [{"text": input}]},
                }))
                .collect::<Vec<_>>(),
        }));
        req.assigns.request_headers = Self::headers(&req.config);
        req.assigns.model = Some(model.clone());
        Ok(())
    }

    fn parse_embeddings_response(&self, body: &Value, model: &str) -> Result<EmbeddingResponse> {
        super::check_provider_error(body, "gemini")?;
        let embeddings = body
            .get("embeddings")
            .and_then(Value::as_array)
            .ok_or_else(|| LlmError::Protocol("embeddings response has no embeddings".into()))?
            .iter()
            .filter_map(|e| e.get("values").and_then(Value::as_array))
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|v| v as f32)
                    .collect()
            })
            .collect();
        Ok(EmbeddingResponse {
            embeddings,
            model: model.to_string(),
            usage: None,
        })
    }

    fn models_url(&self, config: &ResolvedConfig) -> Option<String> {
        Some(format!("{}/v1beta/models", config.base_url))
    }

    fn parse_models(&self, body: &Value) -> Vec<ModelInfo> {
        body.get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| {
                        let name = m.get("name").and_then(Value::as_str)?;
                        Some(ModelInfo {
                            id: name.trim_start_matches("models/").to_string(),
                            provider: "gemini".to_string(),
                            context_window: m
                                .get("inputTokenLimit")
                                .and_then(Value::as_u64)
                                .map(|v| v as u32),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
