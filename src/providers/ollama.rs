//! Ollama native API adapter.
//!
//! `POST {base}/api/chat` with NDJSON streaming (`{"message":{"content":
//! "token"},"done":false}` per line). No authentication; sampling knobs go
//! into the `options` object, with `max_tokens` mapped to `num_predict`.

use serde_json::{json, Value};

use super::ProviderAdapter;
use crate::config::{ProviderDefaults, ResolvedConfig};
use crate::error::{LlmError, Result};
use crate::pipeline::Request;
use crate::streaming::ndjson::NdjsonDecoder;
use crate::streaming::StreamDecoder;
use crate::types::{ChatResponse, EmbeddingResponse, ModelInfo, ResponseMetadata, Usage};

/// Adapter for Ollama's native chat API.
pub struct OllamaAdapter;

impl OllamaAdapter {
    fn build_options(req: &Request) -> Value {
        let options = &req.options;
        let mut opts = serde_json::Map::new();
        if let Some(temperature) = options.temperature {
            opts.insert("temperature".into(), json!(temperature));
        }
        if let Some(max_tokens) = options.max_tokens {
            opts.insert("num_predict".into(), json!(max_tokens));
        }
        if let Some(top_p) = options.top_p {
            opts.insert("top_p".into(), json!(top_p));
        }
        if let Some(seed) = options.seed {
            opts.insert("seed".into(), json!(seed));
        }
        if let Some(ref stop) = options.stop {
            opts.insert("stop".into(), json!(stop));
        }
        Value::Object(opts)
    }

    fn build_body(req: &Request) -> Value {
        let options = &req.options;

        let mut messages = Vec::new();
        if let Some(ref system) = options.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &req.messages {
            messages.push(json!({
                "role": message.role.as_str(),
                "content": message.content.as_text(),
            }));
        }

        let mut body = json!({
            "model": req.config.model,
            "messages": messages,
            "stream": options.stream,
            "options": Self::build_options(req),
        });
        if options
            .response_format
            .as_ref()
            .and_then(|f| f.get("type"))
            .and_then(Value::as_str)
            == Some("json_object")
        {
            body["format"] = json!("json");
        }
        if let Some(ref tools) = options.tools {
            body["tools"] = tools.clone();
        }
        body
    }
}

impl ProviderAdapter for OllamaAdapter {
    fn tag(&self) -> &'static str {
        "ollama"
    }

    fn defaults(&self) -> ProviderDefaults {
        ProviderDefaults {
            env_prefix: "OLLAMA",
            api_key_aliases: &[],
            default_base_url: "http://localhost:11434",
            default_model: "llama3.2",
            requires_api_key: false,
        }
    }

    fn build_request(&self, req: &mut Request) -> Result<()> {
        req.assigns.request_url = Some(format!("{}/api/chat", req.config.base_url));
        req.assigns.request_body = Some(Self::build_body(req));
        req.assigns.request_headers = Vec::new();
        req.assigns.model = Some(req.config.model.clone());
        Ok(())
    }

    fn parse_response(&self, body: &Value, model: &str) -> Result<ChatResponse> {
        super::check_provider_error(body, "ollama")?;

        let content = body
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| LlmError::Protocol("response has no message content".into()))?
            .to_string();

        let count = |key: &str| {
            body.get(key).and_then(Value::as_u64).map(|v| v as u32)
        };
        let input_tokens = count("prompt_eval_count").unwrap_or(0);
        let output_tokens = count("eval_count").unwrap_or(0);

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
                ..Usage::default()
            },
            cost: None,
            finish_reason: body
                .get("done_reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    (body.get("done").and_then(Value::as_bool) == Some(true))
                        .then(|| "stop".to_string())
                }),
            tool_calls: body
                .get("message")
                .and_then(super::normalize_tool_calls),
            refusal: None,
            logprobs: None,
            metadata: ResponseMetadata {
                provider: "ollama".to_string(),
                role: body
                    .get("message")
                    .and_then(|m| m.get("role"))
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
        Box::new(NdjsonDecoder::new())
    }

    fn build_embeddings_request(&self, req: &mut Request) -> Result<()> {
        req.assigns.request_url = Some(format!("{}/api/embed", req.config.base_url));
        req.assigns.request_body = Some(json!({
            "model": req.config.model,
            "input": req.inputs,
        }));
        req.assigns.request_headers = Vec::new();
        req.assigns.model = Some(req.config.model.clone());
        Ok(())
    }

    fn parse_embeddings_response(&self, body: &Value, model: &str) -> Result<EmbeddingResponse> {
        super::check_provider_error(body, "ollama")?;
        let embeddings = body
            .get("embeddings")
            .and_then(Value::as_array)
            .ok_or_else(|| LlmError::Protocol("embeddings response has no embeddings".into()))?
            .iter()
            .filter_map(Value::as_array)
            .map(|vector| {
                vector
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|v| v as f32)
                    .collect()
            })
            .collect();
        Ok(EmbeddingResponse {
            embeddings,
            model: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(model)
                .to_string(),
            usage: None,
        })
    }

    fn models_url(&self, config: &ResolvedConfig) -> Option<String> {
        Some(format!("{}/api/tags", config.base_url))
    }

    fn parse_models(&self, body: &Value) -> Vec<ModelInfo> {
        body.get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .map(|name| ModelInfo {
                        id: name.to_string(),
                        provider: "ollama".to_string(),
                        context_window: None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
