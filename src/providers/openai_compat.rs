//! The OpenAI-compatible provider family.
//!
//! One adapter serves every provider that speaks the `/v1/chat/completions`
//! dialect (OpenAI itself, Groq, Mistral, OpenRouter, Perplexity, and xAI),
//! parameterized by a [`CompatProfile`] (tag, env vars, base URL, default
//! model, extra headers). Streaming uses SSE with `data: [DONE]`
//! termination.

use serde_json::{json, Value};

use super::{
    check_provider_error, normalize_tool_calls, usage_from_openai, ProviderAdapter,
};
use crate::config::{ProviderDefaults, ResolvedConfig};
use crate::error::{LlmError, Result};
use crate::pipeline::Request;
use crate::streaming::sse::SseDecoder;
use crate::streaming::StreamDecoder;
use crate::types::{
    ChatResponse, ContentPart, EmbeddingResponse, Message, MessageContent, ModelInfo,
    ResponseMetadata,
};

/// Hook adding provider-specific headers after the bearer token.
type ExtraHeaders = fn(&ResolvedConfig, &mut Vec<(String, String)>);

/// Static description of one OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct CompatProfile {
    /// Provider tag.
    pub tag: &'static str,
    /// Env prefix for configuration.
    pub env_prefix: &'static str,
    /// Extra API-key env vars honored after `<PREFIX>_API_KEY`.
    pub api_key_aliases: &'static [&'static str],
    /// Default API root.
    pub default_base_url: &'static str,
    /// Default model.
    pub default_model: &'static str,
    /// Temperature applied when the caller sets none.
    pub default_temperature: f64,
    /// Whether a missing API key is a configuration error.
    pub requires_api_key: bool,
    /// Extra header hook.
    pub extra_headers: Option<ExtraHeaders>,
}

/// Adapter for one [`CompatProfile`].
pub struct OpenAiCompatAdapter {
    profile: CompatProfile,
}

fn openrouter_headers(config: &ResolvedConfig, headers: &mut Vec<(String, String)>) {
    if let Some(ref referer) = config.app_referer {
        headers.push(("HTTP-Referer".to_string(), referer.clone()));
    }
    if let Some(ref title) = config.app_title {
        headers.push(("X-Title".to_string(), title.clone()));
    }
}

impl OpenAiCompatAdapter {
    /// Adapter from an explicit profile.
    pub fn new(profile: CompatProfile) -> Self {
        Self { profile }
    }

    pub fn openai() -> Self {
        Self::new(CompatProfile {
            tag: "openai",
            env_prefix: "OPENAI",
            api_key_aliases: &[],
            default_base_url: "https://api.openai.com",
            default_model: "gpt-4o-mini",
            default_temperature: 0.7,
            requires_api_key: true,
            extra_headers: None,
        })
    }

    pub fn groq() -> Self {
        Self::new(CompatProfile {
            tag: "groq",
            env_prefix: "GROQ",
            api_key_aliases: &[],
            default_base_url: "https://api.groq.com/openai",
            default_model: "llama-3.3-70b-versatile",
            default_temperature: 0.7,
            requires_api_key: true,
            extra_headers: None,
        })
    }

    pub fn mistral() -> Self {
        Self::new(CompatProfile {
            tag: "mistral",
            env_prefix: "MISTRAL",
            api_key_aliases: &[],
            default_base_url: "https://api.mistral.ai",
            default_model: "mistral-small-latest",
            default_temperature: 0.7,
            requires_api_key: true,
            extra_headers: None,
        })
    }

    pub fn openrouter() -> Self {
        Self::new(CompatProfile {
            tag: "openrouter",
            env_prefix: "OPENROUTER",
            api_key_aliases: &[],
            default_base_url: "https://openrouter.ai/api",
            default_model: "openrouter/auto",
            default_temperature: 0.7,
            requires_api_key: true,
            extra_headers: Some(openrouter_headers),
        })
    }

    pub fn perplexity() -> Self {
        Self::new(CompatProfile {
            tag: "perplexity",
            env_prefix: "PERPLEXITY",
            api_key_aliases: &[],
            default_base_url: "https://api.perplexity.ai",
            default_model: "sonar",
            default_temperature: 0.7,
            requires_api_key: true,
            extra_headers: None,
        })
    }

    pub fn xai() -> Self {
        Self::new(CompatProfile {
            tag: "xai",
            env_prefix: "XAI",
            api_key_aliases: &[],
            default_base_url: "https://api.x.ai",
            default_model: "grok-3-mini",
            default_temperature: 0.7,
            requires_api_key: true,
            extra_headers: None,
        })
    }

    /// Whether the model takes `max_completion_tokens` instead of the
    /// legacy `max_tokens`.
    fn uses_max_completion_tokens(model: &str) -> bool {
        ["o1", "o3", "o4", "gpt-5"]
            .iter()
            .any(|prefix| model.starts_with(prefix))
    }

    fn message_to_json(message: &Message) -> Value {
        let content = match &message.content {
            MessageContent::Text(text) => json!(text),
            MessageContent::Parts(parts) => json!(parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::ImageUrl { url } => {
                        json!({"type": "image_url", "image_url": {"url": url}})
                    }
                    ContentPart::AudioInput { data, format } => {
                        json!({"type": "input_audio", "input_audio": {"data": data, "format": format}})
                    }
                })
                .collect::<Vec<_>>()),
        };
        json!({"role": message.role.as_str(), "content": content})
    }

    fn build_body(&self, req: &Request) -> Value {
        let options = &req.options;
        let model = &req.config.model;

        let mut messages = Vec::new();
        if let Some(ref system) = options.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(req.messages.iter().map(Self::message_to_json));

        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": options.temperature.unwrap_or(self.profile.default_temperature),
        });

        if let Some(max_tokens) = options.max_tokens {
            if Self::uses_max_completion_tokens(model) {
                body["max_completion_tokens"] = json!(max_tokens);
            } else {
                body["max_tokens"] = json!(max_tokens);
            }
        }
        if let Some(explicit) = options.max_completion_tokens {
            body["max_completion_tokens"] = json!(explicit);
        }

        let optional: &[(&str, Option<Value>)] = &[
            ("top_p", options.top_p.map(Value::from)),
            ("frequency_penalty", options.frequency_penalty.map(Value::from)),
            ("presence_penalty", options.presence_penalty.map(Value::from)),
            ("stop", options.stop.as_ref().map(|s| json!(s))),
            ("user", options.user.as_ref().map(|u| json!(u))),
            ("seed", options.seed.map(Value::from)),
            ("response_format", options.response_format.clone()),
            ("tools", options.tools.clone()),
            ("tool_choice", options.tool_choice.clone()),
            (
                "parallel_tool_calls",
                options.parallel_tool_calls.map(Value::from),
            ),
            ("n", options.n.map(Value::from)),
            ("logprobs", options.logprobs.map(Value::from)),
            ("top_logprobs", options.top_logprobs.map(Value::from)),
            // OpenRouter routing passthrough; harmless elsewhere, so gated
            // on presence rather than provider.
            ("transforms", options.transforms.clone()),
            ("route", options.route.clone()),
            ("models", options.models.clone()),
            ("provider", options.provider_prefs.clone()),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                body[*key] = value.clone();
            }
        }

        if options.stream {
            body["stream"] = json!(true);
            if let Some(ref stream_options) = options.stream_options {
                body["stream_options"] = stream_options.clone();
            }
        }

        body
    }

    fn headers(&self, config: &ResolvedConfig) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(ref key) = config.api_key {
            headers.push(("authorization".to_string(), format!("Bearer {key}")));
        }
        if let Some(extra) = self.profile.extra_headers {
            extra(config, &mut headers);
        }
        headers
    }
}

impl ProviderAdapter for OpenAiCompatAdapter {
    fn tag(&self) -> &'static str {
        self.profile.tag
    }

    fn defaults(&self) -> ProviderDefaults {
        ProviderDefaults {
            env_prefix: self.profile.env_prefix,
            api_key_aliases: self.profile.api_key_aliases,
            default_base_url: self.profile.default_base_url,
            default_model: self.profile.default_model,
            requires_api_key: self.profile.requires_api_key,
        }
    }

    fn build_request(&self, req: &mut Request) -> Result<()> {
        req.assigns.request_url = Some(format!("{}/v1/chat/completions", req.config.base_url));
        req.assigns.request_body = Some(self.build_body(req));
        req.assigns.request_headers = self.headers(&req.config);
        req.assigns.model = Some(req.config.model.clone());
        Ok(())
    }

    fn parse_response(&self, body: &Value, model: &str) -> Result<ChatResponse> {
        check_provider_error(body, self.profile.tag)?;

        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LlmError::Protocol("response has no choices".into()))?;
        let message = choice
            .get("message")
            .ok_or_else(|| LlmError::Protocol("choice has no message".into()))?;

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            // Reasoning models may put everything in reasoning_content.
            .or_else(|| message.get("reasoning_content").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        Ok(ChatResponse {
            content,
            model: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(model)
                .to_string(),
            usage: usage_from_openai(body.get("usage")),
            cost: None,
            finish_reason: choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            tool_calls: normalize_tool_calls(message),
            refusal: message
                .get("refusal")
                .and_then(Value::as_str)
                .map(str::to_string),
            logprobs: choice.get("logprobs").filter(|l| !l.is_null()).cloned(),
            metadata: ResponseMetadata {
                provider: self.profile.tag.to_string(),
                role: message
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
        Box::new(SseDecoder::new())
    }

    fn build_embeddings_request(&self, req: &mut Request) -> Result<()> {
        req.assigns.request_url = Some(format!("{}/v1/embeddings", req.config.base_url));
        req.assigns.request_body = Some(json!({
            "model": req.config.model,
            "input": req.inputs,
        }));
        req.assigns.request_headers = self.headers(&req.config);
        req.assigns.model = Some(req.config.model.clone());
        Ok(())
    }

    fn parse_embeddings_response(&self, body: &Value, model: &str) -> Result<EmbeddingResponse> {
        check_provider_error(body, self.profile.tag)?;
        let data = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| LlmError::Protocol("embeddings response has no data".into()))?;
        let embeddings = data
            .iter()
            .filter_map(|entry| entry.get("embedding").and_then(Value::as_array))
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
            usage: body.get("usage").map(|u| usage_from_openai(Some(u))),
        })
    }

    fn models_url(&self, config: &ResolvedConfig) -> Option<String> {
        Some(format!("{}/v1/models", config.base_url))
    }

    fn parse_models(&self, body: &Value) -> Vec<ModelInfo> {
        body.get("data")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(|id| ModelInfo {
                        id: id.to_string(),
                        provider: self.profile.tag.to_string(),
                        context_window: None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
