//! AWS Bedrock adapter.
//!
//! Bedrock multiplexes many model families behind one runtime API:
//! `POST https://bedrock-runtime.<region>.amazonaws.com/model/<model-id>/invoke`
//! (`invoke-with-response-stream` when streaming), signed with SigV4. The
//! family, selected by the model id's leading dotted segment, decides the
//! body shape and where the response text and finish reason live.

use serde_json::{json, Value};

use super::{sigv4, ProviderAdapter};
use crate::config::ProviderDefaults;
use crate::error::{LlmError, Result};
use crate::pipeline::Request;
use crate::streaming::eventstream::{BedrockFamily, EventStreamDecoder};
use crate::streaming::StreamDecoder;
use crate::types::{ChatResponse, Message, ResponseMetadata, Role, Usage};

const ANTHROPIC_BEDROCK_VERSION: &str = "bedrock-2023-05-31";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Adapter for the Bedrock runtime API.
pub struct BedrockAdapter;

impl BedrockAdapter {
    fn family_tag(family: BedrockFamily) -> &'static str {
        match family {
            BedrockFamily::Anthropic => "anthropic",
            BedrockFamily::Titan => "amazon",
            BedrockFamily::Meta => "meta",
            BedrockFamily::Cohere => "cohere",
            BedrockFamily::Ai21 => "ai21",
            BedrockFamily::Mistral => "mistral",
            BedrockFamily::Writer => "writer",
            BedrockFamily::DeepSeek => "deepseek",
            BedrockFamily::Unknown => "unknown",
        }
    }

    /// Flatten the conversation into a single prompt for completion-style
    /// families (Titan, Meta, Cohere, Mistral).
    fn flatten_prompt(messages: &[Message], system: Option<&str>) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(system) = system {
            parts.push(system.to_string());
        }
        for message in messages {
            let text = message.content.as_text();
            match message.role {
                Role::System => parts.push(text),
                Role::User | Role::Tool => parts.push(format!("User: {text}")),
                Role::Assistant => parts.push(format!("Assistant: {text}")),
            }
        }
        parts.push("Assistant:".to_string());
        parts.join("\n\n")
    }

    fn openai_style_messages(req: &Request) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(ref system) = req.options.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &req.messages {
            messages.push(json!({
                "role": message.role.as_str(),
                "content": message.content.as_text(),
            }));
        }
        messages
    }

    fn build_body(req: &Request, family: BedrockFamily) -> Value {
        let options = &req.options;
        let max_tokens = options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let system = options.system.as_deref();

        match family {
            BedrockFamily::Anthropic => {
                let mut system_parts: Vec<String> =
                    system.map(str::to_string).into_iter().collect();
                let mut messages = Vec::new();
                for message in &req.messages {
                    match message.role {
                        Role::System => system_parts.push(message.content.as_text()),
                        role => messages.push(json!({
                            "role": if role == Role::Assistant { "assistant" } else { "user" },
                            "content": message.content.as_text(),
                        })),
                    }
                }
                let mut body = json!({
                    "anthropic_version": ANTHROPIC_BEDROCK_VERSION,
                    "max_tokens": max_tokens,
                    "messages": messages,
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
                body
            }
            BedrockFamily::Titan => {
                let mut config = json!({"maxTokenCount": max_tokens});
                if let Some(temperature) = options.temperature {
                    config["temperature"] = json!(temperature);
                }
                if let Some(top_p) = options.top_p {
                    config["topP"] = json!(top_p);
                }
                if let Some(ref stop) = options.stop {
                    config["stopSequences"] = json!(stop);
                }
                json!({
                    "inputText": Self::flatten_prompt(&req.messages, system),
                    "textGenerationConfig": config,
                })
            }
            BedrockFamily::Meta => {
                let mut body = json!({
                    "prompt": Self::flatten_prompt(&req.messages, system),
                    "max_gen_len": max_tokens,
                });
                if let Some(temperature) = options.temperature {
                    body["temperature"] = json!(temperature);
                }
                if let Some(top_p) = options.top_p {
                    body["top_p"] = json!(top_p);
                }
                body
            }
            BedrockFamily::Cohere => {
                let mut body = json!({
                    "prompt": Self::flatten_prompt(&req.messages, system),
                    "max_tokens": max_tokens,
                });
                if let Some(temperature) = options.temperature {
                    body["temperature"] = json!(temperature);
                }
                body
            }
            BedrockFamily::Mistral => {
                let mut body = json!({
                    "prompt": Self::flatten_prompt(&req.messages, system),
                    "max_tokens": max_tokens,
                });
                if let Some(temperature) = options.temperature {
                    body["temperature"] = json!(temperature);
                }
                if let Some(top_p) = options.top_p {
                    body["top_p"] = json!(top_p);
                }
                body
            }
            BedrockFamily::Ai21
            | BedrockFamily::Writer
            | BedrockFamily::DeepSeek
            | BedrockFamily::Unknown => {
                let mut body = json!({
                    "messages": Self::openai_style_messages(req),
                    "max_tokens": max_tokens,
                });
                if let Some(temperature) = options.temperature {
                    body["temperature"] = json!(temperature);
                }
                body
            }
        }
    }

    fn parse_body(family: BedrockFamily, body: &Value, model: &str) -> Result<ChatResponse> {
        let (content, finish_reason, usage) = match family {
            BedrockFamily::Anthropic => {
                let content: String = body
                    .get("content")
                    .and_then(Value::as_array)
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                            .filter_map(|b| b.get("text").and_then(Value::as_str))
                            .collect()
                    })
                    .ok_or_else(|| LlmError::Protocol("response has no content blocks".into()))?;
                let usage = body.get("usage");
                let input = usage
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                let output = usage
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                (
                    content,
                    body.get("stop_reason").and_then(Value::as_str),
                    Usage {
                        input_tokens: input,
                        output_tokens: output,
                        total_tokens: input + output,
                        ..Usage::default()
                    },
                )
            }
            BedrockFamily::Titan => {
                let result = body
                    .get("results")
                    .and_then(|r| r.get(0))
                    .ok_or_else(|| LlmError::Protocol("response has no results".into()))?;
                let input = body
                    .get("inputTextTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                let output = result
                    .get("tokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                (
                    result
                        .get("outputText")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    result.get("completionReason").and_then(Value::as_str),
                    Usage {
                        input_tokens: input,
                        output_tokens: output,
                        total_tokens: input + output,
                        ..Usage::default()
                    },
                )
            }
            BedrockFamily::Meta => {
                let input = body
                    .get("prompt_token_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                let output = body
                    .get("generation_token_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                (
                    body.get("generation")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    body.get("stop_reason").and_then(Value::as_str),
                    Usage {
                        input_tokens: input,
                        output_tokens: output,
                        total_tokens: input + output,
                        ..Usage::default()
                    },
                )
            }
            BedrockFamily::Cohere => {
                let generation = body
                    .get("generations")
                    .and_then(|g| g.get(0))
                    .ok_or_else(|| LlmError::Protocol("response has no generations".into()))?;
                (
                    generation
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    generation.get("finish_reason").and_then(Value::as_str),
                    Usage::default(),
                )
            }
            BedrockFamily::Mistral => {
                let output = body
                    .get("outputs")
                    .and_then(|o| o.get(0))
                    .ok_or_else(|| LlmError::Protocol("response has no outputs".into()))?;
                (
                    output
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    output.get("stop_reason").and_then(Value::as_str),
                    Usage::default(),
                )
            }
            BedrockFamily::Ai21
            | BedrockFamily::Writer
            | BedrockFamily::DeepSeek
            | BedrockFamily::Unknown => {
                let choice = body
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .ok_or_else(|| LlmError::Protocol("response has no choices".into()))?;
                (
                    choice
                        .get("message")
                        .and_then(|m| m.get("content"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    choice.get("finish_reason").and_then(Value::as_str),
                    super::usage_from_openai(body.get("usage")),
                )
            }
        };

        Ok(ChatResponse {
            content,
            model: model.to_string(),
            usage,
            cost: None,
            finish_reason: finish_reason.map(str::to_string),
            tool_calls: None,
            refusal: None,
            logprobs: None,
            metadata: ResponseMetadata {
                provider: "bedrock".to_string(),
                role: "assistant".to_string(),
                from_cache: false,
                cost_details: None,
                raw_response: Some(body.clone()),
            },
        })
    }
}

impl ProviderAdapter for BedrockAdapter {
    fn tag(&self) -> &'static str {
        "bedrock"
    }

    fn defaults(&self) -> ProviderDefaults {
        ProviderDefaults {
            env_prefix: "BEDROCK",
            api_key_aliases: &[],
            // The real URL is derived from the region at build time.
            default_base_url: "",
            default_model: "anthropic.claude-3-sonnet-v1:0",
            requires_api_key: false,
        }
    }

    fn build_request(&self, req: &mut Request) -> Result<()> {
        let region = req
            .config
            .aws
            .as_ref()
            .map(|aws| aws.region.clone())
            .ok_or_else(|| {
                LlmError::Configuration(
                    "bedrock requires AWS credentials (AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)"
                        .into(),
                )
            })?;

        let model = req.config.model.clone();
        let family = BedrockFamily::from_model_id(&model);
        let action = if req.options.stream {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };

        req.assigns.request_url = Some(format!(
            "https://bedrock-runtime.{region}.amazonaws.com/model/{model}/{action}"
        ));
        req.assigns.request_body = Some(Self::build_body(req, family));
        req.assigns.request_headers = vec![(
            "content-type".to_string(),
            "application/json".to_string(),
        )];
        req.assigns.model = Some(model);
        req.assigns.provider_type = Some(Self::family_tag(family).to_string());
        req.assigns.aws_region = Some(region);
        Ok(())
    }

    fn parse_response(&self, body: &Value, model: &str) -> Result<ChatResponse> {
        if let Some(message) = body.get("message").and_then(Value::as_str) {
            // Runtime errors come back as {"message": "..."} envelopes.
            if body.get("content").is_none() && body.get("results").is_none() {
                return Err(LlmError::Provider {
                    provider: "bedrock".to_string(),
                    payload: json!({ "message": message }),
                });
            }
        }
        Self::parse_body(BedrockFamily::from_model_id(model), body, model)
    }

    fn stream_decoder(&self, req: &Request) -> Box<dyn StreamDecoder> {
        let model = req
            .assigns
            .model
            .as_deref()
            .unwrap_or(&req.config.model);
        Box::new(EventStreamDecoder::new(BedrockFamily::from_model_id(model)))
    }

    fn requires_signing(&self) -> bool {
        true
    }

    fn sign_request(&self, req: &mut Request) -> Result<()> {
        let aws = req.config.aws.as_ref().ok_or_else(|| {
            LlmError::Configuration("bedrock signing requires AWS credentials".into())
        })?;
        let url = req
            .assigns
            .request_url
            .as_deref()
            .ok_or_else(|| LlmError::Other("sign_request before build_request".into()))?;
        let payload = req
            .assigns
            .request_body
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?
            .unwrap_or_default();

        let signature_headers = sigv4::sign(&sigv4::SigningParams {
            credentials: aws,
            service: "bedrock",
            method: "POST",
            url,
            payload: &payload,
            timestamp: std::time::SystemTime::now(),
        })?;
        req.assigns.request_headers.extend(signature_headers);
        Ok(())
    }
}
