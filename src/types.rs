//! Canonical request/response types shared by every provider adapter.
//!
//! Adapters translate between these normalized shapes and the provider's
//! wire format. Nothing in here is provider-specific: [`ChatResponse`] is
//! what every `parse_response` produces and [`StreamChunk`] is what every
//! streaming decoder yields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
    /// Tool/function result fed back to the model.
    Tool,
}

impl Role {
    /// The lowercase wire name (`"system"`, `"user"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One typed part of a multi-part message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// Image by URL (or data URL).
    ImageUrl {
        /// The image location.
        url: String,
    },
    /// Base64 audio input with its format tag.
    AudioInput {
        /// Base64-encoded audio data.
        data: String,
        /// Audio format (e.g. `"wav"`, `"mp3"`).
        format: String,
    },
}

/// Message content: either a plain string or a sequence of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content.
    Text(String),
    /// Multi-part content (text, images, audio).
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Whether the content is empty (empty string or zero parts).
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(p) => p.is_empty(),
        }
    }

    /// Concatenated text of all textual content, ignoring non-text parts.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message author.
    pub role: Role,
    /// The message content.
    pub content: MessageContent,
}

impl Message {
    /// Shorthand for a system message.
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Shorthand for a user message.
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Shorthand for an assistant message.
    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token accounting for one request/response exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u32,
    /// Tokens produced by the completion.
    pub output_tokens: u32,
    /// Total tokens (provider-reported, or input + output).
    pub total_tokens: u32,
    /// Prompt tokens served from the provider's context cache, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u32>,
    /// Reasoning tokens (o-series style), if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u32>,
    /// Audio tokens, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_tokens: Option<u32>,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned (or generated) call id.
    pub id: String,
    /// Call type; currently always `"function"`.
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function name and serialized arguments.
    pub function: FunctionCall,
}

/// The function half of a [`ToolCall`] (also the legacy top-level shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name.
    pub name: String,
    /// JSON-encoded argument string, verbatim from the provider.
    pub arguments: String,
}

/// Response metadata common to every provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Provider tag that produced the response.
    pub provider: String,
    /// Role of the responding message (normally `"assistant"`).
    pub role: String,
    /// Whether the response was served from the replay cache.
    #[serde(default)]
    pub from_cache: bool,
    /// Cost breakdown populated by an installed cost calculator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_details: Option<Value>,
    /// The provider's raw response body, preserved for debugging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,
}

/// Canonical chat completion result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The generated text content.
    pub content: String,
    /// Model that produced the response.
    pub model: String,
    /// Token accounting.
    pub usage: Usage,
    /// Estimated cost in USD, when a cost calculator is installed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Why the model stopped (`"stop"`, `"length"`, `"tool_calls"`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Tool calls requested by the model. Legacy `function_call` shapes are
    /// normalized into this list by the adapters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Refusal text, when the provider reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    /// Log probabilities, verbatim, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Value>,
    /// Provider/role/cache metadata.
    pub metadata: ResponseMetadata,
}

impl ChatResponse {
    /// Approximate serialized size, used for cache telemetry measurements.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// One incremental piece of a streamed response.
///
/// A stream is a finite sequence of chunks with exactly one terminal chunk,
/// identified by a non-`None` [`finish_reason`](Self::finish_reason).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Incremental text, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Terminal marker; `Some` exactly once per stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Model id, when the provider repeats it per chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Free-form per-chunk metadata (usage deltas, sub-provider fields).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl StreamChunk {
    /// Text-only chunk.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// Terminal chunk with the given finish reason.
    pub fn done(finish_reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(finish_reason.into()),
            ..Self::default()
        }
    }

    /// Whether this is the terminal chunk.
    pub fn is_done(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Whether the chunk carries neither text nor a terminal marker.
    pub fn is_empty(&self) -> bool {
        self.content.as_deref().map_or(true, str::is_empty) && self.finish_reason.is_none()
    }

    /// Byte length of the chunk's text content.
    pub fn content_len(&self) -> usize {
        self.content.as_deref().map_or(0, str::len)
    }
}

/// Result of an embeddings request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// One vector per input, in input order.
    pub embeddings: Vec<Vec<f32>>,
    /// Model that produced the vectors.
    pub model: String,
    /// Token accounting, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A model listed by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier.
    pub id: String,
    /// Owning provider tag.
    pub provider: String,
    /// Context window in tokens, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
}
