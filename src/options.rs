//! Request options recognized by the pipeline.
//!
//! [`ChatOptions`] is the typed rendition of the option set every provider
//! adapter understands. Unset fields are omitted from provider bodies;
//! adapters ignore fields their wire format has no slot for.

use serde_json::Value;
use std::time::Duration;

use crate::streaming::batcher::BatchConfig;
use crate::streaming::ChunkCallback;

/// Options for a chat, stream, or embeddings request.
///
/// All fields are optional; adapters apply their own defaults (e.g.
/// temperature 0.7 for the OpenAI-compatible family). Builder methods follow
/// the `with_*` convention.
///
/// # Example
///
/// ```
/// use llm_conduit::ChatOptions;
///
/// let options = ChatOptions::default()
///     .with_model("gpt-4")
///     .with_temperature(0.5)
///     .with_max_tokens(100);
/// ```
#[derive(Clone, Default)]
pub struct ChatOptions {
    /// Model id; falls back to the provider's configured default.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Completion token cap. Mapped to `max_completion_tokens` for model
    /// families that require it.
    pub max_tokens: Option<u32>,
    /// Explicit `max_completion_tokens`, overriding the mapping.
    pub max_completion_tokens: Option<u32>,
    /// Nucleus sampling parameter.
    pub top_p: Option<f64>,
    /// Frequency penalty.
    pub frequency_penalty: Option<f64>,
    /// Presence penalty.
    pub presence_penalty: Option<f64>,
    /// Stop sequences.
    pub stop: Option<Vec<String>>,
    /// End-user identifier passed through to the provider.
    pub user: Option<String>,
    /// Sampling seed.
    pub seed: Option<u64>,
    /// Response format (e.g. `{"type": "json_object"}`), verbatim.
    pub response_format: Option<Value>,
    /// Tool definitions, verbatim.
    pub tools: Option<Value>,
    /// Tool choice directive, verbatim.
    pub tool_choice: Option<Value>,
    /// Whether the model may call tools in parallel.
    pub parallel_tool_calls: Option<bool>,
    /// Number of completions to request.
    pub n: Option<u32>,
    /// Request log probabilities.
    pub logprobs: Option<bool>,
    /// How many top logprobs per token.
    pub top_logprobs: Option<u32>,
    /// System prompt injected ahead of the message list.
    pub system: Option<String>,
    /// Enable streaming delivery.
    pub stream: bool,
    /// Per-chunk callback for streaming requests. Moved into the resolved
    /// configuration by the streaming-preparation plug.
    pub on_chunk: Option<ChunkCallback>,
    /// Per-request deadline. Default: 60 s.
    pub timeout: Option<Duration>,
    /// Consult the response cache for this request.
    pub cache: bool,
    /// Record partial chunks under this recovery id (generated when `Some("")`).
    pub recovery_id: Option<String>,
    /// AWS region override for Bedrock.
    pub region: Option<String>,
    /// OpenRouter passthrough: prompt transforms.
    pub transforms: Option<Value>,
    /// OpenRouter passthrough: routing directive.
    pub route: Option<Value>,
    /// OpenRouter passthrough: model fallback list.
    pub models: Option<Value>,
    /// OpenRouter passthrough: provider preferences.
    pub provider_prefs: Option<Value>,
    /// OpenRouter passthrough: stream options.
    pub stream_options: Option<Value>,
    /// Flow-controller batching configuration.
    pub batch_config: Option<BatchConfig>,
    /// Flow-controller buffer capacity override.
    pub buffer_capacity: Option<usize>,
    /// Flow-controller backpressure threshold override (fraction of capacity).
    pub backpressure_threshold: Option<f64>,
}

impl std::fmt::Debug for ChatOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOptions")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("stream", &self.stream)
            .field("cache", &self.cache)
            .field("has_on_chunk", &self.on_chunk.is_some())
            .field("recovery_id", &self.recovery_id)
            .finish_non_exhaustive()
    }
}

impl ChatOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Value) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_response_format(mut self, format: Value) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_recovery_id(mut self, id: impl Into<String>) -> Self {
        self.recovery_id = Some(id.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_batch_config(mut self, config: BatchConfig) -> Self {
        self.batch_config = Some(config);
        self
    }

    pub fn with_on_chunk(mut self, callback: ChunkCallback) -> Self {
        self.on_chunk = Some(callback);
        self
    }

    /// The subset of options that affect the provider's output, serialized
    /// deterministically. Used by the cache fingerprint.
    pub fn salient(&self) -> Value {
        let mut map = serde_json::Map::new();
        if let Some(t) = self.temperature {
            map.insert("temperature".into(), t.into());
        }
        if let Some(m) = self.max_tokens {
            map.insert("max_tokens".into(), m.into());
        }
        if let Some(p) = self.top_p {
            map.insert("top_p".into(), p.into());
        }
        if let Some(ref s) = self.stop {
            map.insert("stop".into(), serde_json::json!(s));
        }
        if let Some(s) = self.seed {
            map.insert("seed".into(), s.into());
        }
        if let Some(ref f) = self.response_format {
            map.insert("response_format".into(), f.clone());
        }
        if let Some(ref t) = self.tools {
            map.insert("tools".into(), t.clone());
        }
        if let Some(ref s) = self.system {
            map.insert("system".into(), s.clone().into());
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = ChatOptions::default()
            .with_model("gpt-4")
            .with_temperature(0.5)
            .with_max_tokens(100)
            .with_stream(true);
        assert_eq!(options.model.as_deref(), Some("gpt-4"));
        assert_eq!(options.temperature, Some(0.5));
        assert_eq!(options.max_tokens, Some(100));
        assert!(options.stream);
    }

    #[test]
    fn test_defaults_are_unset() {
        let options = ChatOptions::default();
        assert!(options.model.is_none());
        assert!(!options.stream);
        assert!(!options.cache);
        assert!(options.timeout.is_none());
    }

    #[test]
    fn test_salient_subset_is_deterministic() {
        let a = ChatOptions::default()
            .with_temperature(0.5)
            .with_max_tokens(100)
            .with_seed(42);
        let b = ChatOptions::default()
            .with_seed(42)
            .with_max_tokens(100)
            .with_temperature(0.5);
        assert_eq!(a.salient(), b.salient());
    }

    #[test]
    fn test_salient_ignores_delivery_options() {
        let quiet = ChatOptions::default().with_temperature(0.5);
        let streaming = ChatOptions::default()
            .with_temperature(0.5)
            .with_stream(true)
            .with_cache(true)
            .with_recovery_id("r1");
        // Delivery knobs must not change the cache fingerprint input.
        assert_eq!(quiet.salient(), streaming.salient());
    }
}
