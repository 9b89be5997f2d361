//! In-process model runner provider.
//!
//! The `local` provider skips HTTP entirely: an embedder-supplied
//! [`LocalRunner`] produces a token iterator that the execute-local plug
//! drives either into a collected [`ChatResponse`] or into the streaming
//! path, chunk by chunk. Useful for on-device models and for deterministic
//! tests (see [`mock::MockRunner`](super::mock::MockRunner)).

use serde_json::Value;

use super::ProviderAdapter;
use crate::config::ProviderDefaults;
use crate::error::{LlmError, Result};
use crate::options::ChatOptions;
use crate::pipeline::Request;
use crate::streaming::ndjson::NdjsonDecoder;
use crate::streaming::StreamDecoder;
use crate::types::{ChatResponse, Message};

/// An in-process token generator.
pub trait LocalRunner: Send + Sync {
    /// Produce the token sequence for a conversation.
    ///
    /// Tokens are yielded in order; the runtime assembles usage counts from
    /// the iterator (one token per item, a whitespace-split heuristic for
    /// the prompt side).
    fn generate(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<Box<dyn Iterator<Item = String> + Send>>;

    /// Model name reported in responses.
    fn model_name(&self) -> String {
        "local".to_string()
    }
}

/// Adapter stub for the `local` provider tag.
///
/// There is no wire format: `build_request` only records the model, and the
/// execute-local plug talks to the [`LocalRunner`] directly.
pub struct LocalAdapter;

impl ProviderAdapter for LocalAdapter {
    fn tag(&self) -> &'static str {
        "local"
    }

    fn defaults(&self) -> ProviderDefaults {
        ProviderDefaults {
            env_prefix: "LOCAL",
            api_key_aliases: &[],
            default_base_url: "local://in-process",
            default_model: "local",
            requires_api_key: false,
        }
    }

    fn build_request(&self, req: &mut Request) -> Result<()> {
        req.assigns.model = Some(req.config.model.clone());
        Ok(())
    }

    fn parse_response(&self, _body: &Value, _model: &str) -> Result<ChatResponse> {
        Err(LlmError::Other(
            "the local provider has no HTTP response to parse".into(),
        ))
    }

    fn stream_decoder(&self, _req: &Request) -> Box<dyn StreamDecoder> {
        // Never reached: local streams are built from the token iterator,
        // not from wire bytes.
        Box::new(NdjsonDecoder::new())
    }
}

/// Whitespace token-count heuristic for prompt-side usage accounting.
pub(crate) fn approximate_tokens(messages: &[Message]) -> u32 {
    messages
        .iter()
        .map(|m| m.content.as_text().split_whitespace().count() as u32)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_require_no_key() {
        let defaults = LocalAdapter.defaults();
        assert!(!defaults.requires_api_key);
        assert_eq!(defaults.default_model, "local");
    }

    #[test]
    fn test_parse_response_is_unsupported() {
        assert!(LocalAdapter
            .parse_response(&serde_json::json!({}), "local")
            .is_err());
    }

    #[test]
    fn test_approximate_tokens() {
        let messages = vec![
            Message::system("You are terse."),
            Message::user("How many tokens is this?"),
        ];
        assert_eq!(approximate_tokens(&messages), 8);
    }
}
