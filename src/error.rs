use std::time::Duration;
use thiserror::Error;

/// Errors produced by the client runtime and its components.
///
/// Variants follow the error kinds the pipeline distinguishes: validation
/// and configuration problems halt before any I/O; transport and HTTP
/// failures pass through the retry layer first; the remaining variants
/// come from specific subsystems (breaker, streaming, cache, recovery).
#[derive(Error, Debug)]
pub enum LlmError {
    /// Bad provider tag, malformed messages, or unusable options.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing or unresolvable configuration (API key, region, base URL).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Low-level HTTP transport failure (connection refused, timeout, TLS).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON encoding or decoding failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// The `retry_after` field is populated from the `Retry-After` response
    /// header when present and is honored by the retry layer.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// A streaming decoder could not produce a single valid chunk.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The provider returned a structured error object.
    #[error("provider '{provider}' error: {payload}")]
    Provider {
        /// Provider tag the error came from.
        provider: String,
        /// The provider's error payload, verbatim.
        payload: serde_json::Value,
    },

    /// The circuit breaker for this provider is open; no HTTP was issued.
    #[error("circuit open for '{provider}', retry after {retry_after:?}")]
    CircuitOpen {
        /// Provider whose circuit is open.
        provider: String,
        /// Suggested wait before the next attempt.
        retry_after: Duration,
    },

    /// The flow controller's buffer is above the backpressure threshold.
    /// Advisory: the producer decides whether to retry or drop.
    #[error("stream buffer above backpressure threshold")]
    Backpressure,

    /// The request was cancelled via the cancellation flag.
    #[error("request was cancelled")]
    Cancelled,

    /// Cache or recovery lookup found nothing for the given key.
    #[error("not found: {0}")]
    NotFound(String),

    /// The per-request deadline elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Catch-all for unexpected failures (plug panics, callback errors).
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for LlmError {
    fn from(err: anyhow::Error) -> Self {
        LlmError::Other(err.to_string())
    }
}

impl LlmError {
    /// Short stable tag for telemetry metadata (`kind` field on exception events).
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Validation(_) => "validation",
            LlmError::Configuration(_) => "configuration",
            LlmError::Request(_) => "transport",
            LlmError::Json(_) => "json",
            LlmError::Http { .. } => "http",
            LlmError::Protocol(_) => "protocol",
            LlmError::Provider { .. } => "provider",
            LlmError::CircuitOpen { .. } => "circuit_open",
            LlmError::Backpressure => "backpressure",
            LlmError::Cancelled => "cancelled",
            LlmError::NotFound(_) => "not_found",
            LlmError::Timeout(_) => "timeout",
            LlmError::Other(_) => "exception",
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(LlmError::Validation("x".into()).kind(), "validation");
        assert_eq!(LlmError::Backpressure.kind(), "backpressure");
        assert_eq!(
            LlmError::CircuitOpen {
                provider: "openai".into(),
                retry_after: Duration::from_secs(60),
            }
            .kind(),
            "circuit_open"
        );
        assert_eq!(LlmError::Timeout(Duration::from_secs(1)).kind(), "timeout");
    }

    #[test]
    fn test_http_error_display() {
        let err = LlmError::Http {
            status: 503,
            body: "overloaded".into(),
            retry_after: None,
        };
        assert_eq!(err.to_string(), "HTTP 503: overloaded");
    }

    #[test]
    fn test_provider_error_carries_payload() {
        let err = LlmError::Provider {
            provider: "anthropic".into(),
            payload: serde_json::json!({"type": "overloaded_error"}),
        };
        assert!(err.to_string().contains("anthropic"));
        assert!(err.to_string().contains("overloaded_error"));
    }
}
