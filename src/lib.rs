//! # LLM Conduit
//!
//! Unified async client runtime for Large-Language-Model providers.
//!
//! One shape-preserving interface over OpenAI, Anthropic, Google Gemini,
//! AWS Bedrock, Ollama, Groq, Mistral, OpenRouter, Perplexity, xAI, and an
//! in-process local runner. The per-provider HTTP wrappers are the easy
//! part; this crate is about the **runtime** around them:
//!
//! - **Request pipeline**: every call travels through an ordered plug
//!   chain (validate → configure → build → sign → execute → parse) that
//!   halts cleanly on the first error and nests for middleware.
//! - **Streaming**: SSE, NDJSON, and AWS event-stream decoders feed a
//!   [`FlowController`](streaming::flow::FlowController) that mediates fast
//!   producers onto slow consumers with a bounded buffer, backpressure,
//!   rate limiting, optional batching, and metrics. Partial output can be
//!   persisted for mid-stream recovery.
//! - **Resilience**: per-provider circuit breakers, jittered retry, and a
//!   two-tier response cache (hot in-memory with single-flight population,
//!   cold on-disk replay store for tests).
//! - **Observability**: span timing and lifecycle events through a small
//!   [`EventHandler`](telemetry::EventHandler) trait, mirrored to `tracing`.
//!
//! ## Quick start
//!
//! ```no_run
//! use llm_conduit::{ChatOptions, LlmClient, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = LlmClient::new()?;
//!
//!     // One-shot chat (API key from OPENAI_API_KEY).
//!     let response = client
//!         .chat(
//!             "openai",
//!             vec![Message::user("Why is the sky blue?")],
//!             ChatOptions::default().with_model("gpt-4o-mini"),
//!         )
//!         .await?;
//!     println!("{}", response.content);
//!
//!     // Streaming with the pull interface.
//!     let mut stream = client
//!         .stream(
//!             "ollama",
//!             vec![Message::user("Tell me a story")],
//!             ChatOptions::default(),
//!         )
//!         .await?;
//!     while let Some(chunk) = stream.recv().await {
//!         if let Some(text) = chunk.content.as_deref() {
//!             print!("{text}");
//!         }
//!         if chunk.is_done() {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Provider routing
//!
//! The [`capabilities`] registry answers which provider serves which
//! endpoint and feature, compares providers side by side, and ranks them
//! against a set of required/preferred features.

pub mod breaker;
pub mod cache;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod options;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod streaming;
pub mod telemetry;
pub mod types;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerStatus};
pub use cache::{fingerprint, CacheConfig, ResponseCache};
pub use capabilities::{CapabilityRecord, Feature};
pub use client::{LlmClient, LlmClientBuilder, StreamHandle};
pub use config::{ProviderOverrides, ResolvedConfig};
pub use error::{LlmError, Result};
pub use options::ChatOptions;
pub use pipeline::{ConditionalPlug, ExecCtx, Pipeline, Plug, Request, RequestState};
pub use providers::local::LocalRunner;
pub use providers::mock::MockRunner;
pub use retry::RetryPolicy;
pub use streaming::flow::{FlowConfig, FlowController, FlowMetrics};
pub use streaming::recovery::RecoveryStore;
pub use telemetry::{EventHandler, FnEventHandler, Telemetry, TelemetryEvent};
pub use types::{
    ChatResponse, EmbeddingResponse, Message, MessageContent, ModelInfo, Role, StreamChunk,
    Usage,
};
