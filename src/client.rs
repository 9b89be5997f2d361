//! The caller-facing client.
//!
//! [`LlmClient`] owns the shared runtime (HTTP client, breakers, caches,
//! recovery, telemetry, adapters) and exposes the uniform surface:
//! [`chat`](LlmClient::chat), [`stream`](LlmClient::stream),
//! [`embeddings`](LlmClient::embeddings), and the catalog queries. Every
//! call runs the standard pipeline; the client only adds the cache wrapper
//! (chat) and the flow-controller plumbing (stream).

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::cache::replay::ReplayStore;
use crate::cache::{fingerprint, CacheConfig, ResponseCache};
use crate::capabilities::{self, Feature};
use crate::config::{ConfigResolver, EnvSource, ProcessEnv, ProviderOverrides};
use crate::error::{LlmError, Result};
use crate::http;
use crate::options::ChatOptions;
use crate::pipeline::standard::standard_pipeline;
use crate::pipeline::{ExecCtx, Request};
use crate::providers::local::LocalRunner;
use crate::providers::AdapterRegistry;
use crate::retry::RetryPolicy;
use crate::streaming::flow::{ChunkConsumer, FlowConfig, FlowController, FlowMetrics};
use crate::streaming::recovery::RecoveryStore;
use crate::telemetry::{EventHandler, Telemetry, TelemetryEvent};
use crate::types::{
    ChatResponse, EmbeddingResponse, Message, ModelInfo, ResponseMetadata, StreamChunk, Usage,
};

/// Unified client for every supported provider.
///
/// Cheap to clone; clones share the same runtime state.
#[derive(Clone)]
pub struct LlmClient {
    ctx: Arc<ExecCtx>,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("providers", &self.ctx.adapters.list())
            .finish_non_exhaustive()
    }
}

/// Builder for [`LlmClient`].
pub struct LlmClientBuilder {
    overrides: HashMap<String, ProviderOverrides>,
    env: Arc<dyn EnvSource>,
    event_handler: Option<Arc<dyn EventHandler>>,
    retry: RetryPolicy,
    breaker: BreakerConfig,
    cache: CacheConfig,
    replay_root: std::path::PathBuf,
    local_runner: Option<Arc<dyn LocalRunner>>,
    cancellation: Option<Arc<AtomicBool>>,
    http_timeout: Duration,
}

impl Default for LlmClientBuilder {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            env: Arc::new(ProcessEnv),
            event_handler: None,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            replay_root: std::path::PathBuf::from(".llm-conduit/replay"),
            local_runner: None,
            cancellation: None,
            http_timeout: Duration::from_secs(120),
        }
    }
}

impl LlmClientBuilder {
    /// Static configuration for one provider (beats env vars).
    pub fn provider(mut self, tag: impl Into<String>, overrides: ProviderOverrides) -> Self {
        self.overrides.insert(tag.into(), overrides);
        self
    }

    /// Replace the environment source (tests).
    pub fn env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = env;
        self
    }

    /// Install a telemetry event handler.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Tune the retry policy for non-streaming calls.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Tune the circuit breakers.
    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Tune the hot response cache.
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Root directory of the disk replay store.
    pub fn replay_root(mut self, root: impl Into<std::path::PathBuf>) -> Self {
        self.replay_root = root.into();
        self
    }

    /// Register the in-process runner backing the `local` provider.
    pub fn local_runner(mut self, runner: Arc<dyn LocalRunner>) -> Self {
        self.local_runner = Some(runner);
        self
    }

    /// Cooperative cancellation flag checked at every plug boundary.
    pub fn cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(flag);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<LlmClient> {
        let telemetry = match self.event_handler {
            Some(handler) => Telemetry::with_handler(handler),
            None => Telemetry::disabled(),
        };
        let http = reqwest::Client::builder()
            .timeout(self.http_timeout)
            .build()
            .map_err(LlmError::Request)?;
        let cache_config = self.cache.overridden_from_env(&*self.env);

        Ok(LlmClient {
            ctx: Arc::new(ExecCtx {
                http,
                resolver: ConfigResolver::new(self.overrides, self.env),
                telemetry: telemetry.clone(),
                breakers: Arc::new(BreakerRegistry::new(self.breaker, telemetry.clone())),
                cache: Arc::new(ResponseCache::new(cache_config, telemetry.clone())),
                replay: Arc::new(ReplayStore::new(self.replay_root, telemetry.clone())),
                recovery: Arc::new(RecoveryStore::default()),
                adapters: Arc::new(AdapterRegistry::default()),
                retry: self.retry,
                local_runner: self.local_runner,
                cancellation: self.cancellation,
            }),
        })
    }
}

impl LlmClient {
    /// A new builder.
    pub fn builder() -> LlmClientBuilder {
        LlmClientBuilder::default()
    }

    /// A client with all defaults (process env, no handler).
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Shared runtime context (advanced embedding, tests).
    pub fn ctx(&self) -> &ExecCtx {
        &self.ctx
    }

    /// One-shot chat completion.
    ///
    /// With `options.cache` set, the response cache is consulted first;
    /// concurrent misses on the same fingerprint coalesce onto one upstream
    /// call.
    pub async fn chat(
        &self,
        provider: &str,
        messages: Vec<Message>,
        options: ChatOptions,
    ) -> Result<ChatResponse> {
        let metadata = json!({"provider": provider});
        let ctx = self.ctx.clone();
        let provider = provider.to_string();
        self.ctx
            .telemetry
            .span("chat", metadata, async move {
                if options.cache {
                    let adapter = ctx.adapters.get(&provider).ok_or_else(|| {
                        LlmError::Validation(format!("unknown provider '{provider}'"))
                    })?;
                    let config =
                        ctx.resolver
                            .resolve(&provider, &adapter.defaults(), &options)?;
                    let key = fingerprint(&provider, &config.model, &messages, &options);
                    let cached = ctx
                        .cache
                        .with_cache(&key, None, || async {
                            run_chat(&ctx, &provider, messages, options).await
                        })
                        .await?;
                    return Ok((*cached).clone());
                }
                run_chat(&ctx, &provider, messages, options).await
            })
            .await
    }

    /// Streaming chat completion.
    ///
    /// Returns a [`StreamHandle`] exposing the pull side; a per-chunk
    /// callback set via `options.on_chunk` is invoked as well. With
    /// `options.recovery_id` set (any value), partial chunks are persisted
    /// and the generated id is available on the handle.
    pub async fn stream(
        &self,
        provider: &str,
        messages: Vec<Message>,
        options: ChatOptions,
    ) -> Result<StreamHandle> {
        let options = options.with_stream(true);

        let recovery_id = options.recovery_id.as_ref().map(|_| {
            self.ctx
                .recovery
                .init_recovery(provider, &messages, options.salient())
        });

        let req = Request::chat(provider, messages, options.clone());
        let mut req = standard_pipeline().run(req, &self.ctx).await;
        let Some(chunk_stream) = req.assigns.response_stream.take() else {
            return Err(req
                .halt_error
                .unwrap_or_else(|| LlmError::Other("pipeline produced no stream".into())));
        };
        let model = req.assigns.model.clone();
        let callback = req.config.stream_callback.clone();

        // Consumer side: caller callback plus the handle's pull channel.
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        struct Fanout {
            tx: tokio::sync::mpsc::UnboundedSender<StreamChunk>,
            callback: Option<crate::streaming::ChunkCallback>,
        }
        impl ChunkConsumer for Fanout {
            fn on_chunk(&self, chunk: StreamChunk) {
                if let Some(ref callback) = self.callback {
                    callback(chunk.clone());
                }
                let _ = self.tx.send(chunk);
            }
        }

        let flow = FlowController::start(
            flow_config(&options),
            Arc::new(Fanout { tx, callback }),
        );

        // Producer side: drive decoded chunks into the flow controller,
        // recording each for recovery. Backpressure is advisory; the driver
        // retries after a short pause.
        let driver_flow = flow.clone();
        let driver_ctx = self.ctx.clone();
        let driver_recovery = recovery_id.clone();
        let provider_tag = provider.to_string();
        tokio::spawn(async move {
            let mut stream = chunk_stream;
            let started = std::time::Instant::now();
            let mut delivered: u64 = 0;
            while let Some(item) = stream.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        // Terminal error chunk; partial output stays
                        // available through the recovery store.
                        StreamChunk {
                            finish_reason: Some("error".to_string()),
                            metadata: Some(json!({"error": err.to_string()})),
                            ..StreamChunk::default()
                        }
                    }
                };
                let is_done = chunk.is_done();
                if let Some(ref id) = driver_recovery {
                    driver_ctx.recovery.record_chunk(id, &chunk);
                }
                driver_ctx.telemetry.emit(TelemetryEvent::StreamChunk {
                    provider: provider_tag.clone(),
                    content_len: chunk.content_len(),
                });
                delivered += 1;

                loop {
                    match driver_flow.push_chunk(chunk.clone()).await {
                        Ok(()) => break,
                        Err(LlmError::Backpressure) => {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        Err(_) => return,
                    }
                }
                if is_done {
                    break;
                }
            }
            let _ = driver_flow.complete_stream().await;
            driver_ctx.telemetry.emit(TelemetryEvent::StreamStop {
                provider: provider_tag,
                chunks: delivered,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        });

        Ok(StreamHandle {
            receiver: rx,
            flow,
            recovery_id,
            recovery: self.ctx.recovery.clone(),
            model,
            provider: provider.to_string(),
        })
    }

    /// Embedding vectors for a batch of inputs.
    pub async fn embeddings(
        &self,
        provider: &str,
        inputs: Vec<String>,
        options: ChatOptions,
    ) -> Result<EmbeddingResponse> {
        if !capabilities::supports_endpoint(provider, capabilities::Endpoint::Embeddings) {
            return Err(LlmError::Validation(format!(
                "provider '{provider}' does not serve embeddings"
            )));
        }
        let req = Request::embeddings(provider, inputs, options);
        standard_pipeline()
            .run(req, &self.ctx)
            .await
            .into_embedding_result()
    }

    /// Models a provider currently serves. Dynamic where the provider has a
    /// listing endpoint; the configured default model otherwise.
    pub async fn list_models(&self, provider: &str) -> Result<Vec<ModelInfo>> {
        let adapter = self
            .ctx
            .adapters
            .get(provider)
            .ok_or_else(|| LlmError::Validation(format!("unknown provider '{provider}'")))?;
        let config = self
            .ctx
            .resolver
            .resolve(provider, &adapter.defaults(), &ChatOptions::default())?;

        let Some(url) = adapter.models_url(&config) else {
            return Ok(vec![ModelInfo {
                id: config.model,
                provider: provider.to_string(),
                context_window: None,
            }]);
        };

        let mut headers = Vec::new();
        if let Some(ref key) = config.api_key {
            headers.push(("authorization".to_string(), format!("Bearer {key}")));
        }
        let body =
            http::execute_get(&self.ctx, provider, &url, &headers, config.timeout).await?;
        Ok(adapter.parse_models(&body))
    }

    /// All registered provider tags.
    pub fn list_providers() -> Vec<&'static str> {
        capabilities::list_providers()
    }

    /// Whether a provider supports a feature.
    pub fn supports(provider: &str, feature: Feature) -> bool {
        capabilities::supports_feature(provider, feature)
    }
}

fn flow_config(options: &ChatOptions) -> FlowConfig {
    let defaults = FlowConfig::default();
    FlowConfig {
        buffer_capacity: options.buffer_capacity.unwrap_or(defaults.buffer_capacity),
        backpressure_threshold: options
            .backpressure_threshold
            .unwrap_or(defaults.backpressure_threshold),
        batch: options.batch_config.clone(),
        ..defaults
    }
}

async fn run_chat(
    ctx: &Arc<ExecCtx>,
    provider: &str,
    messages: Vec<Message>,
    options: ChatOptions,
) -> Result<ChatResponse> {
    let req = Request::chat(provider, messages, options);
    standard_pipeline().run(req, ctx).await.into_result()
}

/// The pull side of one live stream.
///
/// Chunks arrive in producer order; the last one has a `finish_reason`.
/// [`finish`](Self::finish) drains the remainder and assembles the collected
/// response.
pub struct StreamHandle {
    receiver: tokio::sync::mpsc::UnboundedReceiver<StreamChunk>,
    flow: Arc<FlowController>,
    recovery_id: Option<String>,
    recovery: Arc<RecoveryStore>,
    model: Option<String>,
    provider: String,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("provider", &self.provider)
            .field("recovery_id", &self.recovery_id)
            .finish_non_exhaustive()
    }
}

impl StreamHandle {
    /// The next chunk, or `None` once the stream is fully delivered.
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        self.receiver.recv().await
    }

    /// The recovery id recording this stream's partial output, if enabled.
    pub fn recovery_id(&self) -> Option<&str> {
        self.recovery_id.as_deref()
    }

    /// Current flow-controller metrics.
    pub fn metrics(&self) -> FlowMetrics {
        self.flow.metrics()
    }

    /// Abruptly cancel delivery, discarding buffered chunks.
    pub fn cancel(&self) {
        self.flow.abort();
    }

    /// Drain the stream and assemble the collected response.
    ///
    /// On a clean finish the recovery log is cleared; on an error marker the
    /// partial output stays recoverable and the error is returned.
    pub async fn finish(mut self) -> Result<ChatResponse> {
        let mut content = String::new();
        let mut finish_reason = None;
        let mut model = self.model.clone();
        while let Some(chunk) = self.recv().await {
            if let Some(ref text) = chunk.content {
                content.push_str(text);
            }
            if chunk.model.is_some() {
                model = chunk.model.clone();
            }
            if let Some(reason) = chunk.finish_reason {
                finish_reason = Some(reason);
                break;
            }
        }

        if finish_reason.as_deref() == Some("error") {
            return Err(LlmError::Protocol(
                "stream ended with an error marker".into(),
            ));
        }
        if let Some(ref id) = self.recovery_id {
            self.recovery.clear_partial_response(id);
        }
        Ok(ChatResponse {
            content,
            model: model.unwrap_or_default(),
            usage: Usage::default(),
            cost: None,
            finish_reason,
            tool_calls: None,
            refusal: None,
            logprobs: None,
            metadata: ResponseMetadata {
                provider: self.provider,
                role: "assistant".to_string(),
                from_cache: false,
                cost_details: None,
                raw_response: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapEnv;
    use crate::providers::mock::MockRunner;
    use parking_lot::Mutex;

    fn client_with(pairs: &[(&str, &str)], runner: Option<Arc<dyn LocalRunner>>) -> LlmClient {
        let mut builder = LlmClient::builder()
            .env(Arc::new(MapEnv::from_pairs(pairs)))
            .retry(RetryPolicy::none());
        if let Some(runner) = runner {
            builder = builder.local_runner(runner);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_chat_with_local_runner() {
        let client = client_with(&[], Some(Arc::new(MockRunner::fixed("Hello there!"))));
        let response = client
            .chat("local", vec![Message::user("Hi")], ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(response.content, "Hello there!");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_chat_unknown_provider() {
        let client = client_with(&[], None);
        let err = client
            .chat("bogus", vec![Message::user("Hi")], ChatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Validation(_)));
    }

    #[tokio::test]
    async fn test_chat_cache_coalesces() {
        let client = client_with(&[], Some(Arc::new(MockRunner::fixed("cached"))));
        let options = ChatOptions::default().with_cache(true);
        let first = client
            .chat("local", vec![Message::user("Hi")], options.clone())
            .await
            .unwrap();
        // MockRunner would answer "cached" again, but the cache serves the
        // stored response without invoking the runner.
        let second = client
            .chat("local", vec![Message::user("Hi")], options)
            .await
            .unwrap();
        assert_eq!(first.content, second.content);
    }

    #[tokio::test]
    async fn test_stream_pull_side() {
        let client = client_with(&[], Some(Arc::new(MockRunner::fixed("a b c"))));
        let mut handle = client
            .stream("local", vec![Message::user("Hi")], ChatOptions::default())
            .await
            .unwrap();

        let mut contents = Vec::new();
        while let Some(chunk) = handle.recv().await {
            if let Some(text) = chunk.content.clone() {
                contents.push(text);
            }
            if chunk.is_done() {
                break;
            }
        }
        assert_eq!(contents.concat(), "a b c");
    }

    #[tokio::test]
    async fn test_stream_finish_collects() {
        let client = client_with(&[], Some(Arc::new(MockRunner::fixed("Hello world"))));
        let handle = client
            .stream("local", vec![Message::user("Hi")], ChatOptions::default())
            .await
            .unwrap();
        let response = handle.finish().await.unwrap();
        assert_eq!(response.content, "Hello world");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.metadata.provider, "local");
    }

    #[tokio::test]
    async fn test_stream_callback_invoked() {
        let client = client_with(&[], Some(Arc::new(MockRunner::fixed("x y"))));
        let seen: Arc<Mutex<Vec<StreamChunk>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let options = ChatOptions::default().with_on_chunk(Arc::new(move |chunk| {
            seen_in.lock().push(chunk);
        }));

        let handle = client
            .stream("local", vec![Message::user("Hi")], options)
            .await
            .unwrap();
        handle.finish().await.unwrap();

        let seen = seen.lock();
        assert!(!seen.is_empty());
        assert!(seen.last().unwrap().is_done());
    }

    #[tokio::test]
    async fn test_stream_recovery_lifecycle() {
        let client = client_with(&[], Some(Arc::new(MockRunner::fixed("r s"))));
        let options = ChatOptions::default().with_recovery_id("enable");
        let handle = client
            .stream("local", vec![Message::user("Hi")], options)
            .await
            .unwrap();
        let id = handle.recovery_id().unwrap().to_string();

        // While live (or just after), the store tracks the stream; after a
        // clean finish it is cleared.
        handle.finish().await.unwrap();
        assert!(client.ctx().recovery.get_partial_response(&id).is_err());
    }

    #[tokio::test]
    async fn test_embeddings_capability_gate() {
        let client = client_with(&[("ANTHROPIC_API_KEY", "k")], None);
        let err = client
            .embeddings("anthropic", vec!["x".into()], ChatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Validation(_)));
    }

    #[tokio::test]
    async fn test_list_models_static_fallback() {
        // Anthropic has no listing endpoint; the configured default model
        // comes back as a single entry.
        let client = client_with(&[("ANTHROPIC_API_KEY", "k")], None);
        let models = client.list_models("anthropic").await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].provider, "anthropic");
    }

    #[test]
    fn test_catalog_queries() {
        assert!(LlmClient::list_providers().contains(&"openai"));
        assert!(LlmClient::supports("openai", Feature::Streaming));
        assert!(!LlmClient::supports("perplexity", Feature::FunctionCalling));
    }
}
