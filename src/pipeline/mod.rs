//! Request pipeline runtime.
//!
//! A [`Request`] travels through an ordered list of [`Plug`]s. Each plug
//! receives the request, does one unit of work (validate, configure, build,
//! execute, parse), and returns it, possibly halted. Once halted, no
//! further plug runs. Pipelines are plain data ([`Pipeline`] is a list of
//! plugs) and themselves implement [`Plug`], so middleware can hold an inner
//! pipeline and run it between before/after work.
//!
//! Plugs never panic across the boundary: fallible internals convert their
//! errors with [`Request::halt_with_error`], which records the failure and
//! stops the run.

pub mod plugs;
pub mod standard;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::breaker::BreakerRegistry;
use crate::cache::replay::ReplayStore;
use crate::cache::ResponseCache;
use crate::config::{ConfigResolver, ResolvedConfig};
use crate::error::{LlmError, Result};
use crate::options::ChatOptions;
use crate::providers::local::LocalRunner;
use crate::providers::AdapterRegistry;
use crate::retry::RetryPolicy;
use crate::streaming::recovery::RecoveryStore;
use crate::streaming::{ByteStream, ChunkStream};
use crate::telemetry::Telemetry;
use crate::types::{ChatResponse, EmbeddingResponse, Message};

/// What the request is asking the provider for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Chat completion (streaming or not).
    Chat,
    /// Embedding vectors.
    Embeddings,
}

/// Lifecycle of a request, monotonic along
/// `Pending → Executing → (Streaming | Completed | Error)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Executing,
    Streaming,
    Completed,
    Error,
}

/// One recorded plug failure.
#[derive(Debug, Clone)]
pub struct PlugFailure {
    /// Name of the plug that failed.
    pub plug: &'static str,
    /// Stable error-kind tag.
    pub reason: &'static str,
    /// Human-readable description.
    pub message: String,
}

/// Values plugs hand to later plugs.
///
/// Build plugs fill the request side; execute plugs fill the response side.
#[derive(Default)]
pub struct Assigns {
    /// Fully-qualified URL the execute plug will call.
    pub request_url: Option<String>,
    /// Provider-native JSON body.
    pub request_body: Option<Value>,
    /// Headers, including auth (and SigV4 signatures once signed).
    pub request_headers: Vec<(String, String)>,
    /// Model id the body was built for.
    pub model: Option<String>,
    /// Bedrock sub-provider family tag.
    pub provider_type: Option<String>,
    /// AWS region used to build the signed URL.
    pub aws_region: Option<String>,
    /// Parsed JSON body of a non-streaming response.
    pub http_response: Option<Value>,
    /// Whether `http_response` came from the replay store.
    pub replayed: bool,
    /// Raw byte stream of a streaming response.
    pub byte_stream: Option<ByteStream>,
    /// Decoded chunk stream ready for the flow controller.
    pub response_stream: Option<ChunkStream>,
}

impl std::fmt::Debug for Assigns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assigns")
            .field("request_url", &self.request_url)
            .field("model", &self.model)
            .field("provider_type", &self.provider_type)
            .field("has_http_response", &self.http_response.is_some())
            .field("replayed", &self.replayed)
            .field("has_byte_stream", &self.byte_stream.is_some())
            .field("has_response_stream", &self.response_stream.is_some())
            .finish_non_exhaustive()
    }
}

/// The record carried end-to-end through the pipeline.
pub struct Request {
    /// Unique request id.
    pub id: String,
    /// Provider tag.
    pub provider: String,
    /// What is being requested.
    pub kind: RequestKind,
    /// Conversation messages (chat requests).
    pub messages: Vec<Message>,
    /// Embedding inputs (embeddings requests).
    pub inputs: Vec<String>,
    /// Caller-supplied options.
    pub options: ChatOptions,
    /// Configuration resolved by the fetch-configuration plug.
    pub config: ResolvedConfig,
    /// Inter-plug values.
    pub assigns: Assigns,
    /// Lifecycle state.
    pub state: RequestState,
    /// Failures recorded so far.
    pub errors: Vec<PlugFailure>,
    /// Once true, no further plug runs.
    pub halted: bool,
    /// Final chat result.
    pub result: Option<ChatResponse>,
    /// Final embeddings result.
    pub embedding_result: Option<EmbeddingResponse>,
    /// The error that halted the run, for exact propagation to the caller.
    pub halt_error: Option<LlmError>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("halted", &self.halted)
            .field("errors", &self.errors)
            .field("has_result", &self.result.is_some())
            .finish_non_exhaustive()
    }
}

impl Request {
    /// A fresh pending chat request.
    pub fn chat(provider: impl Into<String>, messages: Vec<Message>, options: ChatOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider: provider.into(),
            kind: RequestKind::Chat,
            messages,
            inputs: Vec::new(),
            options,
            config: ResolvedConfig::default(),
            assigns: Assigns::default(),
            state: RequestState::Pending,
            errors: Vec::new(),
            halted: false,
            result: None,
            embedding_result: None,
            halt_error: None,
        }
    }

    /// A fresh pending embeddings request.
    pub fn embeddings(
        provider: impl Into<String>,
        inputs: Vec<String>,
        options: ChatOptions,
    ) -> Self {
        Self {
            kind: RequestKind::Embeddings,
            inputs,
            ..Self::chat(provider, Vec::new(), options)
        }
    }

    /// Record `error` against `plug`, set the error state, and halt.
    ///
    /// The first halting error is kept for exact propagation; later calls
    /// (plugs recording additional context on an already-halted request)
    /// append to `errors` only.
    pub fn halt_with_error(mut self, plug: &'static str, error: LlmError) -> Self {
        self.errors.push(PlugFailure {
            plug,
            reason: error.kind(),
            message: error.to_string(),
        });
        if self.halt_error.is_none() {
            self.halt_error = Some(error);
        }
        self.halted = true;
        self.state = RequestState::Error;
        self
    }

    /// Finish successfully with a chat result.
    pub fn complete(mut self, result: ChatResponse) -> Self {
        self.result = Some(result);
        self.state = RequestState::Completed;
        self
    }

    /// The final outcome: the result on success, the halting error otherwise.
    pub fn into_result(self) -> Result<ChatResponse> {
        match self.result {
            Some(result) => Ok(result),
            None => Err(self
                .halt_error
                .unwrap_or_else(|| LlmError::Other("pipeline produced no result".into()))),
        }
    }

    /// The final embeddings outcome.
    pub fn into_embedding_result(self) -> Result<EmbeddingResponse> {
        match self.embedding_result {
            Some(result) => Ok(result),
            None => Err(self
                .halt_error
                .unwrap_or_else(|| LlmError::Other("pipeline produced no result".into()))),
        }
    }
}

/// Everything a plug needs from the runtime environment.
///
/// Constructed once per client and shared across requests; all registries
/// are process-wide singletons owned here.
pub struct ExecCtx {
    /// Base HTTP client. Per-request deadlines are applied at the call site.
    pub http: reqwest::Client,
    /// Configuration resolution (static overrides + env).
    pub resolver: ConfigResolver,
    /// Telemetry sink.
    pub telemetry: Telemetry,
    /// Circuit breakers, one scope per provider.
    pub breakers: Arc<BreakerRegistry>,
    /// Hot response cache.
    pub cache: Arc<ResponseCache>,
    /// Cold replay store.
    pub replay: Arc<ReplayStore>,
    /// Partial-stream recovery store.
    pub recovery: Arc<RecoveryStore>,
    /// Provider adapters.
    pub adapters: Arc<AdapterRegistry>,
    /// Retry policy for non-streaming calls.
    pub retry: RetryPolicy,
    /// In-process model runner for the `local` provider.
    pub local_runner: Option<Arc<dyn LocalRunner>>,
    /// Cooperative cancellation flag.
    pub cancellation: Option<Arc<AtomicBool>>,
}

impl ExecCtx {
    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Error if cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        Ok(())
    }
}

/// A composable pipeline stage.
///
/// Object-safe so pipelines can be stored as `Vec<Arc<dyn Plug>>` and
/// nested without generic constraints.
#[async_trait]
pub trait Plug: Send + Sync {
    /// Stable name, used in failure records and logs.
    fn name(&self) -> &'static str;

    /// Process the request. Implementations convert internal errors with
    /// [`Request::halt_with_error`] rather than returning them.
    async fn call(&self, req: Request, ctx: &ExecCtx) -> Request;
}

/// An ordered list of plugs. Pure data: building and running are separate.
pub struct Pipeline {
    name: &'static str,
    plugs: Vec<Arc<dyn Plug>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field(
                "plugs",
                &self.plugs.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Pipeline {
    /// An empty pipeline.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            plugs: Vec::new(),
        }
    }

    /// Append a plug (builder style).
    pub fn push(mut self, plug: Arc<dyn Plug>) -> Self {
        self.plugs.push(plug);
        self
    }

    /// The plug names, in order (introspection and tests).
    pub fn plug_names(&self) -> Vec<&'static str> {
        self.plugs.iter().map(|p| p.name()).collect()
    }

    /// Run the request through every plug, skipping the rest once halted.
    pub async fn run(&self, mut req: Request, ctx: &ExecCtx) -> Request {
        for plug in &self.plugs {
            if req.halted {
                break;
            }
            if ctx.is_cancelled() {
                return req.halt_with_error(self.name, LlmError::Cancelled);
            }
            tracing::trace!(pipeline = self.name, plug = plug.name(), "running plug");
            req = plug.call(req, ctx).await;
        }
        req
    }
}

#[async_trait]
impl Plug for Pipeline {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn call(&self, req: Request, ctx: &ExecCtx) -> Request {
        self.run(req, ctx).await
    }
}

/// Runs one of two plugs depending on a predicate over the request.
///
/// This is how the streaming/non-streaming branch is chosen at runtime.
pub struct ConditionalPlug {
    name: &'static str,
    predicate: Box<dyn Fn(&Request) -> bool + Send + Sync>,
    on_true: Arc<dyn Plug>,
    on_false: Option<Arc<dyn Plug>>,
}

impl ConditionalPlug {
    /// Run `on_true` when the predicate holds, otherwise pass through.
    pub fn when(
        name: &'static str,
        predicate: impl Fn(&Request) -> bool + Send + Sync + 'static,
        on_true: Arc<dyn Plug>,
    ) -> Self {
        Self {
            name,
            predicate: Box::new(predicate),
            on_true,
            on_false: None,
        }
    }

    /// Run `on_true` or `on_false` depending on the predicate.
    pub fn branch(
        name: &'static str,
        predicate: impl Fn(&Request) -> bool + Send + Sync + 'static,
        on_true: Arc<dyn Plug>,
        on_false: Arc<dyn Plug>,
    ) -> Self {
        Self {
            name,
            predicate: Box::new(predicate),
            on_true,
            on_false: Some(on_false),
        }
    }
}

#[async_trait]
impl Plug for ConditionalPlug {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn call(&self, req: Request, ctx: &ExecCtx) -> Request {
        if (self.predicate)(&req) {
            self.on_true.call(req, ctx).await
        } else if let Some(ref on_false) = self.on_false {
            on_false.call(req, ctx).await
        } else {
            req
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::config::MapEnv;
    use std::collections::HashMap;

    /// An [`ExecCtx`] wired to a fixed env map and disabled telemetry.
    pub fn ctx_with_env(pairs: &[(&str, &str)]) -> ExecCtx {
        let telemetry = Telemetry::disabled();
        ExecCtx {
            http: reqwest::Client::new(),
            resolver: ConfigResolver::new(
                HashMap::new(),
                Arc::new(MapEnv::from_pairs(pairs)),
            ),
            telemetry: telemetry.clone(),
            breakers: Arc::new(BreakerRegistry::default()),
            cache: Arc::new(ResponseCache::new(CacheConfig::default(), telemetry.clone())),
            replay: Arc::new(ReplayStore::new(
                std::env::temp_dir().join("llm-conduit-replay-tests"),
                telemetry.clone(),
            )),
            recovery: Arc::new(RecoveryStore::default()),
            adapters: Arc::new(AdapterRegistry::default()),
            retry: RetryPolicy::none(),
            local_runner: None,
            cancellation: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ctx_with_env;
    use super::*;

    /// Plug that appends its tag to the request's first message.
    struct Tag(&'static str);

    #[async_trait]
    impl Plug for Tag {
        fn name(&self) -> &'static str {
            "tag"
        }
        async fn call(&self, mut req: Request, _ctx: &ExecCtx) -> Request {
            req.messages.push(Message::system(self.0));
            req
        }
    }

    /// Plug that halts with a validation error.
    struct Fail;

    #[async_trait]
    impl Plug for Fail {
        fn name(&self) -> &'static str {
            "fail"
        }
        async fn call(&self, req: Request, _ctx: &ExecCtx) -> Request {
            req.halt_with_error("fail", LlmError::Validation("boom".into()))
        }
    }

    fn request() -> Request {
        Request::chat("openai", vec![Message::user("hi")], ChatOptions::default())
    }

    #[tokio::test]
    async fn test_plugs_run_in_order() {
        let pipeline = Pipeline::new("test")
            .push(Arc::new(Tag("a")))
            .push(Arc::new(Tag("b")));
        let req = pipeline.run(request(), &ctx_with_env(&[])).await;
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[1].content.as_text(), "a");
        assert_eq!(req.messages[2].content.as_text(), "b");
        assert!(!req.halted);
    }

    #[tokio::test]
    async fn test_halt_skips_remaining_plugs() {
        let pipeline = Pipeline::new("test")
            .push(Arc::new(Tag("before")))
            .push(Arc::new(Fail))
            .push(Arc::new(Tag("after")));
        let req = pipeline.run(request(), &ctx_with_env(&[])).await;

        assert!(req.halted);
        assert_eq!(req.state, RequestState::Error);
        assert_eq!(req.errors.len(), 1);
        assert_eq!(req.errors[0].plug, "fail");
        assert_eq!(req.errors[0].reason, "validation");
        // The plug after the failure never ran.
        assert_eq!(req.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_halted_implies_errors_nonempty() {
        let pipeline = Pipeline::new("test").push(Arc::new(Fail));
        let req = pipeline.run(request(), &ctx_with_env(&[])).await;
        assert!(req.halted);
        assert!(!req.errors.is_empty());
    }

    #[tokio::test]
    async fn test_into_result_propagates_exact_error() {
        let pipeline = Pipeline::new("test").push(Arc::new(Fail));
        let req = pipeline.run(request(), &ctx_with_env(&[])).await;
        match req.into_result() {
            Err(LlmError::Validation(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nested_pipeline_is_a_plug() {
        let inner = Pipeline::new("inner").push(Arc::new(Tag("nested")));
        let outer = Pipeline::new("outer").push(Arc::new(inner));
        let req = outer.run(request(), &ctx_with_env(&[])).await;
        assert_eq!(req.messages[1].content.as_text(), "nested");
    }

    #[tokio::test]
    async fn test_conditional_plug_branches() {
        let streaming_branch = ConditionalPlug::branch(
            "select",
            |req: &Request| req.options.stream,
            Arc::new(Tag("streaming")),
            Arc::new(Tag("blocking")),
        );
        let pipeline = Pipeline::new("test").push(Arc::new(streaming_branch));

        let plain = pipeline.run(request(), &ctx_with_env(&[])).await;
        assert_eq!(plain.messages[1].content.as_text(), "blocking");

        let streaming_req = Request::chat(
            "openai",
            vec![Message::user("hi")],
            ChatOptions::default().with_stream(true),
        );
        let streamed = pipeline.run(streaming_req, &ctx_with_env(&[])).await;
        assert_eq!(streamed.messages[1].content.as_text(), "streaming");
    }

    #[tokio::test]
    async fn test_conditional_when_passes_through() {
        let conditional =
            ConditionalPlug::when("maybe", |_req: &Request| false, Arc::new(Tag("never")));
        let pipeline = Pipeline::new("test").push(Arc::new(conditional));
        let req = pipeline.run(request(), &ctx_with_env(&[])).await;
        assert_eq!(req.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_halts_between_plugs() {
        let cancel = Arc::new(AtomicBool::new(true));
        let mut ctx = ctx_with_env(&[]);
        ctx.cancellation = Some(cancel);

        let pipeline = Pipeline::new("test").push(Arc::new(Tag("a")));
        let req = pipeline.run(request(), &ctx).await;
        assert!(req.halted);
        assert!(matches!(req.halt_error, Some(LlmError::Cancelled)));
    }

    #[test]
    fn test_request_ids_unique() {
        assert_ne!(request().id, request().id);
    }

    #[test]
    fn test_halt_keeps_first_error() {
        let req = request()
            .halt_with_error("one", LlmError::Validation("first".into()))
            .halt_with_error("two", LlmError::Other("second".into()));
        assert_eq!(req.errors.len(), 2);
        assert!(matches!(req.halt_error, Some(LlmError::Validation(_))));
    }

    #[test]
    fn test_pipeline_introspection() {
        let pipeline = Pipeline::new("test")
            .push(Arc::new(Tag("a")))
            .push(Arc::new(Fail));
        assert_eq!(pipeline.plug_names(), vec!["tag", "fail"]);
    }
}
