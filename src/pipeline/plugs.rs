//! The standard plugs: validate, configure, build, execute, parse.
//!
//! Each plug does one unit of the canonical provider flow (§ the standard
//! pipeline in [`standard`](super::standard)). Plugs convert their internal
//! errors with [`Request::halt_with_error`]; none of them panics or returns
//! an error across the plug boundary.

use async_trait::async_trait;
use serde_json::json;

use super::{ExecCtx, Pipeline, Plug, Request, RequestKind, RequestState};
use crate::cache::fingerprint;
use crate::error::{LlmError, Result};
use crate::http::{self, HttpCall};
use crate::providers::local::approximate_tokens;
use crate::providers::ProviderAdapter;
use crate::streaming::{decode_stream, ChunkStream};
use crate::telemetry::TelemetryEvent;
use crate::types::{ChatResponse, ResponseMetadata, StreamChunk, Usage};
use std::sync::Arc;

fn adapter_for(ctx: &ExecCtx, req: &Request) -> Result<Arc<dyn ProviderAdapter>> {
    ctx.adapters
        .get(&req.provider)
        .ok_or_else(|| LlmError::Validation(format!("unknown provider '{}'", req.provider)))
}

/// Rejects unregistered provider tags.
pub struct ValidateProvider;

#[async_trait]
impl Plug for ValidateProvider {
    fn name(&self) -> &'static str {
        "validate_provider"
    }

    async fn call(&self, req: Request, ctx: &ExecCtx) -> Request {
        if !crate::capabilities::is_registered(&req.provider)
            || ctx.adapters.get(&req.provider).is_none()
        {
            let provider = req.provider.clone();
            return req.halt_with_error(
                self.name(),
                LlmError::Validation(format!("unknown provider '{provider}'")),
            );
        }
        req
    }
}

/// Rejects empty conversations and empty message bodies.
pub struct ValidateMessages;

#[async_trait]
impl Plug for ValidateMessages {
    fn name(&self) -> &'static str {
        "validate_messages"
    }

    async fn call(&self, req: Request, _ctx: &ExecCtx) -> Request {
        let problem = match req.kind {
            RequestKind::Chat => {
                if req.messages.is_empty() {
                    Some("messages must not be empty".to_string())
                } else {
                    req.messages
                        .iter()
                        .position(|m| m.content.is_empty())
                        .map(|i| format!("message {i} has empty content"))
                }
            }
            RequestKind::Embeddings => {
                if req.inputs.is_empty() {
                    Some("embedding inputs must not be empty".to_string())
                } else {
                    None
                }
            }
        };
        match problem {
            Some(message) => req.halt_with_error(self.name(), LlmError::Validation(message)),
            None => req,
        }
    }
}

/// Resolves api_key / base_url / model / timeout into `req.config`.
pub struct FetchConfiguration;

#[async_trait]
impl Plug for FetchConfiguration {
    fn name(&self) -> &'static str {
        "fetch_configuration"
    }

    async fn call(&self, mut req: Request, ctx: &ExecCtx) -> Request {
        let resolved = adapter_for(ctx, &req).and_then(|adapter| {
            ctx.resolver
                .resolve(&req.provider, &adapter.defaults(), &req.options)
        });
        match resolved {
            Ok(config) => {
                req.config = config;
                req
            }
            Err(err) => req.halt_with_error(self.name(), err),
        }
    }
}

/// Moves the `on_chunk` callback from options into the resolved config.
pub struct PrepareStreaming;

#[async_trait]
impl Plug for PrepareStreaming {
    fn name(&self) -> &'static str {
        "prepare_streaming"
    }

    async fn call(&self, mut req: Request, _ctx: &ExecCtx) -> Request {
        req.config.stream_callback = req.options.on_chunk.take();
        req
    }
}

/// Runs the provider adapter's body/URL/header builder.
pub struct BuildProviderRequest;

#[async_trait]
impl Plug for BuildProviderRequest {
    fn name(&self) -> &'static str {
        "build_request"
    }

    async fn call(&self, mut req: Request, ctx: &ExecCtx) -> Request {
        let built = adapter_for(ctx, &req).and_then(|adapter| match req.kind {
            RequestKind::Chat => adapter.build_request(&mut req),
            RequestKind::Embeddings => adapter.build_embeddings_request(&mut req),
        });
        match built {
            Ok(()) => req,
            Err(err) => req.halt_with_error(self.name(), err),
        }
    }
}

/// Finalizes the outbound HTTP shape: the URL must exist and a content type
/// must be present. Skipped for local execution.
pub struct BuildHttpClient;

#[async_trait]
impl Plug for BuildHttpClient {
    fn name(&self) -> &'static str {
        "build_http_client"
    }

    async fn call(&self, mut req: Request, _ctx: &ExecCtx) -> Request {
        if req.assigns.request_url.is_none() {
            return req.halt_with_error(
                self.name(),
                LlmError::Other("build_request produced no URL".into()),
            );
        }
        let has_content_type = req
            .assigns
            .request_headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            req.assigns
                .request_headers
                .push(("content-type".to_string(), "application/json".to_string()));
        }
        req
    }
}

/// Adds provider signatures (AWS SigV4) to a built request.
pub struct AuthRequest;

#[async_trait]
impl Plug for AuthRequest {
    fn name(&self) -> &'static str {
        "auth_request"
    }

    async fn call(&self, mut req: Request, ctx: &ExecCtx) -> Request {
        let signed = adapter_for(ctx, &req).and_then(|adapter| {
            if adapter.requires_signing() {
                adapter.sign_request(&mut req)
            } else {
                Ok(())
            }
        });
        match signed {
            Ok(()) => req,
            Err(err) => req.halt_with_error(self.name(), err),
        }
    }
}

/// Non-streaming HTTP execution, with the replay store consulted below the
/// HTTP layer when the replay flag is active.
pub struct ExecuteRequest;

struct FetchParams {
    url: String,
    body: serde_json::Value,
    headers: Vec<(String, String)>,
    provider: String,
    timeout: std::time::Duration,
    key: String,
    replay_enabled: bool,
}

impl ExecuteRequest {
    fn params(req: &Request) -> Result<FetchParams> {
        let url = req
            .assigns
            .request_url
            .as_deref()
            .ok_or_else(|| LlmError::Other("execute without a built request".into()))?
            .to_string();
        let body = req
            .assigns
            .request_body
            .as_ref()
            .ok_or_else(|| LlmError::Other("execute without a request body".into()))?
            .clone();
        Ok(FetchParams {
            url,
            body,
            headers: req.assigns.request_headers.clone(),
            provider: req.provider.clone(),
            timeout: req.config.timeout,
            key: fingerprint(&req.provider, &req.config.model, &req.messages, &req.options),
            replay_enabled: req.config.replay_enabled,
        })
    }

    async fn fetch(params: FetchParams, ctx: &ExecCtx) -> Result<(serde_json::Value, bool)> {
        let FetchParams {
            url,
            body,
            headers,
            provider,
            timeout,
            key,
            replay_enabled,
        } = params;

        if replay_enabled {
            if let Some(recorded) = ctx.replay.lookup(&key) {
                return Ok((recorded, true));
            }
        }

        let response = http::execute_json(
            ctx,
            &HttpCall {
                provider: &provider,
                url: &url,
                body: &body,
                headers: &headers,
                timeout,
            },
        )
        .await?;

        if replay_enabled {
            ctx.replay.save(&key, &response)?;
        }
        Ok((response, false))
    }
}

#[async_trait]
impl Plug for ExecuteRequest {
    fn name(&self) -> &'static str {
        "execute_request"
    }

    async fn call(&self, mut req: Request, ctx: &ExecCtx) -> Request {
        req.state = RequestState::Executing;
        let params = match Self::params(&req) {
            Ok(params) => params,
            Err(err) => return req.halt_with_error(self.name(), err),
        };
        match Self::fetch(params, ctx).await {
            Ok((response, replayed)) => {
                req.assigns.http_response = Some(response);
                req.assigns.replayed = replayed;
                req
            }
            Err(err) => req.halt_with_error(self.name(), err),
        }
    }
}

/// Streaming HTTP execution: starts the producer and stores the raw byte
/// stream for the stream-parse plug.
pub struct ExecuteStreamRequest;

#[async_trait]
impl Plug for ExecuteStreamRequest {
    fn name(&self) -> &'static str {
        "execute_stream_request"
    }

    async fn call(&self, mut req: Request, ctx: &ExecCtx) -> Request {
        req.state = RequestState::Executing;
        let url = match req.assigns.request_url.as_deref() {
            Some(url) => url.to_string(),
            None => {
                return req.halt_with_error(
                    self.name(),
                    LlmError::Other("execute without a built request".into()),
                )
            }
        };
        let Some(body) = req.assigns.request_body.clone() else {
            return req.halt_with_error(
                self.name(),
                LlmError::Other("execute without a request body".into()),
            );
        };

        let stream = http::execute_stream(
            ctx,
            &HttpCall {
                provider: &req.provider,
                url: &url,
                body: &body,
                headers: &req.assigns.request_headers,
                timeout: req.config.timeout,
            },
        )
        .await;

        match stream {
            Ok(bytes) => {
                req.assigns.byte_stream = Some(bytes);
                req
            }
            Err(err) => req.halt_with_error(self.name(), err),
        }
    }
}

/// In-process execution for the `local` provider: drives the registered
/// runner's token iterator, either collected (non-streaming) or as a chunk
/// stream.
pub struct ExecuteLocal;

impl ExecuteLocal {
    fn run(req: &mut Request, ctx: &ExecCtx) -> Result<()> {
        let runner = ctx
            .local_runner
            .as_ref()
            .ok_or_else(|| {
                LlmError::Configuration("no local runner registered on the client".into())
            })?
            .clone();
        let tokens = runner.generate(&req.messages, &req.options)?;
        let model = runner.model_name();
        let input_tokens = approximate_tokens(&req.messages);

        if req.options.stream {
            let chunks: Vec<Result<StreamChunk>> = tokens
                .map(|token| {
                    Ok(StreamChunk {
                        content: Some(token),
                        model: Some(model.clone()),
                        ..StreamChunk::default()
                    })
                })
                .chain(std::iter::once(Ok(StreamChunk::done("stop"))))
                .collect();
            let stream: ChunkStream = Box::pin(futures::stream::iter(chunks));
            req.assigns.response_stream = Some(stream);
            req.assigns.model = Some(model);
            req.state = RequestState::Streaming;
            return Ok(());
        }

        let collected: Vec<String> = tokens.collect();
        let output_tokens = collected.len() as u32;
        let content: String = collected.concat();
        let response = ChatResponse {
            content,
            model: model.clone(),
            usage: Usage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
                ..Usage::default()
            },
            cost: None,
            finish_reason: Some("stop".to_string()),
            tool_calls: None,
            refusal: None,
            logprobs: None,
            metadata: ResponseMetadata {
                provider: "local".to_string(),
                role: "assistant".to_string(),
                from_cache: false,
                cost_details: None,
                raw_response: None,
            },
        };
        req.result = Some(response);
        req.state = RequestState::Completed;
        Ok(())
    }
}

#[async_trait]
impl Plug for ExecuteLocal {
    fn name(&self) -> &'static str {
        "execute_local"
    }

    async fn call(&self, mut req: Request, ctx: &ExecCtx) -> Request {
        req.state = RequestState::Executing;
        match Self::run(&mut req, ctx) {
            Ok(()) => req,
            Err(err) => req.halt_with_error(self.name(), err),
        }
    }
}

/// Wraps the raw byte stream with the provider's decoder, producing the
/// finite chunk stream consumers drain.
pub struct StreamParseResponse;

#[async_trait]
impl Plug for StreamParseResponse {
    fn name(&self) -> &'static str {
        "stream_parse_response"
    }

    async fn call(&self, mut req: Request, ctx: &ExecCtx) -> Request {
        let adapter = match adapter_for(ctx, &req) {
            Ok(adapter) => adapter,
            Err(err) => return req.halt_with_error(self.name(), err),
        };
        let Some(bytes) = req.assigns.byte_stream.take() else {
            return req.halt_with_error(
                self.name(),
                LlmError::Other("stream parse without a byte stream".into()),
            );
        };
        let decoder = adapter.stream_decoder(&req);
        req.assigns.response_stream = Some(decode_stream(bytes, decoder));
        req.state = RequestState::Streaming;
        ctx.telemetry.emit(TelemetryEvent::StreamStart {
            provider: req.provider.clone(),
            model: req.assigns.model.clone(),
        });
        req
    }
}

/// Converts the raw response body into the canonical result and completes
/// the request. Non-streaming only.
pub struct ParseResponse;

#[async_trait]
impl Plug for ParseResponse {
    fn name(&self) -> &'static str {
        "parse_response"
    }

    async fn call(&self, mut req: Request, ctx: &ExecCtx) -> Request {
        let adapter = match adapter_for(ctx, &req) {
            Ok(adapter) => adapter,
            Err(err) => return req.halt_with_error(self.name(), err),
        };
        let Some(body) = req.assigns.http_response.take() else {
            return req.halt_with_error(
                self.name(),
                LlmError::Other("parse without an HTTP response".into()),
            );
        };
        let model = req
            .assigns
            .model
            .clone()
            .unwrap_or_else(|| req.config.model.clone());

        match req.kind {
            RequestKind::Chat => match adapter.parse_response(&body, &model) {
                Ok(mut response) => {
                    response.metadata.from_cache = req.assigns.replayed;
                    req.complete(response)
                }
                Err(err) => req.halt_with_error(self.name(), err),
            },
            RequestKind::Embeddings => {
                match adapter.parse_embeddings_response(&body, &model) {
                    Ok(response) => {
                        req.embedding_result = Some(response);
                        req.state = RequestState::Completed;
                        req
                    }
                    Err(err) => req.halt_with_error(self.name(), err),
                }
            }
        }
    }
}

/// Middleware emitting a `provider.execution` span around an inner pipeline.
pub struct TelemetryMiddleware {
    inner: Pipeline,
}

impl TelemetryMiddleware {
    /// Wrap `inner` in execution-span events.
    pub fn new(inner: Pipeline) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Plug for TelemetryMiddleware {
    fn name(&self) -> &'static str {
        "telemetry_middleware"
    }

    async fn call(&self, req: Request, ctx: &ExecCtx) -> Request {
        let metadata = json!({
            "provider": req.provider,
            "request_id": req.id,
            "stream": req.options.stream,
        });
        ctx.telemetry.emit(TelemetryEvent::SpanStart {
            name: "provider.execution".to_string(),
            system_time: std::time::SystemTime::now(),
            metadata: metadata.clone(),
        });
        let started = std::time::Instant::now();

        let req = self.inner.run(req, ctx).await;

        if req.state == RequestState::Error {
            let failure = req.errors.last();
            ctx.telemetry.emit(TelemetryEvent::SpanException {
                name: "provider.execution".to_string(),
                kind: failure.map_or("exception", |f| f.reason).to_string(),
                reason: failure.map(|f| f.message.clone()).unwrap_or_default(),
                metadata,
            });
        } else {
            let mut enriched = metadata;
            if let Some(ref result) = req.result {
                enriched["input_tokens"] = json!(result.usage.input_tokens);
                enriched["output_tokens"] = json!(result.usage.output_tokens);
                enriched["total_tokens"] = json!(result.usage.total_tokens);
            }
            ctx.telemetry.emit(TelemetryEvent::SpanStop {
                name: "provider.execution".to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                metadata: enriched,
            });
        }
        req
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ChatOptions;
    use futures::StreamExt;
    use crate::pipeline::test_support::ctx_with_env;
    use crate::providers::mock::MockRunner;
    use crate::types::Message;

    fn chat_request(provider: &str) -> Request {
        Request::chat(provider, vec![Message::user("Hello")], ChatOptions::default())
    }

    #[tokio::test]
    async fn test_validate_provider_rejects_unknown() {
        let req = ValidateProvider
            .call(chat_request("made-up"), &ctx_with_env(&[]))
            .await;
        assert!(req.halted);
        assert_eq!(req.errors[0].reason, "validation");
    }

    #[tokio::test]
    async fn test_validate_provider_accepts_known() {
        let req = ValidateProvider
            .call(chat_request("openai"), &ctx_with_env(&[]))
            .await;
        assert!(!req.halted);
    }

    #[tokio::test]
    async fn test_validate_messages_rejects_empty_list_and_content() {
        let ctx = ctx_with_env(&[]);
        let empty = Request::chat("openai", vec![], ChatOptions::default());
        assert!(ValidateMessages.call(empty, &ctx).await.halted);

        let blank = Request::chat("openai", vec![Message::user("")], ChatOptions::default());
        let req = ValidateMessages.call(blank, &ctx).await;
        assert!(req.halted);
        assert!(req.errors[0].message.contains("empty content"));
    }

    #[tokio::test]
    async fn test_fetch_configuration_missing_key_halts_without_io() {
        let ctx = ctx_with_env(&[]);
        let req = FetchConfiguration.call(chat_request("openai"), &ctx).await;
        assert!(req.halted);
        assert_eq!(req.errors[0].reason, "configuration");
    }

    #[tokio::test]
    async fn test_fetch_configuration_resolves() {
        let ctx = ctx_with_env(&[("OPENAI_API_KEY", "sk-x")]);
        let req = FetchConfiguration.call(chat_request("openai"), &ctx).await;
        assert!(!req.halted);
        assert_eq!(req.config.api_key.as_deref(), Some("sk-x"));
        assert_eq!(req.config.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_prepare_streaming_moves_callback() {
        let ctx = ctx_with_env(&[]);
        let callback: crate::streaming::ChunkCallback = Arc::new(|_chunk| {});
        let mut req = chat_request("openai");
        req.options.stream = true;
        req.options.on_chunk = Some(callback);

        let req = PrepareStreaming.call(req, &ctx).await;
        assert!(req.options.on_chunk.is_none());
        assert!(req.config.stream_callback.is_some());
    }

    #[tokio::test]
    async fn test_build_http_client_requires_url() {
        let ctx = ctx_with_env(&[]);
        let req = BuildHttpClient.call(chat_request("openai"), &ctx).await;
        assert!(req.halted);
    }

    #[tokio::test]
    async fn test_build_http_client_adds_content_type() {
        let ctx = ctx_with_env(&[]);
        let mut req = chat_request("openai");
        req.assigns.request_url = Some("https://api.openai.com/v1/chat/completions".into());
        let req = BuildHttpClient.call(req, &ctx).await;
        assert!(req
            .assigns
            .request_headers
            .iter()
            .any(|(k, v)| k == "content-type" && v == "application/json"));
    }

    #[tokio::test]
    async fn test_execute_local_blocking() {
        let mut ctx = ctx_with_env(&[]);
        ctx.local_runner = Some(Arc::new(MockRunner::fixed("Hello from the mock")));
        let mut req = chat_request("local");
        req.config.model = "local".into();

        let req = ExecuteLocal.call(req, &ctx).await;
        assert_eq!(req.state, RequestState::Completed);
        let result = req.result.unwrap();
        assert_eq!(result.content, "Hello from the mock");
        assert_eq!(result.metadata.provider, "local");
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
        assert!(result.usage.output_tokens > 0);
    }

    #[tokio::test]
    async fn test_execute_local_streaming() {
        let mut ctx = ctx_with_env(&[]);
        ctx.local_runner = Some(Arc::new(MockRunner::fixed("a b")));
        let mut req = chat_request("local");
        req.options.stream = true;

        let mut req = ExecuteLocal.call(req, &ctx).await;
        assert_eq!(req.state, RequestState::Streaming);
        let stream = req.assigns.response_stream.take().unwrap();
        let chunks: Vec<StreamChunk> = stream.map(|c| c.unwrap()).collect::<Vec<_>>().await;
        // "a", " ", "b" plus the terminal chunk.
        assert_eq!(chunks.len(), 4);
        assert!(chunks.last().unwrap().is_done());
    }

    #[tokio::test]
    async fn test_execute_local_without_runner_is_configuration_error() {
        let ctx = ctx_with_env(&[]);
        let req = ExecuteLocal.call(chat_request("local"), &ctx).await;
        assert!(req.halted);
        assert_eq!(req.errors[0].reason, "configuration");
    }

    #[tokio::test]
    async fn test_execute_request_replays_recorded_body() {
        let ctx = ctx_with_env(&[("OPENAI_API_KEY", "sk"), ("LLM_CONDUIT_TEST_CACHE", "1")]);
        let mut req = chat_request("openai");
        req.config = ctx
            .resolver
            .resolve(
                "openai",
                &ctx.adapters.get("openai").unwrap().defaults(),
                &req.options,
            )
            .unwrap();
        req.assigns.request_url = Some("https://api.openai.com/v1/chat/completions".into());
        req.assigns.request_body = Some(json!({"model": "gpt-4o-mini"}));

        let key = fingerprint(&req.provider, &req.config.model, &req.messages, &req.options);
        ctx.replay
            .save(&key, &json!({"choices": [{"message": {"content": "replayed"}}]}))
            .unwrap();

        let req = ExecuteRequest.call(req, &ctx).await;
        assert!(!req.halted, "errors: {:?}", req.errors);
        assert!(req.assigns.replayed);
        assert_eq!(
            req.assigns.http_response.unwrap()["choices"][0]["message"]["content"],
            "replayed"
        );
    }

    #[tokio::test]
    async fn test_parse_response_completes_chat() {
        let ctx = ctx_with_env(&[]);
        let mut req = chat_request("openai");
        req.assigns.model = Some("gpt-4".into());
        req.assigns.http_response = Some(json!({
            "model": "gpt-4",
            "choices": [{
                "message": {"role": "assistant", "content": "Hello there!"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5},
        }));

        let req = ParseResponse.call(req, &ctx).await;
        assert_eq!(req.state, RequestState::Completed);
        let result = req.into_result().unwrap();
        assert_eq!(result.content, "Hello there!");
        assert_eq!(result.usage.input_tokens, 10);
    }

    #[tokio::test]
    async fn test_parse_response_marks_replayed_from_cache() {
        let ctx = ctx_with_env(&[]);
        let mut req = chat_request("openai");
        req.assigns.replayed = true;
        req.assigns.http_response = Some(json!({
            "choices": [{"message": {"content": "x"}, "finish_reason": "stop"}],
        }));
        let req = ParseResponse.call(req, &ctx).await;
        assert!(req.result.unwrap().metadata.from_cache);
    }

    #[tokio::test]
    async fn test_telemetry_middleware_span_shapes() {
        use crate::telemetry::{EventHandler, FnEventHandler, Telemetry};
        use parking_lot::Mutex;

        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let events_in = events.clone();
        let handler: Arc<dyn EventHandler> = Arc::new(FnEventHandler(move |event: &_| {
            events_in.lock().push(TelemetryEvent::name(event).to_string());
        }));
        let mut ctx = ctx_with_env(&[]);
        ctx.telemetry = Telemetry::with_handler(handler);

        // A failing inner pipeline produces start + exception.
        let middleware =
            TelemetryMiddleware::new(Pipeline::new("inner").push(Arc::new(ValidateProvider)));
        middleware.call(chat_request("made-up"), &ctx).await;
        assert_eq!(*events.lock(), vec!["span.start", "span.exception"]);

        events.lock().clear();
        let middleware =
            TelemetryMiddleware::new(Pipeline::new("inner").push(Arc::new(ValidateProvider)));
        middleware.call(chat_request("openai"), &ctx).await;
        assert_eq!(*events.lock(), vec!["span.start", "span.stop"]);
    }
}
