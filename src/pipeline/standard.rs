//! The canonical provider pipeline.
//!
//! Composes the standard plug order, with the runtime branches expressed as
//! [`ConditionalPlug`]s:
//!
//! 1. validate provider → 2. validate messages → 3. fetch configuration →
//! 4. prepare streaming (when streaming) → 5. provider build-request →
//! 6. build HTTP client (skipped for local) → 7. auth/signing →
//! 8. execute (local | stream | blocking) →
//! 9. stream-parse (streaming) | 10. parse (blocking),
//! all wrapped in the telemetry middleware.

use std::sync::Arc;

use super::plugs::{
    AuthRequest, BuildHttpClient, BuildProviderRequest, ExecuteLocal, ExecuteRequest,
    ExecuteStreamRequest, FetchConfiguration, ParseResponse, PrepareStreaming,
    StreamParseResponse, TelemetryMiddleware, ValidateMessages, ValidateProvider,
};
use super::{ConditionalPlug, Pipeline, Request};

fn is_local(req: &Request) -> bool {
    req.provider == "local"
}

fn is_streaming(req: &Request) -> bool {
    req.options.stream
}

/// Build the standard pipeline for one request.
pub fn standard_pipeline() -> Pipeline {
    let execute = ConditionalPlug::branch(
        "select_execute",
        is_local,
        Arc::new(ExecuteLocal),
        Arc::new(ConditionalPlug::branch(
            "select_http_execute",
            is_streaming,
            Arc::new(ExecuteStreamRequest),
            Arc::new(ExecuteRequest),
        )),
    );

    let inner = Pipeline::new("provider")
        .push(Arc::new(ValidateProvider))
        .push(Arc::new(ValidateMessages))
        .push(Arc::new(FetchConfiguration))
        .push(Arc::new(ConditionalPlug::when(
            "prepare_streaming_if_enabled",
            is_streaming,
            Arc::new(PrepareStreaming),
        )))
        .push(Arc::new(BuildProviderRequest))
        .push(Arc::new(ConditionalPlug::when(
            "build_http_client_unless_local",
            |req: &Request| !is_local(req),
            Arc::new(BuildHttpClient),
        )))
        .push(Arc::new(AuthRequest))
        .push(Arc::new(execute))
        .push(Arc::new(ConditionalPlug::when(
            "stream_parse_if_streaming",
            |req: &Request| is_streaming(req) && !is_local(req),
            Arc::new(StreamParseResponse),
        )))
        .push(Arc::new(ConditionalPlug::when(
            "parse_unless_streaming",
            |req: &Request| !is_streaming(req) && !is_local(req),
            Arc::new(ParseResponse),
        )));

    Pipeline::new("standard").push(Arc::new(TelemetryMiddleware::new(inner)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ChatOptions;
    use crate::pipeline::test_support::ctx_with_env;
    use crate::pipeline::RequestState;
    use crate::providers::mock::MockRunner;
    use crate::types::Message;

    #[test]
    fn test_standard_pipeline_shape() {
        let pipeline = standard_pipeline();
        assert_eq!(pipeline.plug_names(), vec!["telemetry_middleware"]);
    }

    #[tokio::test]
    async fn test_validation_failure_halts_before_any_io() {
        let pipeline = standard_pipeline();
        let req = Request::chat("openai", vec![], ChatOptions::default());
        let req = pipeline.run(req, &ctx_with_env(&[])).await;
        assert_eq!(req.state, RequestState::Error);
        assert_eq!(req.errors[0].plug, "validate_messages");
    }

    #[tokio::test]
    async fn test_local_chat_end_to_end() {
        let mut ctx = ctx_with_env(&[]);
        ctx.local_runner = Some(Arc::new(MockRunner::fixed("Hello there!")));
        let pipeline = standard_pipeline();

        let req = Request::chat("local", vec![Message::user("Hi")], ChatOptions::default());
        let req = pipeline.run(req, &ctx).await;
        assert_eq!(req.state, RequestState::Completed);
        assert_eq!(req.into_result().unwrap().content, "Hello there!");
    }

    #[tokio::test]
    async fn test_local_streaming_end_to_end() {
        use futures::StreamExt;

        let mut ctx = ctx_with_env(&[]);
        ctx.local_runner = Some(Arc::new(MockRunner::fixed("a b c")));
        let pipeline = standard_pipeline();

        let req = Request::chat(
            "local",
            vec![Message::user("Hi")],
            ChatOptions::default().with_stream(true),
        );
        let mut req = pipeline.run(req, &ctx).await;
        assert_eq!(req.state, RequestState::Streaming);
        let stream = req.assigns.response_stream.take().unwrap();
        let chunks: Vec<_> = stream.map(|c| c.unwrap()).collect::<Vec<_>>().await;
        let text: String = chunks
            .iter()
            .filter_map(|c| c.content.as_deref())
            .collect();
        assert_eq!(text, "a b c");
        assert!(chunks.last().unwrap().is_done());
    }

    #[tokio::test]
    async fn test_replayed_chat_end_to_end() {
        // A canonical OpenAI body recorded in the replay store, resolved
        // and parsed through the full pipeline without any network.
        let ctx = ctx_with_env(&[("OPENAI_API_KEY", "sk"), ("LLM_CONDUIT_TEST_CACHE", "1")]);
        let options = ChatOptions::default()
            .with_model("gpt-4")
            .with_temperature(0.5)
            .with_max_tokens(100);
        let messages = vec![Message::user("Hello")];

        let key = crate::cache::fingerprint("openai", "gpt-4", &messages, &options);
        ctx.replay
            .save(
                &key,
                &serde_json::json!({
                    "model": "gpt-4",
                    "choices": [{
                        "message": {"role": "assistant", "content": "Hello there!"},
                        "finish_reason": "stop",
                    }],
                    "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
                }),
            )
            .unwrap();

        let req = Request::chat("openai", messages, options);
        let req = standard_pipeline().run(req, &ctx).await;
        assert_eq!(req.state, RequestState::Completed, "errors: {:?}", req.errors);
        let result = req.into_result().unwrap();
        assert_eq!(result.content, "Hello there!");
        assert_eq!(result.usage.input_tokens, 10);
        assert_eq!(result.usage.output_tokens, 5);
        assert_eq!(result.model, "gpt-4");
        assert_eq!(result.metadata.provider, "openai");
        assert!(result.metadata.from_cache);

        ctx.replay.remove(&key);
    }

    #[tokio::test]
    async fn test_missing_api_key_halts_in_configuration() {
        let pipeline = standard_pipeline();
        let req = Request::chat("openai", vec![Message::user("Hi")], ChatOptions::default());
        let req = pipeline.run(req, &ctx_with_env(&[])).await;
        assert_eq!(req.state, RequestState::Error);
        assert_eq!(req.errors[0].plug, "fetch_configuration");
        assert_eq!(req.errors[0].reason, "configuration");
    }

    #[tokio::test]
    async fn test_state_is_terminal_after_run() {
        let mut ctx = ctx_with_env(&[]);
        ctx.local_runner = Some(Arc::new(MockRunner::fixed("ok")));
        for (provider, expect_error) in [("local", false), ("nope", true)] {
            let req = Request::chat(provider, vec![Message::user("Hi")], ChatOptions::default());
            let req = standard_pipeline().run(req, &ctx).await;
            let terminal = matches!(
                req.state,
                RequestState::Completed | RequestState::Streaming | RequestState::Error
            );
            assert!(terminal, "non-terminal state {:?}", req.state);
            assert_eq!(req.halted, expect_error);
            if req.halted {
                assert!(!req.errors.is_empty());
            }
        }
    }
}
