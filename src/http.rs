//! HTTP execution with the full resilience stack.
//!
//! One call site composes, outermost first: telemetry span → circuit
//! breaker → retry → per-request deadline → reqwest send. Non-streaming
//! calls decode JSON; streaming calls return the raw byte stream untouched
//! so chunked bodies reach the protocol decoder intact (and never retry;
//! a restarted stream would replay tokens).

use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};

use crate::breaker;
use crate::error::{LlmError, Result};
use crate::pipeline::ExecCtx;
use crate::retry::with_retry;
use crate::streaming::ByteStream;
use crate::telemetry::TelemetryEvent;

/// One outbound request, assembled by the build plugs.
pub struct HttpCall<'a> {
    /// Provider tag (breaker scope, telemetry metadata).
    pub provider: &'a str,
    /// Fully-qualified URL.
    pub url: &'a str,
    /// JSON body.
    pub body: &'a Value,
    /// Headers, including auth.
    pub headers: &'a [(String, String)],
    /// Per-request deadline.
    pub timeout: Duration,
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Serialize the body once so signed payloads match the bytes on the wire.
fn request_parts(call: &HttpCall<'_>) -> Result<(Vec<u8>, bool)> {
    let payload = serde_json::to_vec(call.body)?;
    let has_content_type = call
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
    Ok((payload, has_content_type))
}

async fn send_once(ctx: &ExecCtx, call: &HttpCall<'_>) -> Result<reqwest::Response> {
    let (payload, has_content_type) = request_parts(call)?;
    let mut request = ctx.http.post(call.url).body(payload);
    if !has_content_type {
        request = request.header("content-type", "application/json");
    }
    for (name, value) in call.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    tracing::debug!(provider = call.provider, url = call.url, "http request");
    let response = tokio::time::timeout(call.timeout, request.send())
        .await
        .map_err(|_| LlmError::Timeout(call.timeout))??;
    tracing::debug!(
        provider = call.provider,
        status = response.status().as_u16(),
        "http response"
    );

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Http {
            status: status.as_u16(),
            body,
            retry_after,
        });
    }
    Ok(response)
}

/// Execute a non-streaming call and decode the JSON body.
pub async fn execute_json(ctx: &ExecCtx, call: &HttpCall<'_>) -> Result<Value> {
    let metadata = json!({
        "provider": call.provider,
        "method": "POST",
        "url": call.url,
    });
    let cancel = ctx.cancellation.clone();
    ctx.telemetry
        .span("http", metadata, async {
            ctx.breakers.check(call.provider)?;
            let result = with_retry(
                &ctx.retry,
                Some(&ctx.telemetry),
                cancel.as_deref(),
                || async {
                    let response = send_once(ctx, call).await?;
                    let body = tokio::time::timeout(call.timeout, response.json::<Value>())
                        .await
                        .map_err(|_| LlmError::Timeout(call.timeout))??;
                    Ok(body)
                },
            )
            .await;
            ctx.breakers.record(call.provider, breaker::classify(&result));
            result
        })
        .await
}

/// Execute a GET (model listing) with the same breaker/retry stack.
pub async fn execute_get(
    ctx: &ExecCtx,
    provider: &str,
    url: &str,
    headers: &[(String, String)],
    timeout: Duration,
) -> Result<Value> {
    let metadata = json!({"provider": provider, "method": "GET", "url": url});
    let cancel = ctx.cancellation.clone();
    ctx.telemetry
        .span("http", metadata, async {
            ctx.breakers.check(provider)?;
            let result = with_retry(
                &ctx.retry,
                Some(&ctx.telemetry),
                cancel.as_deref(),
                || async {
                    let mut request = ctx.http.get(url);
                    for (name, value) in headers {
                        request = request.header(name.as_str(), value.as_str());
                    }
                    let response = tokio::time::timeout(timeout, request.send())
                        .await
                        .map_err(|_| LlmError::Timeout(timeout))??;
                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(LlmError::Http {
                            status: status.as_u16(),
                            body,
                            retry_after: None,
                        });
                    }
                    let body = tokio::time::timeout(timeout, response.json::<Value>())
                        .await
                        .map_err(|_| LlmError::Timeout(timeout))??;
                    Ok(body)
                },
            )
            .await;
            ctx.breakers.record(provider, breaker::classify(&result));
            result
        })
        .await
}

/// Execute a streaming call and hand back the raw byte stream.
///
/// No retry: the deadline covers connection establishment and response
/// headers only, and the body flows through untouched.
pub async fn execute_stream(ctx: &ExecCtx, call: &HttpCall<'_>) -> Result<ByteStream> {
    ctx.telemetry.emit(TelemetryEvent::SpanStart {
        name: "http".to_string(),
        system_time: std::time::SystemTime::now(),
        metadata: json!({"provider": call.provider, "url": call.url, "stream": true}),
    });
    let started = std::time::Instant::now();

    ctx.breakers.check(call.provider)?;
    let result = send_once(ctx, call).await;
    ctx.breakers.record(call.provider, breaker::classify(&result));

    match result {
        Ok(response) => {
            ctx.telemetry.emit(TelemetryEvent::SpanStop {
                name: "http".to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                metadata: json!({"provider": call.provider, "stream": true}),
            });
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(LlmError::from));
            Ok(Box::pin(stream))
        }
        Err(err) => {
            ctx.telemetry.emit(TelemetryEvent::SpanException {
                name: "http".to_string(),
                kind: err.kind().to_string(),
                reason: err.to_string(),
                metadata: json!({"provider": call.provider, "stream": true}),
            });
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::Outcome;
    use crate::pipeline::test_support::ctx_with_env;

    fn call<'a>(url: &'a str, body: &'a Value) -> HttpCall<'a> {
        HttpCall {
            provider: "openai",
            url,
            body,
            headers: &[],
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct"), None);
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits_without_io() {
        let ctx = ctx_with_env(&[]);
        for _ in 0..5 {
            ctx.breakers.record("openai", Outcome::Failure);
        }
        // The URL is unroutable; reaching it would be a transport error,
        // so a CircuitOpen result proves no I/O was attempted.
        let body = json!({});
        let err = execute_json(&ctx, &call("http://127.0.0.1:1/v1/chat", &body))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_transport_error_reported_and_recorded() {
        let ctx = ctx_with_env(&[]);
        let body = json!({});
        // Nothing listens on port 9 (discard); the connection is refused.
        let err = execute_json(&ctx, &call("http://127.0.0.1:9/v1/chat", &body))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Request(_) | LlmError::Timeout(_)));
        assert!(ctx.breakers.consecutive_failures("openai") >= 1);
    }

    #[tokio::test]
    async fn test_stream_respects_breaker() {
        let ctx = ctx_with_env(&[]);
        for _ in 0..5 {
            ctx.breakers.record("openai", Outcome::Failure);
        }
        let body = json!({});
        let err = match execute_stream(&ctx, &call("http://127.0.0.1:1/v1/chat", &body)).await {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(matches!(err, LlmError::CircuitOpen { .. }));
    }

    #[test]
    fn test_request_parts_respects_existing_content_type() {
        let body = json!({"a": 1});
        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        let call = HttpCall {
            provider: "bedrock",
            url: "https://example.com",
            body: &body,
            headers: &headers,
            timeout: Duration::from_secs(1),
        };
        let (payload, has_content_type) = request_parts(&call).unwrap();
        assert!(has_content_type);
        assert_eq!(payload, serde_json::to_vec(&body).unwrap());
    }
}
