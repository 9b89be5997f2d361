//! Telemetry spans and lifecycle events.
//!
//! Provides an optional, non-intrusive way to observe the runtime. Components
//! emit events when requests execute, streams produce chunks, caches hit or
//! miss, breakers trip, and retries fire. Users implement [`EventHandler`] to
//! receive them for logging, metrics, or progress UIs; every event is also
//! mirrored to `tracing` at debug level so a subscriber sees the same surface
//! without installing a handler.

use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::error::Result;
use crate::types::ChatResponse;

/// Events emitted during request execution.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A timed span has started (`chat`, `provider.execution`, `http`, ...).
    SpanStart {
        /// Span name.
        name: String,
        /// Wall-clock time at span start.
        system_time: SystemTime,
        /// Caller-supplied metadata.
        metadata: Value,
    },
    /// A timed span finished successfully.
    SpanStop {
        /// Span name.
        name: String,
        /// Elapsed time in milliseconds.
        duration_ms: u64,
        /// Metadata, enriched with usage/cost when the result is recognized.
        metadata: Value,
    },
    /// A timed span failed; the error is re-propagated after this event.
    SpanException {
        /// Span name.
        name: String,
        /// Stable error kind tag.
        kind: String,
        /// Error description.
        reason: String,
        /// Caller-supplied metadata.
        metadata: Value,
    },
    /// A stream began delivering chunks.
    StreamStart {
        /// Provider tag.
        provider: String,
        /// Model id, when resolved.
        model: Option<String>,
    },
    /// A chunk was decoded from the wire.
    StreamChunk {
        /// Provider tag.
        provider: String,
        /// Byte length of the chunk's text.
        content_len: usize,
    },
    /// A stream finished (terminal chunk observed or producer closed).
    StreamStop {
        /// Provider tag.
        provider: String,
        /// Total chunks decoded.
        chunks: u64,
        /// Elapsed time in milliseconds.
        duration_ms: u64,
    },
    /// Hot-cache lookup found a value.
    CacheHit {
        /// Cache fingerprint.
        key: String,
        /// Serialized size of the stored value.
        size_bytes: usize,
    },
    /// Hot-cache lookup found nothing.
    CacheMiss {
        /// Cache fingerprint.
        key: String,
    },
    /// A value was stored in the hot cache.
    CachePut {
        /// Cache fingerprint.
        key: String,
        /// Serialized size of the stored value.
        size_bytes: usize,
    },
    /// Replay-store lookup found a recorded response.
    TestCacheHit {
        /// Request fingerprint.
        key: String,
        /// Serialized size of the recorded response.
        size_bytes: usize,
    },
    /// Replay-store lookup found nothing.
    TestCacheMiss {
        /// Request fingerprint.
        key: String,
    },
    /// A live response was saved to the replay store.
    TestCacheSave {
        /// Request fingerprint.
        key: String,
        /// Serialized size of the saved response.
        size_bytes: usize,
    },
    /// A circuit breaker transitioned to open.
    CircuitOpened {
        /// Breaker scope name.
        name: String,
    },
    /// A circuit breaker recovered to closed.
    CircuitClosed {
        /// Breaker scope name.
        name: String,
    },
    /// A transport retry is about to sleep and re-attempt.
    RetryAttempt {
        /// 1-indexed attempt number.
        attempt: u32,
        /// Delay before this attempt, in milliseconds.
        delay_ms: u64,
        /// Why the previous attempt failed.
        reason: String,
    },
    /// A cost figure was computed for a completed response.
    CostCalculated {
        /// Provider tag.
        provider: String,
        /// Model id.
        model: String,
        /// Cost in USD.
        cost: f64,
    },
}

impl TelemetryEvent {
    /// Short stable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::SpanStart { .. } => "span.start",
            TelemetryEvent::SpanStop { .. } => "span.stop",
            TelemetryEvent::SpanException { .. } => "span.exception",
            TelemetryEvent::StreamStart { .. } => "stream.start",
            TelemetryEvent::StreamChunk { .. } => "stream.chunk",
            TelemetryEvent::StreamStop { .. } => "stream.stop",
            TelemetryEvent::CacheHit { .. } => "cache.hit",
            TelemetryEvent::CacheMiss { .. } => "cache.miss",
            TelemetryEvent::CachePut { .. } => "cache.put",
            TelemetryEvent::TestCacheHit { .. } => "test_cache.hit",
            TelemetryEvent::TestCacheMiss { .. } => "test_cache.miss",
            TelemetryEvent::TestCacheSave { .. } => "test_cache.save",
            TelemetryEvent::CircuitOpened { .. } => "circuit.opened",
            TelemetryEvent::CircuitClosed { .. } => "circuit.closed",
            TelemetryEvent::RetryAttempt { .. } => "retry.attempt",
            TelemetryEvent::CostCalculated { .. } => "cost.calculated",
        }
    }
}

/// Handler for runtime telemetry events.
///
/// Entirely optional; the runtime works without one.
pub trait EventHandler: Send + Sync {
    /// Called once per event, in emission order for a single request.
    fn on_event(&self, event: &TelemetryEvent);
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use llm_conduit::telemetry::{FnEventHandler, TelemetryEvent};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: &TelemetryEvent| {
///     println!("{}", event.name());
/// }));
/// ```
pub struct FnEventHandler<F: Fn(&TelemetryEvent) + Send + Sync>(pub F);

impl<F: Fn(&TelemetryEvent) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: &TelemetryEvent) {
        (self.0)(event);
    }
}

/// Implemented by span result types that can enrich stop metadata.
pub trait SpanOutcome {
    /// Add result-derived fields to the stop event's metadata.
    fn enrich(&self, metadata: &mut Map<String, Value>) {
        let _ = metadata;
    }
}

impl SpanOutcome for ChatResponse {
    fn enrich(&self, metadata: &mut Map<String, Value>) {
        metadata.insert("input_tokens".into(), self.usage.input_tokens.into());
        metadata.insert("output_tokens".into(), self.usage.output_tokens.into());
        metadata.insert("total_tokens".into(), self.usage.total_tokens.into());
        if let Some(cost) = self.cost {
            metadata.insert("cost_cents".into(), (cost * 100.0).into());
        }
    }
}

impl SpanOutcome for Value {}
impl SpanOutcome for () {}
impl SpanOutcome for bytes::Bytes {}

/// Telemetry sink shared by every component of one client.
///
/// Cheap to clone; all clones share the same handler.
#[derive(Clone, Default)]
pub struct Telemetry {
    handler: Option<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Telemetry {
    /// Telemetry with no handler; events still go to `tracing`.
    pub fn disabled() -> Self {
        Self { handler: None }
    }

    /// Telemetry delivering events to the given handler.
    pub fn with_handler(handler: Arc<dyn EventHandler>) -> Self {
        Self {
            handler: Some(handler),
        }
    }

    /// Emit one event to the handler and to `tracing`.
    pub fn emit(&self, event: TelemetryEvent) {
        tracing::debug!(event = event.name(), ?event, "telemetry");
        if let Some(ref h) = self.handler {
            h.on_event(&event);
        }
    }

    /// Run `fut` inside a timed span.
    ///
    /// Emits `SpanStart`, awaits, then `SpanStop` with `duration_ms` on
    /// success (metadata enriched from the result via [`SpanOutcome`]) or
    /// `SpanException` with the error kind on failure. The error propagates
    /// unchanged.
    pub async fn span<T, Fut>(&self, name: &str, metadata: Value, fut: Fut) -> Result<T>
    where
        T: SpanOutcome,
        Fut: Future<Output = Result<T>>,
    {
        self.emit(TelemetryEvent::SpanStart {
            name: name.to_string(),
            system_time: SystemTime::now(),
            metadata: metadata.clone(),
        });
        let started = Instant::now();

        match fut.await {
            Ok(value) => {
                let mut enriched = match metadata {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        if !other.is_null() {
                            map.insert("context".into(), other);
                        }
                        map
                    }
                };
                value.enrich(&mut enriched);
                self.emit(TelemetryEvent::SpanStop {
                    name: name.to_string(),
                    duration_ms: duration_ms_since(started),
                    metadata: Value::Object(enriched),
                });
                Ok(value)
            }
            Err(err) => {
                self.emit(TelemetryEvent::SpanException {
                    name: name.to_string(),
                    kind: err.kind().to_string(),
                    reason: err.to_string(),
                    metadata,
                });
                Err(err)
            }
        }
    }
}

fn duration_ms_since(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Emit an event through an optional telemetry reference. No-op when `None`.
pub(crate) fn emit_opt(telemetry: Option<&Telemetry>, event: TelemetryEvent) {
    if let Some(t) = telemetry {
        t.emit(event);
    }
}
