//! Producer/consumer flow control for chunk streams.
//!
//! The [`FlowController`] bridges a fast producer (a provider byte stream
//! being decoded) and a slow consumer (the caller's callback) through a
//! bounded [`StreamBuffer`]: rate-limited pushes, an advisory backpressure
//! signal above a fill threshold, optional batching, and cumulative metrics.
//!
//! One dedicated consumer worker serializes all deliveries, so callback
//! invocations observe chunks in exact push order. Callbacks are treated as
//! untrusted: a panic is caught and counted, never propagated to the
//! producer.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{LlmError, Result};
use crate::streaming::batcher::{BatchConfig, ChunkBatcher};
use crate::streaming::buffer::{OverflowStrategy, PushOutcome, StreamBuffer};
use crate::types::StreamChunk;

/// How long the consumer worker sleeps between polls when idle.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Flow-controller configuration.
#[derive(Clone)]
pub struct FlowConfig {
    /// Buffer capacity in chunks.
    pub buffer_capacity: usize,
    /// Fraction of capacity at which pushes report backpressure.
    pub backpressure_threshold: f64,
    /// Minimum spacing between pushes.
    pub rate_limit: Duration,
    /// Behavior when the buffer is at capacity.
    pub overflow_strategy: OverflowStrategy,
    /// Batch deliveries instead of per-chunk ones.
    pub batch: Option<BatchConfig>,
    /// Upper bound on draining in [`FlowController::complete_stream`].
    pub drain_timeout: Duration,
    /// Periodic metrics callback.
    pub on_metrics: Option<Arc<dyn Fn(&FlowMetrics) + Send + Sync>>,
    /// Interval for `on_metrics`.
    pub metrics_interval: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 100,
            backpressure_threshold: 0.8,
            rate_limit: Duration::from_millis(1),
            overflow_strategy: OverflowStrategy::default(),
            batch: None,
            drain_timeout: Duration::from_secs(10),
            on_metrics: None,
            metrics_interval: Duration::from_secs(1),
        }
    }
}

impl std::fmt::Debug for FlowConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowConfig")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("backpressure_threshold", &self.backpressure_threshold)
            .field("rate_limit", &self.rate_limit)
            .field("overflow_strategy", &self.overflow_strategy)
            .field("batch", &self.batch)
            .field("drain_timeout", &self.drain_timeout)
            .field("has_on_metrics", &self.on_metrics.is_some())
            .finish()
    }
}

/// Receives chunks (or batches) from the consumer worker.
pub trait ChunkConsumer: Send + Sync {
    /// Called once per chunk, in push order.
    fn on_chunk(&self, chunk: StreamChunk);

    /// Called once per batch when batching is configured.
    fn on_batch(&self, batch: Vec<StreamChunk>) {
        for chunk in batch {
            self.on_chunk(chunk);
        }
    }
}

/// A [`ChunkConsumer`] backed by a closure.
pub struct FnConsumer<F: Fn(StreamChunk) + Send + Sync>(pub F);

impl<F: Fn(StreamChunk) + Send + Sync> ChunkConsumer for FnConsumer<F> {
    fn on_chunk(&self, chunk: StreamChunk) {
        (self.0)(chunk);
    }
}

/// Lifecycle of one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Accepting pushes and delivering.
    Running,
    /// No more pushes; the worker is draining the buffer.
    Completing,
    /// Fully drained (or aborted); the worker has exited.
    Completed,
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowMetrics {
    /// Chunks accepted by `push_chunk` (stored or strategy-dropped).
    pub chunks_received: u64,
    /// Chunks handed to the consumer (callback attempted).
    pub chunks_delivered: u64,
    /// Chunks discarded by the overflow strategy.
    pub chunks_dropped: u64,
    /// Text bytes accepted.
    pub bytes_received: u64,
    /// Text bytes delivered.
    pub bytes_delivered: u64,
    /// Pushes rejected above the backpressure threshold.
    pub backpressure_events: u64,
    /// Consumer callback panics caught by the worker.
    pub consumer_errors: u64,
    /// Chunks currently buffered.
    pub current_buffer_size: usize,
    /// High-water mark of the buffer.
    pub max_buffer_size: usize,
    /// Delivered chunks per second since the controller started.
    pub throughput_chunks_per_sec: f64,
    /// Time since the controller started, in milliseconds.
    pub duration_ms: u64,
}

#[derive(Default)]
struct Counters {
    chunks_received: AtomicU64,
    chunks_delivered: AtomicU64,
    chunks_dropped: AtomicU64,
    bytes_received: AtomicU64,
    bytes_delivered: AtomicU64,
    backpressure_events: AtomicU64,
    consumer_errors: AtomicU64,
    max_buffer_size: AtomicUsize,
}

struct FlowState {
    buffer: StreamBuffer,
    status: FlowStatus,
    /// Abrupt cancellation: skip the batcher flush on worker exit.
    discard: bool,
}

struct Shared {
    state: Mutex<FlowState>,
    counters: Counters,
    chunks_available: Notify,
    space_available: Notify,
    worker_done: Notify,
    consumer: Arc<dyn ChunkConsumer>,
    started_at: Instant,
    backpressure_threshold: f64,
    overflow_strategy: OverflowStrategy,
}

impl Shared {
    fn deliver_one(&self, chunk: StreamChunk) {
        let len = chunk.content_len() as u64;
        let outcome = catch_unwind(AssertUnwindSafe(|| self.consumer.on_chunk(chunk)));
        self.counters.chunks_delivered.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_delivered.fetch_add(len, Ordering::Relaxed);
        if outcome.is_err() {
            self.counters.consumer_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("stream consumer callback panicked; continuing delivery");
        }
    }

    fn deliver_batch(&self, batch: Vec<StreamChunk>) {
        let count = batch.len() as u64;
        let len: u64 = batch.iter().map(|c| c.content_len() as u64).sum();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.consumer.on_batch(batch)));
        self.counters
            .chunks_delivered
            .fetch_add(count, Ordering::Relaxed);
        self.counters.bytes_delivered.fetch_add(len, Ordering::Relaxed);
        if outcome.is_err() {
            self.counters.consumer_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("stream consumer callback panicked; continuing delivery");
        }
    }

    fn metrics(&self) -> FlowMetrics {
        let state = self.state.lock();
        let duration = self.started_at.elapsed();
        let delivered = self.counters.chunks_delivered.load(Ordering::Relaxed);
        let secs = duration.as_secs_f64();
        FlowMetrics {
            chunks_received: self.counters.chunks_received.load(Ordering::Relaxed),
            chunks_delivered: delivered,
            chunks_dropped: self.counters.chunks_dropped.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            bytes_delivered: self.counters.bytes_delivered.load(Ordering::Relaxed),
            backpressure_events: self.counters.backpressure_events.load(Ordering::Relaxed),
            consumer_errors: self.counters.consumer_errors.load(Ordering::Relaxed),
            current_buffer_size: state.buffer.len(),
            max_buffer_size: self.counters.max_buffer_size.load(Ordering::Relaxed),
            throughput_chunks_per_sec: if secs > 0.0 {
                delivered as f64 / secs
            } else {
                0.0
            },
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Mediates one stream between a producer and a consumer.
///
/// Created with [`start`](Self::start), which spawns the consumer worker.
/// The producer calls [`push_chunk`](Self::push_chunk); the worker pops and
/// invokes the consumer. [`complete_stream`](Self::complete_stream) is the
/// orderly shutdown, [`abort`](Self::abort) the abrupt one.
pub struct FlowController {
    shared: Arc<Shared>,
    rate_limit: Duration,
    drain_timeout: Duration,
    last_push: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("status", &self.status())
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

impl FlowController {
    /// Start a controller and its consumer worker. Must run inside a tokio
    /// runtime.
    pub fn start(config: FlowConfig, consumer: Arc<dyn ChunkConsumer>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(FlowState {
                buffer: StreamBuffer::new(config.buffer_capacity, config.overflow_strategy),
                status: FlowStatus::Running,
                discard: false,
            }),
            counters: Counters::default(),
            chunks_available: Notify::new(),
            space_available: Notify::new(),
            worker_done: Notify::new(),
            consumer,
            started_at: Instant::now(),
            backpressure_threshold: config.backpressure_threshold,
            overflow_strategy: config.overflow_strategy,
        });

        let batcher = config.batch.clone().map(ChunkBatcher::new);
        tokio::spawn(consumer_worker(shared.clone(), batcher));

        if let Some(on_metrics) = config.on_metrics.clone() {
            tokio::spawn(metrics_ticker(
                shared.clone(),
                on_metrics,
                config.metrics_interval,
            ));
        }

        Arc::new(Self {
            shared,
            rate_limit: config.rate_limit,
            drain_timeout: config.drain_timeout,
            last_push: Mutex::new(None),
        })
    }

    /// Push one chunk toward the consumer.
    ///
    /// Sleeps to honor the rate limit, then either enqueues the chunk or
    /// returns [`LlmError::Backpressure`] when the buffer is at or above the
    /// threshold. Overflow drops (per strategy) are counted and reported as
    /// success. With [`OverflowStrategy::Block`] and a threshold above 1.0,
    /// a full buffer parks the producer until the worker makes room.
    pub async fn push_chunk(&self, chunk: StreamChunk) -> Result<()> {
        let wait = {
            let last = self.last_push.lock();
            last.and_then(|t| self.rate_limit.checked_sub(t.elapsed()))
        };
        if let Some(wait) = wait {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        *self.last_push.lock() = Some(Instant::now());

        let content_len = chunk.content_len() as u64;
        loop {
            let outcome = {
                let mut state = self.shared.state.lock();
                match state.status {
                    FlowStatus::Running => {}
                    FlowStatus::Completing | FlowStatus::Completed => {
                        return Err(LlmError::Other(
                            "cannot push into a completing stream".into(),
                        ));
                    }
                }

                if state.buffer.fill_ratio() >= self.shared.backpressure_threshold {
                    self.shared
                        .counters
                        .backpressure_events
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(LlmError::Backpressure);
                }

                if state.buffer.is_full()
                    && self.shared.overflow_strategy == OverflowStrategy::Block
                {
                    None
                } else {
                    let outcome = state.buffer.push(chunk.clone());
                    let len = state.buffer.len();
                    self.shared
                        .counters
                        .max_buffer_size
                        .fetch_max(len, Ordering::Relaxed);
                    Some(outcome)
                }
            };

            match outcome {
                None => {
                    // Full buffer with Block: wait for the worker to pop.
                    tokio::select! {
                        _ = self.shared.space_available.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                    continue;
                }
                Some(outcome) => {
                    self.shared
                        .counters
                        .chunks_received
                        .fetch_add(1, Ordering::Relaxed);
                    self.shared
                        .counters
                        .bytes_received
                        .fetch_add(content_len, Ordering::Relaxed);
                    if matches!(
                        outcome,
                        PushOutcome::DroppedNewest | PushOutcome::DroppedOldest
                    ) {
                        self.shared
                            .counters
                            .chunks_dropped
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    self.shared.chunks_available.notify_one();
                    return Ok(());
                }
            }
        }
    }

    /// Orderly shutdown: stop accepting pushes, drain every buffered chunk
    /// to the consumer, flush the batcher, and return the final metrics.
    ///
    /// Bounded by `drain_timeout`; a consumer that cannot drain in time
    /// yields [`LlmError::Timeout`].
    pub async fn complete_stream(&self) -> Result<FlowMetrics> {
        {
            let mut state = self.shared.state.lock();
            if state.status == FlowStatus::Completed {
                return Ok(self.shared.metrics());
            }
            state.status = FlowStatus::Completing;
        }
        self.shared.chunks_available.notify_one();

        let deadline = Instant::now() + self.drain_timeout;
        loop {
            if self.status() == FlowStatus::Completed {
                return Ok(self.shared.metrics());
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(LlmError::Timeout(self.drain_timeout))?;
            let _ = tokio::time::timeout(
                remaining.min(Duration::from_millis(20)),
                self.shared.worker_done.notified(),
            )
            .await;
        }
    }

    /// Abrupt cancellation: discard buffered chunks and stop the worker.
    pub fn abort(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.status == FlowStatus::Completed {
                return;
            }
            state.buffer.clear();
            state.discard = true;
            state.status = FlowStatus::Completing;
        }
        self.shared.chunks_available.notify_one();
    }

    /// Current lifecycle status.
    pub fn status(&self) -> FlowStatus {
        self.shared.state.lock().status
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> FlowMetrics {
        self.shared.metrics()
    }
}

async fn consumer_worker(shared: Arc<Shared>, mut batcher: Option<ChunkBatcher>) {
    loop {
        let (popped, draining) = {
            let mut state = shared.state.lock();
            (state.buffer.pop(), state.status != FlowStatus::Running)
        };

        match popped {
            Some(chunk) => {
                shared.space_available.notify_one();
                match batcher.as_mut() {
                    Some(b) => {
                        if let Some(batch) = b.add_chunk(chunk) {
                            shared.deliver_batch(batch);
                        }
                    }
                    None => shared.deliver_one(chunk),
                }
            }
            None if draining => break,
            None => {
                if let Some(batch) = batcher.as_mut().and_then(ChunkBatcher::poll_timeout) {
                    shared.deliver_batch(batch);
                    continue;
                }
                tokio::select! {
                    _ = shared.chunks_available.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        }
    }

    let discard = shared.state.lock().discard;
    if !discard {
        if let Some(batch) = batcher.as_mut().and_then(ChunkBatcher::flush) {
            shared.deliver_batch(batch);
        }
    }
    shared.state.lock().status = FlowStatus::Completed;
    shared.worker_done.notify_waiters();
}

async fn metrics_ticker(
    shared: Arc<Shared>,
    on_metrics: Arc<dyn Fn(&FlowMetrics) + Send + Sync>,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        let snapshot = shared.metrics();
        on_metrics(&snapshot);
        if shared.state.lock().status == FlowStatus::Completed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Consumer recording chunk contents in order.
    struct Recording(Mutex<Vec<StreamChunk>>);

    impl ChunkConsumer for Recording {
        fn on_chunk(&self, chunk: StreamChunk) {
            self.0.lock().push(chunk);
        }
    }

    /// Consumer that blocks on a channel until the test releases it.
    struct Gated {
        gate: Mutex<mpsc::Receiver<()>>,
        seen: AtomicU64,
    }

    impl ChunkConsumer for Gated {
        fn on_chunk(&self, _chunk: StreamChunk) {
            let _ = self.gate.lock().recv();
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn chunk(n: usize) -> StreamChunk {
        StreamChunk::text(format!("c{n}"))
    }

    fn fast_config() -> FlowConfig {
        FlowConfig {
            rate_limit: Duration::ZERO,
            ..FlowConfig::default()
        }
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let consumer = Arc::new(Recording(Mutex::new(Vec::new())));
        let flow = FlowController::start(fast_config(), consumer.clone());

        for n in 0..20 {
            flow.push_chunk(chunk(n)).await.unwrap();
        }
        flow.complete_stream().await.unwrap();

        let seen = consumer.0.lock();
        let contents: Vec<_> = seen
            .iter()
            .map(|c| c.content.clone().unwrap_or_default())
            .collect();
        let expected: Vec<_> = (0..20).map(|n| format!("c{n}")).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn test_metrics_accounting_identity() {
        let consumer = Arc::new(Recording(Mutex::new(Vec::new())));
        let flow = FlowController::start(fast_config(), consumer);

        for n in 0..50 {
            flow.push_chunk(chunk(n)).await.unwrap();
        }
        let metrics = flow.complete_stream().await.unwrap();

        assert_eq!(metrics.chunks_received, 50);
        assert_eq!(
            metrics.chunks_delivered + metrics.chunks_dropped
                + metrics.current_buffer_size as u64,
            50
        );
        assert_eq!(metrics.current_buffer_size, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backpressure_boundary_and_recovery() {
        let (tx, rx) = mpsc::channel();
        let consumer = Arc::new(Gated {
            gate: Mutex::new(rx),
            seen: AtomicU64::new(0),
        });
        let flow = FlowController::start(
            FlowConfig {
                buffer_capacity: 10,
                backpressure_threshold: 0.8,
                rate_limit: Duration::ZERO,
                ..FlowConfig::default()
            },
            consumer.clone(),
        );

        // First chunk is grabbed by the worker, which then blocks in the
        // callback; everything after stays buffered.
        flow.push_chunk(chunk(0)).await.unwrap();
        while consumer.seen.load(Ordering::SeqCst) == 0 && flow.metrics().current_buffer_size > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Buffer fills to 8 of 10 without complaint.
        for n in 1..=8 {
            flow.push_chunk(chunk(n)).await.unwrap();
        }
        // Next push sees fill >= 0.8 and is refused without enqueuing.
        let err = flow.push_chunk(chunk(9)).await.unwrap_err();
        assert!(matches!(err, LlmError::Backpressure));
        assert_eq!(flow.metrics().backpressure_events, 1);
        assert_eq!(flow.metrics().current_buffer_size, 8);

        // Release the consumer; once the buffer drains below the threshold
        // the same push succeeds.
        for _ in 0..20 {
            let _ = tx.send(());
        }
        while flow.metrics().current_buffer_size >= 8 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        flow.push_chunk(chunk(9)).await.unwrap();

        drop(tx);
        flow.complete_stream().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_newest_on_full_buffer_returns_ok() {
        // Threshold above 1.0 disables backpressure so the overflow
        // strategy is what handles the full buffer.
        let (tx, rx) = mpsc::channel();
        let gated = Arc::new(Gated {
            gate: Mutex::new(rx),
            seen: AtomicU64::new(0),
        });
        let flow = FlowController::start(
            FlowConfig {
                buffer_capacity: 2,
                backpressure_threshold: 2.0,
                rate_limit: Duration::ZERO,
                overflow_strategy: OverflowStrategy::DropNewest,
                ..FlowConfig::default()
            },
            gated.clone(),
        );

        flow.push_chunk(chunk(0)).await.unwrap();
        while flow.metrics().current_buffer_size > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        flow.push_chunk(chunk(1)).await.unwrap();
        flow.push_chunk(chunk(2)).await.unwrap();
        // Buffer now full (2); this push is dropped but reported Ok.
        flow.push_chunk(chunk(3)).await.unwrap();
        let metrics = flow.metrics();
        assert_eq!(metrics.chunks_dropped, 1);
        assert_eq!(metrics.current_buffer_size, 2);

        drop(tx);
        let _ = flow.complete_stream().await;
    }

    #[tokio::test]
    async fn test_consumer_panic_is_counted_not_propagated() {
        struct Panicking;
        impl ChunkConsumer for Panicking {
            fn on_chunk(&self, chunk: StreamChunk) {
                if chunk.content.as_deref() == Some("c1") {
                    panic!("bad consumer");
                }
            }
        }

        let flow = FlowController::start(fast_config(), Arc::new(Panicking));
        for n in 0..3 {
            flow.push_chunk(chunk(n)).await.unwrap();
        }
        let metrics = flow.complete_stream().await.unwrap();
        assert_eq!(metrics.consumer_errors, 1);
        assert_eq!(metrics.chunks_delivered, 3);
    }

    #[tokio::test]
    async fn test_batching_delivers_whole_batches() {
        struct BatchRecorder(Mutex<Vec<usize>>);
        impl ChunkConsumer for BatchRecorder {
            fn on_chunk(&self, _chunk: StreamChunk) {
                unreachable!("batched consumer receives batches");
            }
            fn on_batch(&self, batch: Vec<StreamChunk>) {
                self.0.lock().push(batch.len());
            }
        }

        let recorder = Arc::new(BatchRecorder(Mutex::new(Vec::new())));
        let flow = FlowController::start(
            FlowConfig {
                rate_limit: Duration::ZERO,
                batch: Some(BatchConfig {
                    batch_size: 4,
                    batch_timeout: Duration::from_secs(10),
                }),
                ..FlowConfig::default()
            },
            recorder.clone(),
        );

        for n in 0..10 {
            flow.push_chunk(chunk(n)).await.unwrap();
        }
        flow.complete_stream().await.unwrap();

        let sizes = recorder.0.lock().clone();
        // Two full batches plus the flushed remainder.
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        assert!(sizes.len() >= 3);
        assert!(sizes.iter().all(|s| *s <= 4));
    }

    #[tokio::test]
    async fn test_push_after_complete_is_rejected() {
        let flow = FlowController::start(
            fast_config(),
            Arc::new(Recording(Mutex::new(Vec::new()))),
        );
        flow.complete_stream().await.unwrap();
        let err = flow.push_chunk(chunk(0)).await.unwrap_err();
        assert!(matches!(err, LlmError::Other(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_discards_buffered_chunks() {
        let (tx, rx) = mpsc::channel();
        let gated = Arc::new(Gated {
            gate: Mutex::new(rx),
            seen: AtomicU64::new(0),
        });
        let flow = FlowController::start(fast_config(), gated.clone());

        for n in 0..10 {
            flow.push_chunk(chunk(n)).await.unwrap();
        }
        flow.abort();
        drop(tx);

        // The worker exits without delivering the discarded chunks.
        let deadline = Instant::now() + Duration::from_secs(2);
        while flow.status() != FlowStatus::Completed && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(flow.status(), FlowStatus::Completed);
        assert!(flow.metrics().chunks_delivered < 10);
    }

    #[tokio::test]
    async fn test_rate_limit_spaces_pushes() {
        let flow = FlowController::start(
            FlowConfig {
                rate_limit: Duration::from_millis(5),
                ..FlowConfig::default()
            },
            Arc::new(Recording(Mutex::new(Vec::new()))),
        );
        let start = Instant::now();
        for n in 0..4 {
            flow.push_chunk(chunk(n)).await.unwrap();
        }
        // Three inter-push gaps of >= 5 ms each.
        assert!(start.elapsed() >= Duration::from_millis(15));
        flow.complete_stream().await.unwrap();
    }
}
