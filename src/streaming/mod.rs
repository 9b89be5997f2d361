//! Streaming subsystem: decoders, buffering, flow control, and recovery.
//!
//! Raw provider bytes enter through a [`StreamDecoder`] (SSE, NDJSON, or AWS
//! event-stream), become [`StreamChunk`]s, and are mediated to the consumer
//! by the [`FlowController`](flow::FlowController) under backpressure.
//!
//! ```text
//! bytes_stream ──► StreamDecoder ──► ChunkStream ──► FlowController ──► consumer
//!                 (sse/ndjson/aws)                  (buffer, batcher,
//!                                                    rate limit, metrics)
//! ```

pub mod batcher;
pub mod buffer;
pub mod eventstream;
pub mod flow;
pub mod ndjson;
pub mod recovery;
pub mod sse;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::{LlmError, Result};
use crate::types::StreamChunk;

/// Per-chunk callback installed via request options.
pub type ChunkCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

/// A finite, non-restartable stream of chunks with one terminal chunk.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Raw bytes as they arrive from the transport.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Stateful transformer from raw bytes to chunks.
///
/// Decoders are pure: they carry a residual buffer for incomplete suffixes
/// and yield zero or more complete chunks per input. Malformed payloads are
/// skipped, never fatal; a stream only fails when *no* chunk ever parses.
pub trait StreamDecoder: Send {
    /// Feed raw bytes, returning any chunks completed by them.
    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk>;

    /// Flush the residual buffer after the transport closes.
    fn finish(&mut self) -> Vec<StreamChunk>;
}

/// Drive a byte stream through a decoder, yielding a well-formed chunk stream.
///
/// Guarantees on the output:
/// - exactly one terminal chunk (synthesized with `finish_reason = "stop"`
///   if the transport closes without one), and nothing after it;
/// - a `Protocol` error if the transport closes before any chunk parsed;
/// - transport errors are passed through and end the stream.
pub fn decode_stream(bytes: ByteStream, decoder: Box<dyn StreamDecoder>) -> ChunkStream {
    struct DecodeState {
        inner: ByteStream,
        decoder: Box<dyn StreamDecoder>,
        pending: VecDeque<StreamChunk>,
        emitted_any: bool,
        terminal_sent: bool,
        source_done: bool,
    }

    let state = DecodeState {
        inner: bytes,
        decoder,
        pending: VecDeque::new(),
        emitted_any: false,
        terminal_sent: false,
        source_done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.terminal_sent {
                return None;
            }

            if let Some(chunk) = state.pending.pop_front() {
                state.emitted_any = true;
                if chunk.is_done() {
                    state.terminal_sent = true;
                    state.pending.clear();
                }
                return Some((Ok(chunk), state));
            }

            if state.source_done {
                if !state.emitted_any {
                    state.terminal_sent = true;
                    return Some((
                        Err(LlmError::Protocol(
                            "stream ended before any chunk could be decoded".into(),
                        )),
                        state,
                    ));
                }
                // Transport closed without a terminal marker.
                state.terminal_sent = true;
                return Some((Ok(StreamChunk::done("stop")), state));
            }

            match state.inner.next().await {
                Some(Ok(bytes)) => {
                    let chunks = state.decoder.feed(&bytes);
                    state.pending.extend(chunks);
                }
                Some(Err(err)) => {
                    state.terminal_sent = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.source_done = true;
                    let chunks = state.decoder.finish();
                    state.pending.extend(chunks);
                }
            }
        }
    }))
}
