//! Size- and time-triggered batching of stream chunks.
//!
//! When the consumer prefers fewer, larger deliveries (e.g. a UI repainting
//! per frame), the flow controller routes chunks through a [`ChunkBatcher`]:
//! a batch flushes when it reaches `batch_size` chunks or when
//! `batch_timeout` has elapsed since the batch's first chunk.

use std::time::{Duration, Instant};

use crate::types::StreamChunk;

/// Batching parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Flush when this many chunks are pending.
    pub batch_size: usize,
    /// Flush when this much time has passed since the first pending chunk.
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout: Duration::from_millis(50),
        }
    }
}

/// Accumulates chunks and releases them in batches.
#[derive(Debug)]
pub struct ChunkBatcher {
    config: BatchConfig,
    pending: Vec<StreamChunk>,
    first_at: Option<Instant>,
}

impl ChunkBatcher {
    /// Batcher with the given configuration (`batch_size` minimum 1).
    pub fn new(config: BatchConfig) -> Self {
        let config = BatchConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        Self {
            config,
            pending: Vec::new(),
            first_at: None,
        }
    }

    /// Add a chunk. Returns a ready batch when the size or time trigger fires.
    pub fn add_chunk(&mut self, chunk: StreamChunk) -> Option<Vec<StreamChunk>> {
        if self.pending.is_empty() {
            self.first_at = Some(Instant::now());
        }
        self.pending.push(chunk);

        if self.pending.len() >= self.config.batch_size || self.timed_out() {
            return self.take_batch();
        }
        None
    }

    /// Flush the pending batch if its timeout has elapsed.
    ///
    /// Called by the flow controller's consumer worker between deliveries so
    /// time-triggered batches release even when no new chunk arrives.
    pub fn poll_timeout(&mut self) -> Option<Vec<StreamChunk>> {
        if !self.pending.is_empty() && self.timed_out() {
            return self.take_batch();
        }
        None
    }

    /// Unconditionally flush whatever is pending (stream completion).
    pub fn flush(&mut self) -> Option<Vec<StreamChunk>> {
        if self.pending.is_empty() {
            return None;
        }
        self.take_batch()
    }

    /// Number of chunks waiting for a trigger.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Deadline of the current batch, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.first_at.map(|t| t + self.config.batch_timeout)
    }

    fn timed_out(&self) -> bool {
        self.first_at
            .is_some_and(|t| t.elapsed() >= self.config.batch_timeout)
    }

    fn take_batch(&mut self) -> Option<Vec<StreamChunk>> {
        self.first_at = None;
        Some(std::mem::take(&mut self.pending))
    }
}
