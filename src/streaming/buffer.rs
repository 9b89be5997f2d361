//! Bounded chunk buffer with a configurable overflow strategy.
//!
//! The flow controller owns one [`StreamBuffer`] per stream: a single-writer,
//! single-reader FIFO whose behavior at capacity is chosen up front.

use std::collections::VecDeque;

use crate::types::StreamChunk;

/// What happens when a chunk is pushed into a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowStrategy {
    /// Discard the incoming chunk.
    #[default]
    DropNewest,
    /// Discard the oldest buffered chunk to make room.
    DropOldest,
    /// Refuse the push; the caller waits for space.
    Block,
}

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The chunk was enqueued.
    Stored,
    /// The buffer was full; the incoming chunk was discarded.
    DroppedNewest,
    /// The buffer was full; the oldest chunk was discarded to make room.
    DroppedOldest,
    /// The buffer is full and the strategy is [`OverflowStrategy::Block`];
    /// nothing was enqueued.
    Full,
}

/// Cumulative buffer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Chunks successfully enqueued.
    pub pushed: u64,
    /// Chunks dequeued.
    pub popped: u64,
    /// Chunks discarded by the overflow strategy.
    pub dropped: u64,
}

/// Bounded FIFO of stream chunks.
#[derive(Debug)]
pub struct StreamBuffer {
    items: VecDeque<StreamChunk>,
    capacity: usize,
    strategy: OverflowStrategy,
    stats: BufferStats,
}

impl StreamBuffer {
    /// Buffer holding at most `capacity` chunks (minimum 1).
    pub fn new(capacity: usize, strategy: OverflowStrategy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            strategy,
            stats: BufferStats::default(),
        }
    }

    /// Push a chunk, applying the overflow strategy when full.
    pub fn push(&mut self, chunk: StreamChunk) -> PushOutcome {
        if self.items.len() < self.capacity {
            self.items.push_back(chunk);
            self.stats.pushed += 1;
            return PushOutcome::Stored;
        }
        match self.strategy {
            OverflowStrategy::DropNewest => {
                self.stats.dropped += 1;
                PushOutcome::DroppedNewest
            }
            OverflowStrategy::DropOldest => {
                self.items.pop_front();
                self.stats.dropped += 1;
                self.items.push_back(chunk);
                self.stats.pushed += 1;
                PushOutcome::DroppedOldest
            }
            OverflowStrategy::Block => PushOutcome::Full,
        }
    }

    /// Pop the oldest chunk, if any.
    pub fn pop(&mut self) -> Option<StreamChunk> {
        let chunk = self.items.pop_front();
        if chunk.is_some() {
            self.stats.popped += 1;
        }
        chunk
    }

    /// Current number of buffered chunks.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the buffer holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the buffer is at capacity.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill level as a fraction of capacity, in `[0, 1]`.
    pub fn fill_ratio(&self) -> f64 {
        self.items.len() as f64 / self.capacity as f64
    }

    /// Cumulative counters.
    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Discard all buffered chunks (abrupt cancellation).
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(n: usize) -> StreamChunk {
        StreamChunk::text(format!("c{n}"))
    }

    #[test]
    fn test_push_pop_fifo_order() {
        let mut buf = StreamBuffer::new(4, OverflowStrategy::DropNewest);
        for n in 0..3 {
            assert_eq!(buf.push(chunk(n)), PushOutcome::Stored);
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.pop().unwrap().content.as_deref(), Some("c0"));
        assert_eq!(buf.pop().unwrap().content.as_deref(), Some("c1"));
        assert_eq!(buf.pop().unwrap().content.as_deref(), Some("c2"));
        assert!(buf.pop().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drop_newest_keeps_size_and_counts_one_drop() {
        let mut buf = StreamBuffer::new(2, OverflowStrategy::DropNewest);
        buf.push(chunk(0));
        buf.push(chunk(1));
        let before = buf.len();

        assert_eq!(buf.push(chunk(2)), PushOutcome::DroppedNewest);
        assert_eq!(buf.len(), before);
        assert_eq!(buf.stats().dropped, 1);
        // The survivors are the oldest two.
        assert_eq!(buf.pop().unwrap().content.as_deref(), Some("c0"));
        assert_eq!(buf.pop().unwrap().content.as_deref(), Some("c1"));
    }

    #[test]
    fn test_drop_oldest_evicts_head() {
        let mut buf = StreamBuffer::new(2, OverflowStrategy::DropOldest);
        buf.push(chunk(0));
        buf.push(chunk(1));
        assert_eq!(buf.push(chunk(2)), PushOutcome::DroppedOldest);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.stats().dropped, 1);
        assert_eq!(buf.pop().unwrap().content.as_deref(), Some("c1"));
        assert_eq!(buf.pop().unwrap().content.as_deref(), Some("c2"));
    }

    #[test]
    fn test_block_strategy_refuses_without_enqueuing() {
        let mut buf = StreamBuffer::new(1, OverflowStrategy::Block);
        buf.push(chunk(0));
        assert_eq!(buf.push(chunk(1)), PushOutcome::Full);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.stats().dropped, 0);
        assert_eq!(buf.stats().pushed, 1);
    }

    #[test]
    fn test_fill_ratio() {
        let mut buf = StreamBuffer::new(10, OverflowStrategy::DropNewest);
        assert_eq!(buf.fill_ratio(), 0.0);
        for n in 0..8 {
            buf.push(chunk(n));
        }
        assert!((buf.fill_ratio() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_accounting_identity() {
        let mut buf = StreamBuffer::new(3, OverflowStrategy::DropNewest);
        for n in 0..5 {
            buf.push(chunk(n));
        }
        while buf.pop().is_some() {}
        let stats = buf.stats();
        // Everything pushed was either popped or dropped.
        assert_eq!(stats.pushed, 3);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.popped, 3);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let buf = StreamBuffer::new(0, OverflowStrategy::DropNewest);
        assert_eq!(buf.capacity(), 1);
    }

    #[test]
    fn test_clear_discards() {
        let mut buf = StreamBuffer::new(4, OverflowStrategy::DropNewest);
        buf.push(chunk(0));
        buf.push(chunk(1));
        buf.clear();
        assert!(buf.is_empty());
        // Stats are preserved; clear only drops content.
        assert_eq!(buf.stats().pushed, 2);
    }
}
