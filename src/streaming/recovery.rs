//! Persistence of partial chunk sequences for mid-stream recovery.
//!
//! Callers that want to survive a dropped stream register it under a
//! recovery id; every delivered chunk is appended to that id's log. After a
//! failure the partial response can be fetched and the request resumed from
//! where it left off. The store is process-wide, bounded by an entry cap
//! with oldest-first eviction plus a TTL sweep.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{LlmError, Result};
use crate::types::{Message, StreamChunk};

/// Recovery store bounds.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Maximum simultaneously tracked recovery ids.
    pub max_streams: usize,
    /// Entries older than this are swept on insert.
    pub ttl: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_streams: 1000,
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// One tracked stream: request identity plus the append-only chunk log.
#[derive(Debug, Clone)]
pub struct RecoveryRecord {
    /// The id this record is stored under.
    pub recovery_id: String,
    /// Provider tag of the original request.
    pub provider: String,
    /// Messages of the original request.
    pub messages: Vec<Message>,
    /// Salient options of the original request.
    pub options: Value,
    /// Chunks recorded so far, in delivery order.
    pub chunks: Vec<StreamChunk>,
    created_at: Instant,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, RecoveryRecord>,
    /// Insertion order, for cap eviction.
    order: VecDeque<String>,
}

/// Process-wide store of partial stream responses.
///
/// Safe for concurrent writers and readers per id; readers always observe a
/// consistent prefix of the chunk log.
pub struct RecoveryStore {
    inner: RwLock<Inner>,
    config: RecoveryConfig,
}

impl std::fmt::Debug for RecoveryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStore")
            .field("tracked", &self.inner.read().records.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for RecoveryStore {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

impl RecoveryStore {
    /// Store with the given bounds.
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            config: RecoveryConfig {
                max_streams: config.max_streams.max(1),
                ..config
            },
        }
    }

    /// Register a stream and return its fresh recovery id.
    ///
    /// Ids are unique even for identical inputs.
    pub fn init_recovery(&self, provider: &str, messages: &[Message], options: Value) -> String {
        let recovery_id = Uuid::new_v4().to_string();
        let mut inner = self.inner.write();

        self.sweep_expired(&mut inner);
        while inner.records.len() >= self.config.max_streams {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.records.remove(&oldest);
        }

        inner.records.insert(
            recovery_id.clone(),
            RecoveryRecord {
                recovery_id: recovery_id.clone(),
                provider: provider.to_string(),
                messages: messages.to_vec(),
                options,
                chunks: Vec::new(),
                created_at: Instant::now(),
            },
        );
        inner.order.push_back(recovery_id.clone());
        recovery_id
    }

    /// Append a chunk to the id's log. Empty chunks are silently ignored;
    /// unknown ids are ignored too (the stream may have been evicted).
    pub fn record_chunk(&self, recovery_id: &str, chunk: &StreamChunk) {
        if chunk.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        if let Some(record) = inner.records.get_mut(recovery_id) {
            record.chunks.push(chunk.clone());
        }
    }

    /// The chunks recorded so far, in insertion order.
    pub fn get_partial_response(&self, recovery_id: &str) -> Result<Vec<StreamChunk>> {
        self.inner
            .read()
            .records
            .get(recovery_id)
            .map(|r| r.chunks.clone())
            .ok_or_else(|| LlmError::NotFound(format!("recovery id '{recovery_id}'")))
    }

    /// The full record (request identity plus chunks).
    pub fn get_record(&self, recovery_id: &str) -> Result<RecoveryRecord> {
        self.inner
            .read()
            .records
            .get(recovery_id)
            .cloned()
            .ok_or_else(|| LlmError::NotFound(format!("recovery id '{recovery_id}'")))
    }

    /// Forget a stream. Subsequent reads return `NotFound`.
    pub fn clear_partial_response(&self, recovery_id: &str) {
        let mut inner = self.inner.write();
        inner.records.remove(recovery_id);
        inner.order.retain(|id| id != recovery_id);
    }

    /// Number of tracked streams.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Whether no streams are tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    fn sweep_expired(&self, inner: &mut Inner) {
        let ttl = self.config.ttl;
        let expired: Vec<String> = inner
            .records
            .iter()
            .filter(|(_, r)| r.created_at.elapsed() >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.records.remove(id);
        }
        inner.order.retain(|id| !expired.contains(id));
    }
}
