//! Newline-delimited JSON decoder for Ollama-style streams.
//!
//! Splits on `"\n"`; each complete line is one JSON object with the
//! incremental text at `message.content` and `"done": true` marking the end
//! of the stream. Handles objects split across TCP chunk boundaries; no
//! chunk is emitted until its terminating newline is observed.

use serde_json::Value;

use crate::streaming::StreamDecoder;
use crate::types::StreamChunk;

/// NDJSON decoder for `{"message":{"content":...},"done":bool}` lines.
///
/// # Example
///
/// ```
/// use llm_conduit::streaming::{ndjson::NdjsonDecoder, StreamDecoder};
///
/// let mut decoder = NdjsonDecoder::new();
/// assert!(decoder.feed(b"{\"message\":{\"content\":").is_empty());
/// let chunks = decoder.feed(b"\"Hi\"},\"done\":false}\n");
/// assert_eq!(chunks[0].content.as_deref(), Some("Hi"));
/// ```
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: String,
}

impl NdjsonDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    fn chunk_from_line(line: &str) -> Option<StreamChunk> {
        let value = serde_json::from_str::<Value>(line).ok()?;

        let content = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            // Generate-style responses carry the token at `response`.
            .or_else(|| value.get("response").and_then(Value::as_str));
        let done = value.get("done").and_then(Value::as_bool) == Some(true);
        let model = value.get("model").and_then(Value::as_str);

        if content.is_none() && !done {
            return None;
        }
        Some(StreamChunk {
            content: content.filter(|c| !c.is_empty()).map(str::to_string),
            finish_reason: done.then(|| {
                value
                    .get("done_reason")
                    .and_then(Value::as_str)
                    .unwrap_or("stop")
                    .to_string()
            }),
            model: model.map(str::to_string),
            metadata: None,
        })
    }
}

impl StreamDecoder for NdjsonDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut chunks = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(chunk) = Self::chunk_from_line(line) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        let remaining = std::mem::take(&mut self.buffer);
        let remaining = remaining.trim();
        if remaining.is_empty() {
            return Vec::new();
        }
        Self::chunk_from_line(remaining).into_iter().collect()
    }
}
