//! SSE (Server-Sent Events) decoder for OpenAI-compatible streams.
//!
//! Accumulates bytes, splits on the `"\n\n"` event boundary, and reads the
//! `data: ` payload of each event: `[DONE]` becomes the terminal chunk,
//! anything else is a JSON object whose `choices[0].delta.content` is the
//! incremental text and whose `choices[0].finish_reason` is the terminal
//! marker. Handles events split at arbitrary byte boundaries and empty
//! keep-alive lines.

use serde_json::Value;

use crate::streaming::StreamDecoder;
use crate::types::StreamChunk;

/// Maps one parsed `data:` payload to at most one chunk.
pub type PayloadExtractor = fn(&Value) -> Option<StreamChunk>;

/// SSE decoder for `data: {...}` / `data: [DONE]` streams.
///
/// The default payload shape is OpenAI's (`choices[0].delta.content`);
/// providers with their own SSE dialect (Anthropic, Gemini) install a
/// different [`PayloadExtractor`] via [`with_extractor`](Self::with_extractor).
///
/// # Example
///
/// ```
/// use llm_conduit::streaming::{sse::SseDecoder, StreamDecoder};
///
/// let mut decoder = SseDecoder::new();
/// let chunks = decoder.feed(
///     b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n",
/// );
/// assert_eq!(chunks.len(), 2);
/// assert_eq!(chunks[0].content.as_deref(), Some("Hi"));
/// assert!(chunks[1].is_done());
/// ```
pub struct SseDecoder {
    buffer: String,
    extract: PayloadExtractor,
}

impl std::fmt::Debug for SseDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseDecoder")
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    /// Decoder for the OpenAI-compatible payload shape.
    pub fn new() -> Self {
        Self::with_extractor(Self::openai_payload)
    }

    /// Decoder with a provider-specific payload extractor.
    pub fn with_extractor(extract: PayloadExtractor) -> Self {
        Self {
            buffer: String::new(),
            extract,
        }
    }

    /// Decode one complete SSE event block (the text between `\n\n`).
    fn decode_event(&self, event: &str) -> Option<StreamChunk> {
        for line in event.lines() {
            let line = line.trim();
            let Some(data) = line
                .strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
            else {
                // event:/id:/retry: lines and comments are skipped.
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                return Some(StreamChunk::done("stop"));
            }

            let Ok(value) = serde_json::from_str::<Value>(data) else {
                // Malformed payload: skip, never abort the stream.
                continue;
            };
            return (self.extract)(&value);
        }
        None
    }

    /// The OpenAI-compatible payload shape (`choices[0].delta.content`).
    pub fn openai_payload(value: &Value) -> Option<StreamChunk> {
        let choice = value.get("choices").and_then(|c| c.get(0));
        let content = choice
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str);
        let finish_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str);
        let model = value.get("model").and_then(Value::as_str);

        if content.is_none() && finish_reason.is_none() {
            // Role-only or usage-only frame; nothing to deliver.
            return None;
        }
        Some(StreamChunk {
            content: content.map(str::to_string),
            finish_reason: finish_reason.map(str::to_string),
            model: model.map(str::to_string),
            metadata: value.get("usage").cloned().map(|u| serde_json::json!({ "usage": u })),
        })
    }
}

impl StreamDecoder for SseDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut chunks = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..pos + 2).collect();
            if let Some(chunk) = self.decode_event(&event) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        let remaining = std::mem::take(&mut self.buffer);
        if remaining.trim().is_empty() {
            return Vec::new();
        }
        self.decode_event(&remaining).into_iter().collect()
    }
}
