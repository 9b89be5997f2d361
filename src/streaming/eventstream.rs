//! AWS event-stream decoder for Bedrock response streams.
//!
//! Bedrock's `invoke-with-response-stream` wire format is a framed binary
//! protocol. Each message:
//!
//! ```text
//! [total_len: u32][headers_len: u32][prelude_crc: u32]
//! [headers: headers_len bytes][payload][message_crc: u32]
//! ```
//!
//! Headers are `name_len:u8 | name | value_type:u8 | value`. The
//! `:event-type` header selects handling: `chunk` messages carry a JSON
//! payload whose base64 `bytes` field holds the sub-provider's own streaming
//! JSON, `ping` is a heartbeat. Malformed frames are skipped; a single bad
//! frame never aborts the stream. CRCs are parsed past, not validated.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::streaming::StreamDecoder;
use crate::types::StreamChunk;

/// Frames larger than this are treated as desync and dropped.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;

/// Bedrock sub-provider family, selected by the model id's leading dotted
/// segment (`anthropic.claude-3-sonnet-v1:0` → `Anthropic`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BedrockFamily {
    Anthropic,
    Titan,
    Meta,
    Cohere,
    Ai21,
    Mistral,
    Writer,
    DeepSeek,
    /// Unrecognized family; decoded with OpenAI-style field names.
    Unknown,
}

impl BedrockFamily {
    /// Select the family from a Bedrock model id.
    pub fn from_model_id(model_id: &str) -> Self {
        match model_id.split('.').next().unwrap_or_default() {
            "anthropic" => Self::Anthropic,
            "amazon" => Self::Titan,
            "meta" => Self::Meta,
            "cohere" => Self::Cohere,
            "ai21" => Self::Ai21,
            "mistral" => Self::Mistral,
            "writer" => Self::Writer,
            "deepseek" => Self::DeepSeek,
            _ => Self::Unknown,
        }
    }

    /// Extract the incremental text and finish reason from one decoded
    /// sub-provider payload. Returns `None` for frames with nothing to
    /// deliver (role markers, pings that leaked through, unknown shapes).
    pub fn chunk_from_payload(self, payload: &Value) -> Option<StreamChunk> {
        match self {
            Self::Anthropic => match payload.get("type").and_then(Value::as_str) {
                Some("content_block_delta") => payload
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                    .map(StreamChunk::text),
                Some("message_delta") => payload
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                    .map(StreamChunk::done),
                Some("message_stop") => Some(StreamChunk::done("stop")),
                _ => None,
            },
            Self::Titan => {
                let text = payload.get("outputText").and_then(Value::as_str);
                let finish = payload
                    .get("completionReason")
                    .and_then(Value::as_str)
                    .filter(|r| !r.is_empty());
                build(text, finish)
            }
            Self::Meta => {
                let text = payload.get("generation").and_then(Value::as_str);
                let finish = payload.get("stop_reason").and_then(Value::as_str);
                build(text, finish)
            }
            Self::Cohere => {
                let text = payload.get("text").and_then(Value::as_str);
                let finished = payload.get("is_finished").and_then(Value::as_bool) == Some(true);
                let finish = finished.then(|| {
                    payload
                        .get("finish_reason")
                        .and_then(Value::as_str)
                        .unwrap_or("stop")
                });
                build(text, finish)
            }
            Self::Mistral => {
                let output = payload.get("outputs").and_then(|o| o.get(0))?;
                let text = output.get("text").and_then(Value::as_str);
                let finish = output.get("stop_reason").and_then(Value::as_str);
                build(text, finish)
            }
            Self::Ai21 | Self::Writer | Self::DeepSeek | Self::Unknown => {
                let choice = payload.get("choices").and_then(|c| c.get(0))?;
                let text = choice
                    .get("delta")
                    .and_then(|d| d.get("content"))
                    .and_then(Value::as_str);
                let finish = choice.get("finish_reason").and_then(Value::as_str);
                build(text, finish)
            }
        }
    }
}

fn build(text: Option<&str>, finish: Option<&str>) -> Option<StreamChunk> {
    if text.map_or(true, str::is_empty) && finish.is_none() {
        return None;
    }
    Some(StreamChunk {
        content: text.filter(|t| !t.is_empty()).map(str::to_string),
        finish_reason: finish.map(str::to_string),
        model: None,
        metadata: None,
    })
}

/// Streaming decoder for AWS event-stream frames.
#[derive(Debug)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    family: BedrockFamily,
}

impl EventStreamDecoder {
    /// Decoder routing `chunk` payloads to the given sub-provider family.
    pub fn new(family: BedrockFamily) -> Self {
        Self {
            buffer: Vec::new(),
            family,
        }
    }

    /// Try to take one complete frame off the front of the buffer.
    /// Returns the frame's headers+payload regions, or `None` when more
    /// bytes are needed.
    fn take_frame(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        if self.buffer.len() < PRELUDE_LEN {
            return None;
        }
        let total_len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        let headers_len = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;

        let min_len = PRELUDE_LEN + CRC_LEN;
        if total_len < min_len || total_len > MAX_FRAME_LEN || headers_len > total_len - min_len {
            // Desynced prelude: drop everything buffered so far rather
            // than aborting the stream.
            tracing::warn!(total_len, headers_len, "dropping malformed event-stream frame");
            self.buffer.clear();
            return None;
        }
        if self.buffer.len() < total_len {
            return None;
        }

        let frame: Vec<u8> = self.buffer.drain(..total_len).collect();
        let headers = frame[PRELUDE_LEN..PRELUDE_LEN + headers_len].to_vec();
        let payload = frame[PRELUDE_LEN + headers_len..total_len - CRC_LEN].to_vec();
        Some((headers, payload))
    }

    /// Decode one frame into at most one chunk.
    fn decode_frame(&self, headers: &[u8], payload: &[u8]) -> Option<StreamChunk> {
        let event_type = parse_headers(headers)
            .into_iter()
            .find(|(name, _)| name == ":event-type")
            .map(|(_, value)| value)?;

        match event_type.as_str() {
            "chunk" => {
                let envelope = serde_json::from_slice::<Value>(payload).ok()?;
                let inner = envelope
                    .get("bytes")
                    .and_then(Value::as_str)
                    .and_then(|b| BASE64.decode(b).ok())
                    .and_then(|raw| serde_json::from_slice::<Value>(&raw).ok())?;
                self.family.chunk_from_payload(&inner)
            }
            // Heartbeats and unknown event types are skipped.
            _ => None,
        }
    }
}

impl StreamDecoder for EventStreamDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some((headers, payload)) = self.take_frame() {
            if let Some(chunk) = self.decode_frame(&headers, &payload) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        // A partial trailing frame cannot be decoded.
        self.buffer.clear();
        Vec::new()
    }
}

/// Parse event-stream headers into `(name, string_value)` pairs.
/// Non-string values are skipped; truncated headers end parsing.
fn parse_headers(mut bytes: &[u8]) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    while !bytes.is_empty() {
        let Some((name, value_and_rest)) = split_name(bytes) else {
            break;
        };
        let Some((value, rest)) = split_value(value_and_rest) else {
            break;
        };
        if let Some(value) = value {
            headers.push((name, value));
        }
        bytes = rest;
    }
    headers
}

fn split_name(bytes: &[u8]) -> Option<(String, &[u8])> {
    let name_len = *bytes.first()? as usize;
    let rest = &bytes[1..];
    if rest.len() < name_len {
        return None;
    }
    let name = String::from_utf8_lossy(&rest[..name_len]).into_owned();
    Some((name, &rest[name_len..]))
}

/// Split one header value off the front; `Some(None)` for non-string types.
fn split_value(bytes: &[u8]) -> Option<(Option<String>, &[u8])> {
    let value_type = *bytes.first()?;
    let rest = &bytes[1..];
    let fixed = |n: usize| -> Option<(Option<String>, &[u8])> {
        (rest.len() >= n).then(|| (None, &rest[n..]))
    };
    match value_type {
        0 | 1 => Some((None, rest)),
        2 => fixed(1),
        3 => fixed(2),
        4 => fixed(4),
        5 | 8 => fixed(8),
        9 => fixed(16),
        6 | 7 => {
            if rest.len() < 2 {
                return None;
            }
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            let rest = &rest[2..];
            if rest.len() < len {
                return None;
            }
            let value = (value_type == 7)
                .then(|| String::from_utf8_lossy(&rest[..len]).into_owned());
            Some((value, &rest[len..]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build one event-stream frame with a `:event-type` string header.
    /// CRCs are zeroed; the decoder does not validate them.
    fn frame(event_type: &str, payload: &[u8]) -> Vec<u8> {
        let mut headers = Vec::new();
        let name = b":event-type";
        headers.push(name.len() as u8);
        headers.extend_from_slice(name);
        headers.push(7u8);
        headers.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
        headers.extend_from_slice(event_type.as_bytes());

        let total_len = PRELUDE_LEN + headers.len() + payload.len() + CRC_LEN;
        let mut frame = Vec::with_capacity(total_len);
        frame.extend_from_slice(&(total_len as u32).to_be_bytes());
        frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        frame.extend_from_slice(&headers);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&[0u8; 4]);
        frame
    }

    fn chunk_frame(inner: &Value) -> Vec<u8> {
        let envelope = json!({ "bytes": BASE64.encode(inner.to_string()) });
        frame("chunk", envelope.to_string().as_bytes())
    }

    #[test]
    fn test_family_from_model_id() {
        assert_eq!(
            BedrockFamily::from_model_id("anthropic.claude-3-sonnet-v1:0"),
            BedrockFamily::Anthropic
        );
        assert_eq!(
            BedrockFamily::from_model_id("amazon.titan-text-express-v1"),
            BedrockFamily::Titan
        );
        assert_eq!(
            BedrockFamily::from_model_id("meta.llama3-70b-instruct-v1:0"),
            BedrockFamily::Meta
        );
        assert_eq!(BedrockFamily::from_model_id("whatever"), BedrockFamily::Unknown);
    }

    #[test]
    fn test_anthropic_text_delta() {
        let mut decoder = EventStreamDecoder::new(BedrockFamily::Anthropic);
        let chunks = decoder.feed(&chunk_frame(&json!({
            "type": "content_block_delta",
            "delta": {"type": "text_delta", "text": "Hi"},
        })));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content.as_deref(), Some("Hi"));
    }

    #[test]
    fn test_anthropic_stop_reason() {
        let mut decoder = EventStreamDecoder::new(BedrockFamily::Anthropic);
        let chunks = decoder.feed(&chunk_frame(&json!({
            "type": "message_delta",
            "delta": {"stop_reason": "end_turn"},
        })));
        assert_eq!(chunks[0].finish_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_titan_output_text_and_completion() {
        let mut decoder = EventStreamDecoder::new(BedrockFamily::Titan);
        let mut chunks = decoder.feed(&chunk_frame(&json!({
            "outputText": "Hello",
            "completionReason": null,
        })));
        chunks.extend(decoder.feed(&chunk_frame(&json!({
            "outputText": "",
            "completionReason": "FINISH",
        }))));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content.as_deref(), Some("Hello"));
        assert_eq!(chunks[1].finish_reason.as_deref(), Some("FINISH"));
    }

    #[test]
    fn test_meta_generation() {
        let mut decoder = EventStreamDecoder::new(BedrockFamily::Meta);
        let chunks = decoder.feed(&chunk_frame(&json!({
            "generation": "tok",
            "stop_reason": null,
        })));
        assert_eq!(chunks[0].content.as_deref(), Some("tok"));
    }

    #[test]
    fn test_cohere_is_finished() {
        let mut decoder = EventStreamDecoder::new(BedrockFamily::Cohere);
        let chunks = decoder.feed(&chunk_frame(&json!({
            "text": "",
            "is_finished": true,
            "finish_reason": "COMPLETE",
        })));
        assert_eq!(chunks[0].finish_reason.as_deref(), Some("COMPLETE"));
    }

    #[test]
    fn test_mistral_outputs() {
        let mut decoder = EventStreamDecoder::new(BedrockFamily::Mistral);
        let chunks = decoder.feed(&chunk_frame(&json!({
            "outputs": [{"text": "bonjour", "stop_reason": null}],
        })));
        assert_eq!(chunks[0].content.as_deref(), Some("bonjour"));
    }

    #[test]
    fn test_ping_is_skipped() {
        let mut decoder = EventStreamDecoder::new(BedrockFamily::Anthropic);
        let mut bytes = frame("ping", b"{}");
        bytes.extend(chunk_frame(&json!({
            "type": "content_block_delta",
            "delta": {"text": "after ping"},
        })));
        let chunks = decoder.feed(&bytes);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content.as_deref(), Some("after ping"));
    }

    #[test]
    fn test_frame_split_across_feeds() {
        let bytes = chunk_frame(&json!({
            "type": "content_block_delta",
            "delta": {"text": "split"},
        }));
        let mut decoder = EventStreamDecoder::new(BedrockFamily::Anthropic);
        let (a, b) = bytes.split_at(bytes.len() / 2);
        assert!(decoder.feed(a).is_empty());
        let chunks = decoder.feed(b);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content.as_deref(), Some("split"));
    }

    #[test]
    fn test_malformed_payload_yields_nothing_but_stream_continues() {
        let mut decoder = EventStreamDecoder::new(BedrockFamily::Anthropic);
        // Valid framing, invalid base64 in the envelope.
        let bad = frame("chunk", br#"{"bytes": "!!!not-base64!!!"}"#);
        assert!(decoder.feed(&bad).is_empty());
        // Subsequent good frames still decode.
        let chunks = decoder.feed(&chunk_frame(&json!({
            "type": "content_block_delta",
            "delta": {"text": "ok"},
        })));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_desynced_prelude_dropped() {
        let mut decoder = EventStreamDecoder::new(BedrockFamily::Anthropic);
        // total_len of 3 is impossible; buffer is discarded.
        let mut bytes = vec![0u8, 0, 0, 3];
        bytes.extend_from_slice(&[0u8; 20]);
        assert!(decoder.feed(&bytes).is_empty());
        // Fresh frames after the drop decode normally.
        let chunks = decoder.feed(&chunk_frame(&json!({
            "type": "content_block_delta",
            "delta": {"text": "recovered"},
        })));
        assert_eq!(chunks.len(), 1);
    }
}
