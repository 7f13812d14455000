use std::fmt::Display;

use bridge_types::RawEvent;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::client::EventStream;
use crate::error::SyncError;

/// Incremental decoder for `text/event-stream` bodies.
///
/// Frames end at a blank line (`\n\n` or `\r\n\r\n`). A frame may carry
/// several `data:` lines, joined with `\n`, and an optional `event:` name that
/// is used as the type when the JSON payload has none.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    // Trailing bytes of a UTF-8 sequence split across chunks.
    partial: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.partial.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.partial) {
            Ok(text) => text.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => {
                let text = String::from_utf8_lossy(&self.partial).into_owned();
                self.buffer.push_str(&text);
                self.partial.clear();
                return;
            }
        };
        let rest = self.partial.split_off(valid);
        if let Ok(text) = std::str::from_utf8(&self.partial) {
            self.buffer.push_str(text);
        }
        self.partial = rest;
    }

    /// Pops the next complete event, skipping frames that carry no usable data.
    pub fn next_event(&mut self) -> Option<RawEvent> {
        loop {
            let frame = self.next_frame()?;
            if let Some(event) = parse_frame(&frame) {
                return Some(event);
            }
        }
    }

    fn next_frame(&mut self) -> Option<String> {
        let crlf = self.buffer.find("\r\n\r\n").map(|i| (i, 4));
        let lf = self.buffer.find("\n\n").map(|i| (i, 2));
        let (end, delim_len) = match (crlf, lf) {
            (Some(a), Some(b)) => {
                if a.0 <= b.0 {
                    a
                } else {
                    b
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return None,
        };
        let frame = self.buffer[..end].to_string();
        self.buffer.drain(..end + delim_len);
        Some(frame)
    }
}

fn parse_frame(frame: &str) -> Option<RawEvent> {
    let mut event_name: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in frame.lines() {
        let line = raw_line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        } else if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim());
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    let data = data_lines.join("\n");
    if data == "[DONE]" {
        return Some(RawEvent::new("server.done", Value::Null));
    }

    let value = match serde_json::from_str::<Value>(&data) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!("Dropping non-JSON SSE frame: {} - data: {}", e, data);
            return None;
        }
    };

    if value.get("type").and_then(Value::as_str).is_some() {
        match serde_json::from_value::<RawEvent>(value) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!("Dropping malformed SSE event: {}", e);
                None
            }
        }
    } else {
        event_name
            .filter(|name| !name.is_empty())
            .map(|name| RawEvent::new(name, value))
    }
}

/// Adapts a raw byte stream (for example an HTTP response body) into the
/// event stream the reconciler consumes. The first transport error is
/// yielded and ends the stream.
pub fn decode_event_stream<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut decoder = SseDecoder::new();
        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    decoder.push(chunk.as_ref());
                    while let Some(event) = decoder.next_event() {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    tracing::warn!("SSE stream error: {}", e);
                    yield Err(SyncError::Transport(format!("Stream error: {}", e)));
                    break;
                }
            }
        }
        tracing::debug!("SSE stream ended");
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_opencode_style_frame() {
        let mut decoder = SseDecoder::new();
        decoder.push(
            b"data: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"ses_123\"}}\n\n",
        );
        let event = decoder.next_event().expect("event");
        assert_eq!(event.event_type, "session.idle");
        assert_eq!(event.properties["sessionID"], "ses_123");
        assert!(decoder.next_event().is_none());
    }

    #[test]
    fn joins_multiline_data_and_handles_crlf() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: {\"type\":\"message.updated\",\r\ndata: \"properties\":{}}\r\n\r\n");
        let event = decoder.next_event().expect("event");
        assert_eq!(event.event_type, "message.updated");
    }

    #[test]
    fn waits_for_frame_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: {\"type\":\"session.idle\",");
        assert!(decoder.next_event().is_none());
        decoder.push(b"\"properties\":{\"sessionID\":\"s\"}}\n\n");
        assert!(decoder.next_event().is_some());
    }

    #[test]
    fn keeps_multibyte_characters_split_across_chunks() {
        let payload = "data: {\"type\":\"session.error\",\"properties\":{\"error\":\"caf\u{e9}\"}}\n\n";
        let bytes = payload.as_bytes();
        let split = payload.find('\u{e9}').expect("accent") + 1;
        let mut decoder = SseDecoder::new();
        decoder.push(&bytes[..split]);
        decoder.push(&bytes[split..]);
        let event = decoder.next_event().expect("event");
        assert_eq!(event.properties["error"], "caf\u{e9}");
    }

    #[test]
    fn uses_event_field_when_payload_is_untyped() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"event: question.asked\ndata: {\"id\":\"q1\"}\n\n");
        let event = decoder.next_event().expect("event");
        assert_eq!(event.event_type, "question.asked");
        assert_eq!(event.properties["id"], "q1");
    }

    #[test]
    fn skips_comments_and_garbage() {
        let mut decoder = SseDecoder::new();
        decoder.push(b": keepalive\n\ndata: not json\n\ndata: [DONE]\n\n");
        let event = decoder.next_event().expect("done sentinel");
        assert_eq!(event.event_type, "server.done");
    }

    #[tokio::test]
    async fn byte_stream_error_is_yielded_once_then_ends() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(b"data: {\"type\":\"session.idle\",\"properties\":{}}\n\n".to_vec()),
            Err("connection reset".to_string()),
            Ok(b"data: {\"type\":\"session.idle\",\"properties\":{}}\n\n".to_vec()),
        ];
        let mut events = decode_event_stream(futures::stream::iter(chunks));
        assert!(matches!(events.next().await, Some(Ok(_))));
        assert!(matches!(events.next().await, Some(Err(SyncError::Transport(_)))));
        assert!(events.next().await.is_none());
    }
}
