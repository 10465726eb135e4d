//! Incremental Server-Sent Events frame decoder.
//!
//! Bytes arrive from the HTTP body in arbitrary chunks.  [`SseDecoder`]
//! buffers them, splits complete lines and groups lines into frames at each
//! blank line.  It knows nothing about vendor payloads beyond the two
//! terminal markers: the `data: [DONE]` sentinel and the `message_stop`
//! event.

use crate::error::{AgentError, Result};

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// The `event:` field, if the frame had one.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

/// Stateful, chunk-at-a-time SSE decoder.
#[derive(Debug)]
pub struct SseDecoder {
    vendor: String,
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    done: bool,
}

impl SseDecoder {
    /// Create a decoder.  `vendor` is only used for error context.
    pub fn new(vendor: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            buffer: Vec::new(),
            event: None,
            data: Vec::new(),
            done: false,
        }
    }

    /// Whether a terminal frame has been seen.  Further input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk of bytes and return every frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        let mut frames = Vec::new();
        if self.done {
            return Ok(frames);
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8(line)
                .map_err(|e| AgentError::decode(&self.vendor, format!("invalid utf-8 in stream: {e}")))?;

            self.process_line(&line, &mut frames);
            if self.done {
                self.buffer.clear();
                break;
            }
        }

        Ok(frames)
    }

    /// Flush any trailing frame at end of input.
    pub fn finish(&mut self) -> Result<Vec<SseFrame>> {
        let mut frames = Vec::new();
        if self.done {
            return Ok(frames);
        }
        if !self.buffer.is_empty() {
            let mut rest = std::mem::take(&mut self.buffer);
            if rest.last() == Some(&b'\r') {
                rest.pop();
            }
            let line = String::from_utf8(rest)
                .map_err(|e| AgentError::decode(&self.vendor, format!("invalid utf-8 in stream: {e}")))?;
            self.process_line(&line, &mut frames);
        }
        if !self.done {
            self.dispatch(&mut frames);
        }
        Ok(frames)
    }

    fn process_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.dispatch(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            "id" | "retry" => {}
            other => tracing::trace!(field = other, "ignoring unknown SSE field"),
        }
    }

    fn dispatch(&mut self, frames: &mut Vec<SseFrame>) {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return;
        }
        let data = std::mem::take(&mut self.data).join("\n");

        if event.as_deref() == Some("ping") {
            return;
        }
        if data.trim() == "[DONE]" {
            self.done = true;
            return;
        }

        let terminal = event.as_deref() == Some("message_stop");
        frames.push(SseFrame { event, data });
        if terminal {
            self.done = true;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn data(frames: &[SseFrame]) -> Vec<&str> {
        frames.iter().map(|f| f.data.as_str()).collect()
    }

    #[test]
    fn frames_split_on_blank_lines() {
        let mut dec = SseDecoder::new("test");
        let frames = dec
            .feed(b"event: a\ndata: {\"x\":1}\n\nevent: b\ndata: 2\n\n")
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("a"));
        assert_eq!(frames[0].data, "{\"x\":1}");
        assert_eq!(frames[1].event.as_deref(), Some("b"));
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut dec = SseDecoder::new("test");
        assert!(dec.feed(b"data: hel").unwrap().is_empty());
        assert!(dec.feed(b"lo\n").unwrap().is_empty());
        let frames = dec.feed(b"\n").unwrap();
        assert_eq!(data(&frames), vec!["hello"]);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let mut dec = SseDecoder::new("test");
        let bytes = "data: héllo\n\n".as_bytes();
        let (a, b) = bytes.split_at(8);
        assert!(dec.feed(a).unwrap().is_empty());
        assert_eq!(data(&dec.feed(b).unwrap()), vec!["héllo"]);
    }

    #[test]
    fn multiline_data_joined_with_newline() {
        let mut dec = SseDecoder::new("test");
        let frames = dec.feed(b"data: one\ndata: two\n\n").unwrap();
        assert_eq!(data(&frames), vec!["one\ntwo"]);
    }

    #[test]
    fn crlf_and_comments_tolerated() {
        let mut dec = SseDecoder::new("test");
        let frames = dec
            .feed(b": keep-alive\r\nevent: x\r\ndata: y\r\n\r\n")
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("x"));
        assert_eq!(frames[0].data, "y");
    }

    #[test]
    fn ping_frames_dropped() {
        let mut dec = SseDecoder::new("test");
        let frames = dec
            .feed(b"event: ping\ndata: {\"type\":\"ping\"}\n\ndata: real\n\n")
            .unwrap();
        assert_eq!(data(&frames), vec!["real"]);
    }

    #[test]
    fn done_sentinel_ends_stream_without_frame() {
        let mut dec = SseDecoder::new("test");
        let frames = dec
            .feed(b"data: {\"a\":1}\n\ndata: [DONE]\n\ndata: {\"late\":true}\n\n")
            .unwrap();
        assert_eq!(data(&frames), vec!["{\"a\":1}"]);
        assert!(dec.is_done());
        assert!(dec.feed(b"data: more\n\n").unwrap().is_empty());
        assert!(dec.finish().unwrap().is_empty());
    }

    #[test]
    fn message_stop_is_delivered_then_terminal() {
        let mut dec = SseDecoder::new("test");
        let frames = dec
            .feed(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\nevent: x\ndata: 1\n\n")
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_stop"));
        assert!(dec.is_done());
    }

    #[test]
    fn trailing_frame_flushed_at_finish() {
        let mut dec = SseDecoder::new("test");
        assert!(dec.feed(b"data: tail").unwrap().is_empty());
        let frames = dec.finish().unwrap();
        assert_eq!(data(&frames), vec!["tail"]);
    }

    #[test]
    fn invalid_utf8_is_decode_error() {
        let mut dec = SseDecoder::new("test");
        let err = dec.feed(b"data: \xff\xfe\n\n").unwrap_err();
        assert!(matches!(err, AgentError::Decode { .. }));
    }
}
