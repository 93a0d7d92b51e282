//! Event-stream protocol between the dashboard server and its clients.
//!
//! Wire format is standard Server-Sent Events text framing:
//!
//! ```text
//! event: agent_output
//! data: {"type":"agent_output","session":"build","chunk":"ok\n"}
//!
//! ```
//!
//! Every frame ends with a blank line. Lines starting with `:` are comments
//! and are used as keep-alives.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum size of a single buffered frame (16 MiB). Prevents OOM when a peer
/// never sends a frame terminator.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Comment text used for keep-alive frames.
pub const KEEP_ALIVE_COMMENT: &str = "keep-alive";

/// A typed event pushed to stream subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// New output appended to the session since the previous event.
    AgentOutput { session: String, chunk: String },
    /// Terminal condition. The server closes the connection after sending it.
    AgentError { session: String, message: String },
}

/// Discriminant of [`StreamEvent`], used as the key of dispatch tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentOutput,
    AgentError,
}

impl EventKind {
    /// The `event:` field value on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AgentOutput => "agent_output",
            EventKind::AgentError => "agent_error",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "agent_output" => Some(EventKind::AgentOutput),
            "agent_error" => Some(EventKind::AgentError),
            _ => None,
        }
    }
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::AgentOutput { .. } => EventKind::AgentOutput,
            StreamEvent::AgentError { .. } => EventKind::AgentError,
        }
    }

    pub fn session(&self) -> &str {
        match self {
            StreamEvent::AgentOutput { session, .. } | StreamEvent::AgentError { session, .. } => {
                session
            }
        }
    }

    /// `true` for events after which the server closes the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::AgentError { .. })
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed {event} payload: {source}")]
    Payload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("event type {declared} does not match payload type {actual}")]
    TypeMismatch {
        declared: &'static str,
        actual: &'static str,
    },

    #[error("frame exceeds {MAX_FRAME_SIZE} bytes")]
    FrameTooLarge,
}

/// Encode an event as one SSE frame.
pub fn encode_event(event: &StreamEvent) -> Bytes {
    // Serializing a plain enum of strings cannot fail.
    let data = serde_json::to_string(event).unwrap_or_default();
    let kind = event.kind().as_str();
    let mut buf = BytesMut::with_capacity(kind.len() + data.len() + 16);
    buf.put_slice(b"event: ");
    buf.put_slice(kind.as_bytes());
    buf.put_u8(b'\n');
    for line in data.split('\n') {
        buf.put_slice(b"data: ");
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
    }
    buf.put_u8(b'\n');
    buf.freeze()
}

/// Encode an SSE comment frame. Comments are ignored by decoders.
pub fn encode_comment(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 4);
    for line in text.split('\n') {
        buf.put_slice(b": ");
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
    }
    buf.put_u8(b'\n');
    buf.freeze()
}

/// One complete SSE frame before payload interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
    /// Value of the `id:` field, if any.
    pub id: Option<String>,
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a blank line completes a frame, so a read that
/// ends in the middle of a frame (or of a UTF-8 sequence) loses nothing.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already searched for a line terminator.
    scanned: usize,
    pending: RawFrame,
    has_fields: bool,
    /// A `\r` ended the previous chunk; a leading `\n` in the next chunk
    /// belongs to the same line terminator.
    skip_lf: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes read from the transport, returning every frame they complete.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<RawFrame>, ProtocolError> {
        let mut input = chunk;
        if self.skip_lf {
            if let Some(rest) = input.strip_prefix(b"\n") {
                input = rest;
            }
            self.skip_lf = false;
        }
        self.buf.extend_from_slice(input);

        let mut frames = Vec::new();
        let mut start = 0;
        let mut i = self.scanned;
        while i < self.buf.len() {
            let byte = self.buf[i];
            if byte != b'\n' && byte != b'\r' {
                i += 1;
                continue;
            }
            let line_end = i;
            i += 1;
            if byte == b'\r' {
                if i < self.buf.len() {
                    if self.buf[i] == b'\n' {
                        i += 1;
                    }
                } else {
                    self.skip_lf = true;
                }
            }
            let line = String::from_utf8_lossy(&self.buf[start..line_end]).into_owned();
            start = i;
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() + self.pending.data.len() > MAX_FRAME_SIZE {
            self.reset();
            return Err(ProtocolError::FrameTooLarge);
        }
        Ok(frames)
    }

    /// Discard any partially received frame.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.pending = RawFrame::default();
        self.has_fields = false;
        self.skip_lf = false;
    }

    fn process_line(&mut self, line: &str) -> Option<RawFrame> {
        if line.is_empty() {
            if !self.has_fields {
                return None;
            }
            self.has_fields = false;
            let mut frame = std::mem::take(&mut self.pending);
            if frame.data.ends_with('\n') {
                frame.data.pop();
            }
            return Some(frame);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.pending.event = Some(value.to_string());
                self.has_fields = true;
            }
            "data" => {
                self.pending.data.push_str(value);
                self.pending.data.push('\n');
                self.has_fields = true;
            }
            "id" => {
                self.pending.id = Some(value.to_string());
                self.has_fields = true;
            }
            _ => {}
        }
        None
    }
}

/// Interpret a raw frame as a [`StreamEvent`].
///
/// Returns `Ok(None)` for event types this build does not know about, so
/// newer servers can add events without breaking older clients.
pub fn decode_event(frame: &RawFrame) -> Result<Option<StreamEvent>, ProtocolError> {
    let name = frame.event.as_deref().unwrap_or("message");
    let Some(declared) = EventKind::from_wire(name) else {
        return Ok(None);
    };
    let event: StreamEvent =
        serde_json::from_str(&frame.data).map_err(|source| ProtocolError::Payload {
            event: declared.as_str(),
            source,
        })?;
    if event.kind() != declared {
        return Err(ProtocolError::TypeMismatch {
            declared: declared.as_str(),
            actual: event.kind().as_str(),
        });
    }
    Ok(Some(event))
}
