//! Server-Sent Events (SSE) frame decoding.
//!
//! The chat endpoint streams one JSON object per frame, frames separated
//! by a blank line:
//! ```text
//! data: {"token": "Hel"}
//!
//! data: {"token": "lo"}
//!
//! data: {"done": true, "circles_used": ["Fitness"]}
//! ```
//!
//! [`FrameDecoder`] turns arbitrarily split byte chunks into [`SseEvent`]s.
//! [`SseStreamExt`] wraps a byte stream into a lazy event stream.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::client::ClientError;

/// Separator between two frames.
pub const FRAME_DELIMITER: &str = "\n\n";

/// Prefix of the payload line inside a frame.
pub const DATA_PREFIX: &str = "data: ";

/// A typed event decoded from one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Incremental content fragment
    Token(String),
    /// End of the answer, with the sources that influenced it
    Done(Vec<String>),
    /// Server-side failure
    Error(String),
}

impl SseEvent {
    /// Whether no further events are valid after this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SseEvent::Done(_) | SseEvent::Error(_))
    }
}

/// Incremental decoder from raw bytes to [`SseEvent`]s.
///
/// Bytes are buffered until they form complete UTF-8 text, and text is
/// buffered until it contains a complete frame. After every [`feed`] the
/// text buffer holds no frame delimiter.
///
/// [`feed`]: FrameDecoder::feed
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Trailing bytes of an incomplete UTF-8 sequence
    pending: BytesMut,
    /// Decoded text not yet terminated by a delimiter
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every event it completes, in arrival order.
    ///
    /// # Example
    /// ```
    /// use pookie_chat::sse::{FrameDecoder, SseEvent};
    ///
    /// let mut decoder = FrameDecoder::new();
    /// assert!(decoder.feed(b"data: {\"token\": \"Hel\"}\n").is_empty());
    /// assert_eq!(decoder.feed(b"\n"), vec![SseEvent::Token("Hel".into())]);
    /// ```
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        // The buffer holds no delimiter yet; only a trailing '\n' can start one
        let mut search_from = match self.buffer.as_bytes().last() {
            Some(b'\n') => self.buffer.len() - 1,
            _ => self.buffer.len(),
        };
        self.decode_text(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = self.buffer[search_from..].find(FRAME_DELIMITER) {
            let end = search_from + pos;
            let frame = &self.buffer[consumed..end];
            consumed = end + FRAME_DELIMITER.len();
            search_from = consumed;

            if frame.is_empty() {
                continue;
            }
            match parse_frame(frame) {
                Some(event) => events.push(event),
                None => trace!(frame, "frame produced no event"),
            }
        }
        self.buffer.drain(..consumed);

        events
    }

    /// Drop all buffered bytes and text.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.buffer.clear();
    }

    /// Whether any undecoded input is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.buffer.is_empty()
    }

    fn decode_text(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Split multi-byte sequence, wait for the rest
                        None => {
                            self.pending.advance(valid);
                            return;
                        }
                        Some(len) => {
                            debug!(len, "replacing invalid UTF-8 in stream");
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending.advance(valid + len);
                        }
                    }
                }
            }
        }
    }
}

/// Parse an SSE line to extract the data portion.
///
/// # Example
/// ```
/// use pookie_chat::sse::parse_data_line;
///
/// assert_eq!(parse_data_line("data: {\"a\": 1}"), Some("{\"a\": 1}"));
/// assert_eq!(parse_data_line("event: message"), None);
/// ```
pub fn parse_data_line(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_PREFIX)
}

/// Decode one frame (without its delimiter) into an event.
///
/// Only the first `data: ` line is considered; other lines are ignored.
pub fn parse_frame(frame: &str) -> Option<SseEvent> {
    let data = frame.lines().find_map(parse_data_line)?;
    decode_payload(data)
}

/// Decode a `data:` payload into an event.
///
/// Payloads that are not JSON objects, or match none of the known shapes,
/// yield `None`. This leniency is part of the protocol: such frames are
/// dropped without ending the stream.
pub fn decode_payload(data: &str) -> Option<SseEvent> {
    match serde_json::from_str::<Map<String, Value>>(data) {
        Ok(object) => FramePayload::from(object).into_event(),
        Err(e) => {
            debug!(error = %e, "dropping frame with malformed payload");
            None
        }
    }
}

/// Closed schema of the frame payloads the chat endpoint sends.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FramePayload {
    Token(String),
    Done { circles_used: Vec<String> },
    Error(String),
    Unrecognized,
}

impl From<Map<String, Value>> for FramePayload {
    fn from(mut object: Map<String, Value>) -> Self {
        if let Some(Value::String(token)) = object.remove("token") {
            return FramePayload::Token(token);
        }
        if let Some(Value::Bool(true)) = object.get("done") {
            let circles_used = object
                .remove("circles_used")
                .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok())
                .unwrap_or_default();
            return FramePayload::Done { circles_used };
        }
        if let Some(Value::String(error)) = object.remove("error") {
            return FramePayload::Error(error);
        }
        FramePayload::Unrecognized
    }
}

impl FramePayload {
    fn into_event(self) -> Option<SseEvent> {
        match self {
            FramePayload::Token(text) => Some(SseEvent::Token(text)),
            FramePayload::Done { circles_used } => Some(SseEvent::Done(circles_used)),
            FramePayload::Error(message) => Some(SseEvent::Error(message)),
            FramePayload::Unrecognized => {
                debug!("dropping frame with unrecognized payload");
                None
            }
        }
    }
}

/// Extension trait turning a raw byte stream into a stream of [`SseEvent`]s.
///
/// # Example
/// ```ignore
/// use pookie_chat::sse::SseStreamExt;
///
/// let mut events = byte_stream.sse_events();
/// while let Some(event) = events.next().await {
///     println!("{:?}", event?);
/// }
/// ```
pub trait SseStreamExt {
    /// Decode the stream into events.
    ///
    /// The event stream ends after the first terminal event, after a
    /// transport error has been yielded, or when the byte stream ends.
    fn sse_events(self) -> impl Stream<Item = Result<SseEvent, ClientError>> + Send;
}

impl<S> SseStreamExt for S
where
    S: Stream<Item = Result<Bytes, ClientError>> + Send,
{
    fn sse_events(self) -> impl Stream<Item = Result<SseEvent, ClientError>> + Send {
        stream::unfold(
            (Box::pin(self), FrameDecoder::new(), VecDeque::<SseEvent>::new(), false),
            |(mut byte_stream, mut decoder, mut ready, mut finished)| async move {
                loop {
                    if let Some(event) = ready.pop_front() {
                        if event.is_terminal() {
                            ready.clear();
                            decoder.reset();
                            finished = true;
                        }
                        return Some((Ok(event), (byte_stream, decoder, ready, finished)));
                    }

                    if finished {
                        return None;
                    }

                    match byte_stream.next().await {
                        Some(Ok(chunk)) => ready.extend(decoder.feed(&chunk)),
                        Some(Err(e)) => {
                            finished = true;
                            return Some((Err(e), (byte_stream, decoder, ready, finished)));
                        }
                        None => return None,
                    }
                }
            },
        )
    }
}
