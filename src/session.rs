//! Streaming session state machine.
//!
//! [`SessionCore`] owns the frame decoder and the accumulated response text
//! of one chat request. It is fed raw bytes and transport signals and
//! dispatches the resulting events to a [`StreamHandler`]. It does no I/O;
//! see [`crate::stream::StreamingSession`] for the driver.

use itertools::Itertools;
use tracing::{debug, info};

use crate::model::ChatMessage;
use crate::sse::{FrameDecoder, SseEvent};

/// Lifecycle of a streaming session.
///
/// `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Completed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Cancelled)
    }
}

/// How a stream ended, as reported to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The answer finished; sources that influenced it, in display order
    Done(Vec<String>),
    /// The server or the transport reported a failure
    Failed(String),
}

/// Consumer callbacks of a streaming session.
///
/// For every decoded event exactly one of `on_token` / `on_terminal` is
/// called, in arrival order. `on_complete` is called at most once, last.
pub trait StreamHandler: Send {
    /// A content fragment arrived.
    fn on_token(&mut self, text: &str);

    /// The stream reached a terminal event.
    fn on_terminal(&mut self, outcome: &Outcome);

    /// The accumulated response, finalized just before `on_terminal`.
    /// Not called when nothing was accumulated.
    fn on_message(&mut self, _message: ChatMessage) {}

    /// The session completed.
    fn on_complete(&mut self);
}

impl<H: StreamHandler + ?Sized> StreamHandler for Box<H> {
    fn on_token(&mut self, text: &str) {
        (**self).on_token(text)
    }

    fn on_terminal(&mut self, outcome: &Outcome) {
        (**self).on_terminal(outcome)
    }

    fn on_message(&mut self, message: ChatMessage) {
        (**self).on_message(message)
    }

    fn on_complete(&mut self) {
        (**self).on_complete()
    }
}

/// State of one chat request: decoder buffer, accumulated text, lifecycle.
///
/// A core starts `Active`. Once it leaves `Active` it never dispatches
/// again; a new request needs a new core.
#[derive(Debug)]
pub struct SessionCore<H> {
    id: u64,
    state: SessionState,
    decoder: FrameDecoder,
    accumulated: String,
    handler: H,
}

impl<H: StreamHandler> SessionCore<H> {
    pub fn new(id: u64, handler: H) -> Self {
        Self {
            id,
            state: SessionState::Active,
            decoder: FrameDecoder::new(),
            accumulated: String::new(),
            handler,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Concatenation of the token fragments received so far.
    pub fn accumulated_text(&self) -> &str {
        &self.accumulated
    }

    /// Feed a raw chunk. Events decoded after a terminal event, including
    /// ones from the same chunk, are dropped.
    pub fn feed(&mut self, chunk: &[u8]) {
        if !self.is_active() {
            return;
        }
        for event in self.decoder.feed(chunk) {
            if !self.is_active() {
                break;
            }
            self.dispatch(event);
        }
    }

    /// The transport reported end of stream.
    pub fn close(&mut self) {
        if !self.is_active() {
            return;
        }
        if !self.accumulated.is_empty() {
            debug!(id = self.id, "stream closed before done, partial response kept");
        }
        self.finish(None);
    }

    /// The transport failed; reported to the consumer as an error event.
    pub fn fail(&mut self, message: impl Into<String>) {
        if !self.is_active() {
            return;
        }
        self.dispatch(SseEvent::Error(message.into()));
    }

    /// Cancel the session without notifying the consumer.
    ///
    /// Returns `false` when the session had already ended.
    pub fn cancel(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        info!(id = self.id, "chat stream cancelled");
        self.state = SessionState::Cancelled;
        self.decoder.reset();
        self.accumulated.clear();
        true
    }

    fn dispatch(&mut self, event: SseEvent) {
        match event {
            SseEvent::Token(text) => {
                self.accumulated.push_str(&text);
                self.handler.on_token(&text);
            }
            SseEvent::Done(sources) => self.finish(Some(Outcome::Done(sources))),
            SseEvent::Error(message) => self.finish(Some(Outcome::Failed(message))),
        }
    }

    fn finish(&mut self, outcome: Option<Outcome>) {
        self.state = SessionState::Completed;
        self.decoder.reset();

        if let Some(outcome) = outcome {
            if let Outcome::Done(sources) = &outcome {
                debug!(id = self.id, circles = %sources.iter().join(", "), "chat stream done");
            }
            let text = std::mem::take(&mut self.accumulated);
            if !text.is_empty() {
                let sources = match &outcome {
                    Outcome::Done(sources) => sources.clone(),
                    Outcome::Failed(_) => Vec::new(),
                };
                self.handler.on_message(ChatMessage::assistant(text, sources));
            }
            self.handler.on_terminal(&outcome);
        }

        info!(id = self.id, "chat stream completed");
        self.handler.on_complete();
    }
}
