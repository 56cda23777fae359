//! Consumer-side chat state.
//!
//! Session callbacks run on the task that reads the response body. A
//! [`Conversation`] hands them over to its owner's context through an
//! ordered channel and only mutates its visible state when the owner calls
//! [`Conversation::next_update`] or [`Conversation::drain_updates`].

use tokio::sync::mpsc;
use tracing::debug;

use crate::client::{ChatClient, ClientError, CredentialProvider, Transport};
use crate::model::{validate_query, ChatMessage};
use crate::session::{Outcome, StreamHandler};
use crate::stream::StreamingSession;

/// A session callback, as delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    Token(String),
    Message(ChatMessage),
    Terminal(Outcome),
    Complete,
}

/// A session callback tagged with the conversation generation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdate {
    pub generation: u64,
    pub kind: UpdateKind,
}

/// [`StreamHandler`] forwarding every callback over a channel.
pub struct ChannelHandler {
    generation: u64,
    tx: mpsc::UnboundedSender<StreamUpdate>,
}

impl ChannelHandler {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<StreamUpdate>) -> Self {
        Self { generation, tx }
    }

    fn send(&self, kind: UpdateKind) {
        let update = StreamUpdate {
            generation: self.generation,
            kind,
        };
        if self.tx.send(update).is_err() {
            debug!(generation = self.generation, "conversation dropped, update discarded");
        }
    }
}

impl StreamHandler for ChannelHandler {
    fn on_token(&mut self, text: &str) {
        self.send(UpdateKind::Token(text.to_string()));
    }

    fn on_terminal(&mut self, outcome: &Outcome) {
        self.send(UpdateKind::Terminal(outcome.clone()));
    }

    fn on_message(&mut self, message: ChatMessage) {
        self.send(UpdateKind::Message(message));
    }

    fn on_complete(&mut self) {
        self.send(UpdateKind::Complete);
    }
}

/// Chat transcript plus the in-progress streamed answer.
///
/// # Example
/// ```ignore
/// let mut conversation = Conversation::new(client);
/// conversation.send("What fitness goals have I set?")?;
/// while let Some(update) = conversation.next_update().await {
///     render(&conversation, update);
/// }
/// ```
pub struct Conversation<T, C> {
    session: StreamingSession<T, C>,
    generation: u64,
    tx: mpsc::UnboundedSender<StreamUpdate>,
    rx: mpsc::UnboundedReceiver<StreamUpdate>,
    messages: Vec<ChatMessage>,
    current_response: String,
    is_streaming: bool,
    error_message: Option<String>,
}

impl<T, C> Conversation<T, C>
where
    T: Transport + 'static,
    C: CredentialProvider + 'static,
{
    pub fn new(client: ChatClient<T, C>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session: StreamingSession::new(client),
            generation: 0,
            tx,
            rx,
            messages: Vec::new(),
            current_response: String::new(),
            is_streaming: false,
            error_message: None,
        }
    }

    /// Ask a question and start streaming the answer.
    ///
    /// Blank or overlong queries are rejected without changing any state.
    /// A stream still in progress is cancelled.
    pub fn send(&mut self, query: &str) -> Result<(), ClientError> {
        validate_query(query)?;

        self.messages.push(ChatMessage::user(query));
        self.current_response.clear();
        self.error_message = None;
        self.is_streaming = true;
        self.generation += 1;

        let handler = ChannelHandler::new(self.generation, self.tx.clone());
        self.session.start(query, handler);
        Ok(())
    }

    /// Wait for the next update of the current stream and apply it.
    ///
    /// Returns `None` once no stream is in progress.
    pub async fn next_update(&mut self) -> Option<UpdateKind> {
        while self.is_streaming {
            let update = self.rx.recv().await?;
            if let Some(kind) = self.apply(update) {
                return Some(kind);
            }
        }
        None
    }

    /// Apply every update already delivered, without waiting.
    /// Returns how many were applied.
    pub fn drain_updates(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.rx.try_recv() {
            if self.apply(update).is_some() {
                applied += 1;
            }
        }
        applied
    }

    /// Stop the current stream. Updates it already queued are discarded.
    pub fn cancel(&mut self) {
        self.session.cancel();
        self.generation += 1;
        self.is_streaming = false;
        self.current_response.clear();
    }

    /// Forget the transcript. A stream in progress keeps running.
    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.current_response.clear();
        self.error_message = None;
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Answer text streamed so far and not yet finalized.
    pub fn current_response(&self) -> &str {
        &self.current_response
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    fn apply(&mut self, update: StreamUpdate) -> Option<UpdateKind> {
        if update.generation != self.generation {
            debug!(
                generation = update.generation,
                current = self.generation,
                "discarding stale update"
            );
            return None;
        }

        match &update.kind {
            UpdateKind::Token(text) => self.current_response.push_str(text),
            UpdateKind::Message(message) => {
                self.messages.push(message.clone());
                self.current_response.clear();
            }
            UpdateKind::Terminal(Outcome::Failed(message)) => {
                self.error_message = Some(message.clone());
            }
            UpdateKind::Terminal(Outcome::Done(_)) => {}
            UpdateKind::Complete => {
                self.current_response.clear();
                self.is_streaming = false;
            }
        }
        Some(update.kind)
    }
}
