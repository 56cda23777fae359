//! Test doubles for the transport, credentials and consumer callbacks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use reqwest::StatusCode;
use tokio::sync::mpsc;

use crate::client::{ByteStream, ClientError, CredentialProvider, StreamRequest, Transport};
use crate::model::ChatMessage;
use crate::options::SecretString;
use crate::session::{Outcome, StreamHandler};

type Chunk = Result<Bytes, ClientError>;

#[derive(Default)]
struct MockState {
    requests: Vec<StreamRequest>,
    streams: VecDeque<mpsc::UnboundedReceiver<Chunk>>,
    open_delay: Option<Duration>,
    open_status: Option<StatusCode>,
}

/// Transport whose response bodies are driven by [`MockFeed`]s.
///
/// Every `open` consumes the next queued body, in order.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// A transport with one queued body.
    pub fn new() -> (Self, MockFeed) {
        let transport = Self::default();
        let feed = transport.add_stream();
        (transport, feed)
    }

    /// Queue another response body.
    pub fn add_stream(&self) -> MockFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().streams.push_back(rx);
        MockFeed { tx }
    }

    pub fn with_open_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().open_delay = Some(delay);
        self
    }

    pub fn with_status(self, status: StatusCode) -> Self {
        self.state.lock().unwrap().open_status = Some(status);
        self
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, request: StreamRequest) -> Result<ByteStream, ClientError> {
        let (delay, status) = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(request);
            (state.open_delay, state.open_status)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = status {
            return Err(ClientError::Status {
                status,
                body: String::new(),
            });
        }

        let rx = self
            .state
            .lock()
            .unwrap()
            .streams
            .pop_front()
            .ok_or_else(|| ClientError::Transport("no stream queued".into()))?;
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })))
    }
}

/// Sending side of a mock response body. Dropping it ends the body.
pub struct MockFeed {
    tx: mpsc::UnboundedSender<Chunk>,
}

impl MockFeed {
    pub fn chunk(&self, text: &str) {
        self.bytes(text.as_bytes());
    }

    pub fn bytes(&self, bytes: &[u8]) {
        let _ = self.tx.send(Ok(Bytes::copy_from_slice(bytes)));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.tx.send(Err(ClientError::Transport(message.into())));
    }

    /// Whether the receiving body has been dropped (the request aborted).
    pub fn is_aborted(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Credentials for a signed-out user.
pub struct NoSession;

#[async_trait]
impl CredentialProvider for NoSession {
    async fn token(&self) -> Result<SecretString, ClientError> {
        Err(ClientError::AuthRequired)
    }
}

/// One consumer callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Token(String),
    Message(ChatMessage),
    Terminal(Outcome),
    Complete,
}

/// Handler recording every callback, shareable across threads.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn completions(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Complete))
            .count()
    }

    /// Wait until the session completed, or panic after a second.
    pub async fn completed(&self) {
        for _ in 0..200 {
            if self.completions() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session did not complete: {:?}", self.calls());
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl StreamHandler for Recorder {
    fn on_token(&mut self, text: &str) {
        self.push(Call::Token(text.to_string()));
    }

    fn on_terminal(&mut self, outcome: &Outcome) {
        self.push(Call::Terminal(outcome.clone()));
    }

    fn on_message(&mut self, message: ChatMessage) {
        self.push(Call::Message(message));
    }

    fn on_complete(&mut self) {
        self.push(Call::Complete);
    }
}
