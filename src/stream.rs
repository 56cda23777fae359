//! Async driver of streaming sessions.
//!
//! A [`StreamingSession`] runs at most one chat stream at a time. Each
//! `start` creates a fresh [`SessionCore`] and spawns a task that opens the
//! request and pumps body chunks into the core. Cancellation takes the same
//! lock the pump takes before dispatching, so once `cancel` returns no
//! callback of that session runs again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::client::{ChatClient, ClientError, CredentialProvider, Transport};
use crate::session::{Outcome, SessionCore, SessionState, StreamHandler};

type SharedCore = Arc<Mutex<SessionCore<Box<dyn StreamHandler>>>>;

fn lock(core: &SharedCore) -> MutexGuard<'_, SessionCore<Box<dyn StreamHandler>>> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveStream {
    core: SharedCore,
    task: Option<JoinHandle<()>>,
}

impl ActiveStream {
    fn cancel(&self) -> bool {
        let cancelled = lock(&self.core).cancel();
        // Dropping the body inside the task aborts the request
        if let Some(task) = &self.task {
            task.abort();
        }
        cancelled
    }
}

/// One chat stream at a time, driven on the tokio runtime.
///
/// # Example
/// ```no_run
/// use pookie_chat::client::{ChatClient, StaticToken};
/// use pookie_chat::http::HttpTransport;
/// use pookie_chat::options::{ChatOptions, TransportOptions};
/// use pookie_chat::stream::StreamingSession;
///
/// # async fn run() -> Result<(), pookie_chat::ClientError> {
/// let transport_options = TransportOptions::new();
/// let client = ChatClient::new(
///     ChatOptions::new("https://api.example.com"),
///     transport_options.clone(),
///     HttpTransport::new(&transport_options)?,
///     StaticToken("token".into()),
/// );
/// let mut session = StreamingSession::new(client);
/// session.start_with(
///     "What fitness goals have I set?",
///     |token| print!("{}", token),
///     |outcome| println!("\n{:?}", outcome),
///     || println!("complete"),
/// );
/// # Ok(())
/// # }
/// ```
pub struct StreamingSession<T, C> {
    client: Arc<ChatClient<T, C>>,
    next_id: u64,
    current: Option<ActiveStream>,
}

impl<T, C> StreamingSession<T, C>
where
    T: Transport + 'static,
    C: CredentialProvider + 'static,
{
    pub fn new(client: ChatClient<T, C>) -> Self {
        Self::with_shared_client(Arc::new(client))
    }

    pub fn with_shared_client(client: Arc<ChatClient<T, C>>) -> Self {
        Self {
            client,
            next_id: 0,
            current: None,
        }
    }

    pub fn client(&self) -> &ChatClient<T, C> {
        &self.client
    }

    /// Start streaming the answer to `query` into `handler`.
    ///
    /// An active previous stream is cancelled first. Failures (missing
    /// credentials, invalid query, transport errors, timeouts) are reported
    /// through the handler as a terminal [`Outcome::Failed`], never returned.
    /// The stream runs on the current tokio runtime; without one the
    /// session fails right away. Returns the id of the new session.
    pub fn start<H>(&mut self, query: impl Into<String>, handler: H) -> u64
    where
        H: StreamHandler + 'static,
    {
        if self.cancel() {
            info!("previous chat stream replaced");
        }

        self.next_id += 1;
        let id = self.next_id;
        let query = query.into();
        info!(id, "starting chat stream");

        let handler: Box<dyn StreamHandler> = Box::new(handler);
        let core = Arc::new(Mutex::new(SessionCore::new(id, handler)));
        let task = match Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(pump(
                Arc::clone(&self.client),
                query,
                Arc::clone(&core),
            ))),
            Err(e) => {
                let error = ClientError::Config(format!("no async runtime: {}", e));
                warn!(error = %error, "chat stream not started");
                lock(&core).fail(error.to_string());
                None
            }
        };
        self.current = Some(ActiveStream { core, task });
        id
    }

    /// [`start`](Self::start) with closures for each callback.
    pub fn start_with<FT, FO, FC>(
        &mut self,
        query: impl Into<String>,
        on_token: FT,
        on_terminal: FO,
        on_complete: FC,
    ) -> u64
    where
        FT: FnMut(&str) + Send + 'static,
        FO: FnMut(&Outcome) + Send + 'static,
        FC: FnOnce() + Send + 'static,
    {
        self.start(query, FnHandler::new(on_token, on_terminal, on_complete))
    }

    /// Cancel the active stream. No callback of it fires afterwards.
    ///
    /// Returns `false` when there was nothing active to cancel.
    pub fn cancel(&mut self) -> bool {
        self.current.as_ref().is_some_and(ActiveStream::cancel)
    }

    pub fn state(&self) -> SessionState {
        match &self.current {
            Some(active) => lock(&active.core).state(),
            None => SessionState::Idle,
        }
    }

    /// Id of the most recently started session.
    pub fn session_id(&self) -> Option<u64> {
        self.current.as_ref().map(|active| lock(&active.core).id())
    }

    /// Token text accumulated by the active session so far.
    pub fn accumulated_text(&self) -> String {
        self.current
            .as_ref()
            .map(|active| lock(&active.core).accumulated_text().to_string())
            .unwrap_or_default()
    }
}

impl<T, C> Drop for StreamingSession<T, C> {
    fn drop(&mut self) {
        if let Some(active) = self.current.take() {
            active.cancel();
        }
    }
}

async fn pump<T, C>(client: Arc<ChatClient<T, C>>, query: String, core: SharedCore)
where
    T: Transport,
    C: CredentialProvider,
{
    let mut body = match client.open(&query).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "chat stream failed to open");
            lock(&core).fail(e.to_string());
            return;
        }
    };

    loop {
        let next = body.next().await;
        let active = {
            let mut session = lock(&core);
            match next {
                Some(Ok(chunk)) => {
                    trace!(len = chunk.len(), "chat stream chunk");
                    session.feed(&chunk);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "chat stream failed");
                    session.fail(e.to_string());
                }
                None => session.close(),
            }
            session.is_active()
        };
        if !active {
            break;
        }
    }
}

/// [`StreamHandler`] made of closures.
pub struct FnHandler<FT, FO, FC> {
    on_token: FT,
    on_terminal: FO,
    on_complete: Option<FC>,
}

impl<FT, FO, FC> FnHandler<FT, FO, FC>
where
    FT: FnMut(&str) + Send,
    FO: FnMut(&Outcome) + Send,
    FC: FnOnce() + Send,
{
    pub fn new(on_token: FT, on_terminal: FO, on_complete: FC) -> Self {
        Self {
            on_token,
            on_terminal,
            on_complete: Some(on_complete),
        }
    }
}

impl<FT, FO, FC> StreamHandler for FnHandler<FT, FO, FC>
where
    FT: FnMut(&str) + Send,
    FO: FnMut(&Outcome) + Send,
    FC: FnOnce() + Send,
{
    fn on_token(&mut self, text: &str) {
        (self.on_token)(text)
    }

    fn on_terminal(&mut self, outcome: &Outcome) {
        (self.on_terminal)(outcome)
    }

    fn on_complete(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StaticToken;
    use crate::model::ChatMessage;
    use crate::options::{ChatOptions, TransportOptions};
    use crate::testing::{Call, MockFeed, MockTransport, NoSession, Recorder};
    use reqwest::StatusCode;
    use std::time::Duration;

    const SCENARIO: &str = "data: {\"token\": \"Hel\"}\n\ndata: {\"token\": \"lo\"}\n\ndata: {\"done\": true, \"circles_used\": [\"c1\"]}\n\n";

    fn session(transport: MockTransport) -> StreamingSession<MockTransport, StaticToken> {
        StreamingSession::new(ChatClient::new(
            ChatOptions::new("https://api.example.com"),
            TransportOptions::new(),
            transport,
            StaticToken("secret".into()),
        ))
    }

    async fn opened(transport: &MockTransport, count: usize) {
        for _ in 0..200 {
            if transport.requests().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transport was not opened {} times", count);
    }

    async fn aborted(feed: &MockFeed) {
        for _ in 0..200 {
            if feed.is_aborted() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("request was not aborted");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_streams_scenario_end_to_end() {
        let (transport, feed) = MockTransport::new();
        let mut session = session(transport.clone());
        let recorder = Recorder::default();
        assert_eq!(session.state(), SessionState::Idle);

        session.start("How am I doing?", recorder.clone());
        assert_eq!(session.state(), SessionState::Active);
        feed.chunk(SCENARIO);
        recorder.completed().await;

        assert_eq!(
            recorder.calls(),
            vec![
                Call::Token("Hel".into()),
                Call::Token("lo".into()),
                Call::Message(ChatMessage::assistant("Hello", vec!["c1".into()])),
                Call::Terminal(Outcome::Done(vec!["c1".into()])),
                Call::Complete,
            ]
        );
        assert_eq!(session.state(), SessionState::Completed);

        let request = &transport.requests()[0];
        assert_eq!(request.body.query, "How am I doing?");
        assert_eq!(request.body.top_k, 10);
        assert_eq!(request.bearer.expose_secret(), "secret");
    }

    #[tokio::test]
    async fn test_split_delivery_and_trailing_bytes() {
        let (transport, feed) = MockTransport::new();
        let mut session = session(transport);
        let recorder = Recorder::default();
        session.start("hi", recorder.clone());

        for byte in SCENARIO.as_bytes() {
            feed.bytes(&[*byte]);
        }
        feed.chunk("data: {\"token\": \"after done\"}\n\n");
        recorder.completed().await;
        aborted(&feed).await;
        settle().await;

        assert_eq!(recorder.calls().len(), 5);
        assert_eq!(recorder.completions(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_any_bytes() {
        let (transport, feed) = MockTransport::new();
        let mut session = session(transport);
        let recorder = Recorder::default();

        session.start("hi", recorder.clone());
        assert!(session.cancel());
        feed.chunk(SCENARIO);
        settle().await;

        assert!(recorder.calls().is_empty());
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_aborts_open_stream() {
        let (transport, feed) = MockTransport::new();
        let mut session = session(transport.clone());
        let recorder = Recorder::default();

        session.start("hi", recorder.clone());
        opened(&transport, 1).await;
        feed.chunk("data: {\"token\": \"a\"}\n\n");
        for _ in 0..200 {
            if !recorder.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(session.cancel());
        assert!(!session.cancel());
        feed.chunk("data: {\"done\": true}\n\n");
        settle().await;

        assert_eq!(recorder.calls(), vec![Call::Token("a".into())]);
        aborted(&feed).await;
        assert_eq!(session.accumulated_text(), "");
    }

    #[tokio::test]
    async fn test_cancel_when_idle_or_completed() {
        let (transport, feed) = MockTransport::new();
        let mut session = session(transport);
        assert!(!session.cancel());

        let recorder = Recorder::default();
        session.start("hi", recorder.clone());
        feed.chunk("data: {\"done\": true}\n\n");
        recorder.completed().await;

        assert!(!session.cancel());
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let (transport, _feed) = MockTransport::new();
        let mut session = StreamingSession::new(ChatClient::new(
            ChatOptions::new("https://api.example.com"),
            TransportOptions::new(),
            transport.clone(),
            NoSession,
        ));
        let recorder = Recorder::default();
        session.start("hi", recorder.clone());
        recorder.completed().await;

        assert_eq!(
            recorder.calls(),
            vec![
                Call::Terminal(Outcome::Failed("Authentication required".into())),
                Call::Complete
            ]
        );
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let (transport, _feed) = MockTransport::new();
        let mut session = session(transport.with_status(StatusCode::SERVICE_UNAVAILABLE));
        let recorder = Recorder::default();
        session.start("hi", recorder.clone());
        recorder.completed().await;

        assert_eq!(
            recorder.calls()[0],
            Call::Terminal(Outcome::Failed(
                ClientError::Status {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    body: String::new()
                }
                .to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_transport_failure_mid_stream() {
        let (transport, feed) = MockTransport::new();
        let mut session = session(transport);
        let recorder = Recorder::default();
        session.start("hi", recorder.clone());

        feed.chunk("data: {\"token\": \"par\"}\n\ndata: {\"tok");
        feed.fail("connection reset");
        recorder.completed().await;

        assert_eq!(
            recorder.calls(),
            vec![
                Call::Token("par".into()),
                Call::Message(ChatMessage::assistant("par", vec![])),
                Call::Terminal(Outcome::Failed("Transport error: connection reset".into())),
                Call::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_closed_without_done() {
        let (transport, feed) = MockTransport::new();
        let mut session = session(transport);
        let recorder = Recorder::default();
        session.start("hi", recorder.clone());

        feed.chunk("data: {\"token\": \"par\"}\n\n");
        drop(feed);
        recorder.completed().await;

        assert_eq!(
            recorder.calls(),
            vec![Call::Token("par".into()), Call::Complete]
        );
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_stream_timeout_is_terminal_error() {
        let (transport, feed) = MockTransport::new();
        let mut session = StreamingSession::new(ChatClient::new(
            ChatOptions::new("https://api.example.com"),
            TransportOptions::new().with_stream_timeout(Duration::from_millis(20)),
            transport,
            StaticToken("secret".into()),
        ));
        let recorder = Recorder::default();
        session.start("hi", recorder.clone());
        recorder.completed().await;

        assert!(matches!(
            &recorder.calls()[0],
            Call::Terminal(Outcome::Failed(message)) if message.starts_with("stream timed out")
        ));
        drop(feed);
    }

    #[tokio::test]
    async fn test_last_start_wins() {
        let (transport, first_feed) = MockTransport::new();
        let second_feed = transport.add_stream();
        let mut session = session(transport.clone());
        let first = Recorder::default();
        let second = Recorder::default();

        let first_id = session.start("first", first.clone());
        opened(&transport, 1).await;
        let second_id = session.start("second", second.clone());
        assert!(second_id > first_id);
        opened(&transport, 2).await;

        first_feed.chunk(SCENARIO);
        second_feed.chunk("data: {\"token\": \"2\"}\n\ndata: {\"done\": true}\n\n");
        second.completed().await;
        aborted(&first_feed).await;

        assert!(first.calls().is_empty());
        assert_eq!(second.completions(), 1);
        assert_eq!(session.session_id(), Some(second_id));
    }

    #[tokio::test]
    async fn test_start_with_closures() {
        let (transport, feed) = MockTransport::new();
        let mut session = session(transport);
        let text = Arc::new(Mutex::new(String::new()));
        let outcome = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let text_sink = Arc::clone(&text);
        let outcome_sink = Arc::clone(&outcome);
        session.start_with(
            "hi",
            move |token| text_sink.lock().unwrap().push_str(token),
            move |o| *outcome_sink.lock().unwrap() = Some(o.clone()),
            move || {
                let _ = done_tx.send(());
            },
        );
        feed.chunk(SCENARIO);
        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*text.lock().unwrap(), "Hello");
        assert_eq!(
            *outcome.lock().unwrap(),
            Some(Outcome::Done(vec!["c1".into()]))
        );
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let (transport, feed) = MockTransport::new();
        let mut session = session(transport.clone());
        let recorder = Recorder::default();
        session.start("hi", recorder.clone());
        opened(&transport, 1).await;

        drop(session);
        feed.chunk(SCENARIO);
        aborted(&feed).await;
        settle().await;

        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let (transport, _feed) = MockTransport::new();
        let mut session = session(transport.clone());
        let recorder = Recorder::default();

        session.start("hi", recorder.clone());

        let calls = recorder.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(
            &calls[0],
            Call::Terminal(Outcome::Failed(message)) if message.starts_with("Configuration error: no async runtime")
        ));
        assert_eq!(calls[1], Call::Complete);
        assert_eq!(session.state(), SessionState::Completed);
        assert!(!session.cancel());
        assert!(transport.requests().is_empty());
    }
}
