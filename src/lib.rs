//! # pookie-chat - streaming chat transport
//!
//! Client side of a chat endpoint that answers over Server-Sent Events.
//! A request is a `POST` with a bearer token and a JSON body; the answer
//! arrives as a `text/event-stream` of JSON frames:
//!
//! ```text
//! data: {"token": "Based"}
//!
//! data: {"token": " on your Fitness circle..."}
//!
//! data: {"done": true, "circles_used": ["Fitness", "Career"]}
//! ```
//!
//! ## Features
//! - Incremental frame decoding tolerant of arbitrary chunk boundaries
//! - A session state machine with exactly-once completion and cancellation
//! - Async driver on tokio, one active stream at a time
//! - Consumer-side conversation state fed through an ordered channel
//!
//! ## Architecture
//!
//! - **[`sse::FrameDecoder`]**: bytes in, [`sse::SseEvent`]s out
//! - **[`session::SessionCore`]**: lifecycle, accumulated text, callbacks
//! - **[`stream::StreamingSession`]**: opens requests and pumps bytes into a core
//! - **[`chat::Conversation`]**: transcript and in-progress answer for a UI
//! - **[`client::Transport`]** / **[`client::CredentialProvider`]**: the network
//!   and the identity provider, with [`http::HttpTransport`] as the reqwest
//!   implementation
//!
//! ## Example
//! ```no_run
//! use pookie_chat::chat::Conversation;
//! use pookie_chat::client::{ChatClient, StaticToken};
//! use pookie_chat::http::HttpTransport;
//! use pookie_chat::options::{ChatOptions, TransportOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport_options = TransportOptions::new();
//!     let client = ChatClient::new(
//!         ChatOptions::new("https://api.example.com"),
//!         transport_options.clone(),
//!         HttpTransport::new(&transport_options)?,
//!         StaticToken("access-token".into()),
//!     );
//!
//!     let mut conversation = Conversation::new(client);
//!     conversation.send("What fitness goals have I set?")?;
//!     while conversation.next_update().await.is_some() {}
//!
//!     println!("{:?}", conversation.messages());
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod client;
pub mod http;
pub mod model;
pub mod options;
pub mod session;
pub mod sse;
pub mod stream;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use chat::Conversation;
pub use client::{ChatClient, ClientError, CredentialProvider, Transport};
pub use model::{ChatMessage, ChatRequest};
pub use session::{Outcome, SessionState, StreamHandler};
pub use sse::SseEvent;
pub use stream::StreamingSession;
