//! Stream one answer from the chat endpoint to stdout.
//!
//! Run with:
//! ```bash
//! export POOKIE_API_URL="http://localhost:8000/api/v1"
//! export POOKIE_ACCESS_TOKEN="your-access-token"
//! cargo run --example chat_stream -- "What fitness goals have I set?"
//! ```

use std::io::Write;

use itertools::Itertools;
use pookie_chat::chat::{Conversation, UpdateKind};
use pookie_chat::client::{ChatClient, StaticToken};
use pookie_chat::http::HttpTransport;
use pookie_chat::options::{ChatOptions, TransportOptions};
use pookie_chat::Outcome;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let base_url = std::env::var("POOKIE_API_URL")
        .expect("POOKIE_API_URL environment variable must be set");
    let token = std::env::var("POOKIE_ACCESS_TOKEN")
        .expect("POOKIE_ACCESS_TOKEN environment variable must be set");
    let query = std::env::args()
        .skip(1)
        .join(" ");

    let transport_options = TransportOptions::new();
    let client = ChatClient::new(
        ChatOptions::new(base_url),
        transport_options.clone(),
        HttpTransport::new(&transport_options)?,
        StaticToken(token.into()),
    );

    let mut conversation = Conversation::new(client);
    conversation.send(&query)?;

    while let Some(update) = conversation.next_update().await {
        match update {
            UpdateKind::Token(text) => {
                print!("{}", text);
                std::io::stdout().flush()?;
            }
            UpdateKind::Terminal(Outcome::Done(circles)) if !circles.is_empty() => {
                println!("\n\nCircles used: {}", circles.iter().join(", "));
            }
            UpdateKind::Terminal(Outcome::Failed(message)) => {
                eprintln!("\nError: {}", message);
            }
            _ => {}
        }
    }
    println!();

    Ok(())
}
