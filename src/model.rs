//! Data models for chat requests and transcript messages.

use serde::{Deserialize, Serialize};

use crate::client::ClientError;

/// Longest query the chat endpoint accepts, in characters.
pub const MAX_QUERY_CHARS: usize = 500;

/// Accepted range of the `top_k` hint.
pub const TOP_K_RANGE: std::ops::RangeInclusive<u32> = 1..=50;

/// JSON body of a chat-streaming request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    /// The user's question
    pub query: String,

    /// Number of items the backend should retrieve
    pub top_k: u32,
}

impl ChatRequest {
    /// Build a validated request.
    ///
    /// Fails with [`ClientError::InvalidRequest`] for blank or overlong queries
    /// and for a `top_k` outside of 1..=50.
    pub fn new(query: impl Into<String>, top_k: u32) -> Result<Self, ClientError> {
        let query = query.into();
        validate_query(&query)?;
        if !TOP_K_RANGE.contains(&top_k) {
            return Err(ClientError::InvalidRequest(format!(
                "top_k must be between {} and {}, got {}",
                TOP_K_RANGE.start(),
                TOP_K_RANGE.end(),
                top_k
            )));
        }
        Ok(Self { query, top_k })
    }
}

/// Check that a query is non-blank and within [`MAX_QUERY_CHARS`].
pub fn validate_query(query: &str) -> Result<(), ClientError> {
    if query.trim().is_empty() {
        return Err(ClientError::InvalidRequest("query is empty".to_string()));
    }
    let chars = query.chars().count();
    if chars > MAX_QUERY_CHARS {
        return Err(ClientError::InvalidRequest(format!(
            "query is {} characters, at most {} allowed",
            chars, MAX_QUERY_CHARS
        )));
    }
    Ok(())
}

/// Role of the message sender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single message in the chat transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,

    /// Sources that influenced an assistant answer, in display order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub circles_used: Vec<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            circles_used: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, circles_used: Vec<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            circles_used,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_request_body_shape() {
        let request = ChatRequest::new("What fitness goals have I set?", 10).unwrap();
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"query": "What fitness goals have I set?", "top_k": 10})
        );
    }

    #[test]
    fn test_chat_request_rejects_blank_query() {
        assert!(matches!(
            ChatRequest::new("   ", 10),
            Err(ClientError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_chat_request_query_length_counts_chars() {
        assert!(ChatRequest::new("é".repeat(MAX_QUERY_CHARS), 10).is_ok());
        assert!(ChatRequest::new("a".repeat(MAX_QUERY_CHARS + 1), 10).is_err());
    }

    #[test]
    fn test_chat_request_top_k_bounds() {
        assert!(ChatRequest::new("hi", 0).is_err());
        assert!(ChatRequest::new("hi", 1).is_ok());
        assert!(ChatRequest::new("hi", 50).is_ok());
        assert!(ChatRequest::new("hi", 51).is_err());
    }

    #[test]
    fn test_assistant_message() {
        let message = ChatMessage::assistant("Hello", vec!["Fitness".into()]);
        assert!(!message.is_user());
        assert_eq!(message.circles_used, vec!["Fitness".to_string()]);
        assert!(ChatMessage::user("hi").is_user());
    }
}
