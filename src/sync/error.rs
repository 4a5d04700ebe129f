use thiserror::Error;

use crate::models::Draft;

/// Errors surfaced by the synchronization engine.
///
/// None of these are fatal to the host: the worst case is "messaging unavailable".
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// Socket could not be opened or dropped mid-operation
    #[error("Transport error: {0}")]
    Transport(String),

    /// No live socket; send actions are disabled
    #[error("Not connected")]
    NotConnected,

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// REST collaborator answered with a non-2xx status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    /// Persisting a message failed; the draft is returned so it can be restored
    #[error("Send failed: {reason}")]
    SendFailed { draft: Draft, reason: String },

    #[error("Message has neither text nor attachments")]
    EmptyMessage,

    #[error("No conversation is open")]
    NoOpenConversation,

    /// Participant id cannot form a conversation id
    #[error("Invalid participant id {0}")]
    InvalidAddress(String),

    #[error("Unknown notification {0}")]
    UnknownNotification(String),

    #[error("Mark-read failed: {0}")]
    MarkReadFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}
