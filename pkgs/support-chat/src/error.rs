//! Error types for the chat core

use crate::events::MessageStatus;
use thiserror::Error;

/// Errors that can occur in chat operations
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("File too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("Illegal status transition for message {local_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        local_id: String,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("Message already exists: {0}")]
    DuplicateMessage(String),
    #[error("Message {0} is not in a retryable state")]
    MessageNotRetryable(String),
    #[error("Upload task not found: {0}")]
    TaskNotFound(String),
    #[error("Upload task {0} is not in a retryable state")]
    TaskNotRetryable(String),
    #[error("Session expired, start a new chat to continue")]
    SessionExpired,
    #[error("Transport closed")]
    TransportClosed,
    #[error("Outbound queue full: {0} events waiting for reconnect")]
    OutboundQueueFull(usize),
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Upload canceled")]
    Canceled,
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl From<reqwest::Error> for ChatError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => ChatError::Http {
                status: status.as_u16(),
                message: error.to_string(),
            },
            None => ChatError::Network(error.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
