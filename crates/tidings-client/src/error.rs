use thiserror::Error;

use tidings_net::NetError;
use tidings_shared::types::ConversationId;
use tidings_shared::ProtocolError;
use tidings_store::StoreError;

/// Errors surfaced by the sync client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Net(#[from] NetError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A REST call failed at the HTTP layer or returned a non-success status.
    #[error("REST error: {0}")]
    Rest(String),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine task is gone; the handle is unusable.
    #[error("Sync engine stopped")]
    EngineClosed,
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Rest(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
