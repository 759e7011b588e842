use thiserror::Error;

use tidings_shared::types::{ClientRef, ConversationId, MessageStatus};

/// Errors produced by the store layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    #[error("Unknown client ref: {0}")]
    UnknownClientRef(ClientRef),

    /// A status change that would move a message backwards.
    #[error("Illegal status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
