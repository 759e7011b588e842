use thiserror::Error;

/// Errors produced by the connection layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// `send` was called while the session is not established.
    #[error("Not connected")]
    NotConnected,

    /// The command queue to the connection task is full.
    #[error("Outbound queue full")]
    QueueFull,

    /// The connection task has terminated.
    #[error("Connection task closed")]
    Closed,

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<tidings_shared::ProtocolError> for NetError {
    fn from(e: tidings_shared::ProtocolError) -> Self {
        NetError::Protocol(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;
