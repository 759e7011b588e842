use thiserror::Error;

/// Failures decoding or encoding wire payloads.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unexpected frame: {0}")]
    Unexpected(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}
