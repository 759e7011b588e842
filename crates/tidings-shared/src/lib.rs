//! Types and wire protocol shared by every Tidings crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use types::{
    ClientRef, ConnectionState, ConnectionStatus, ConversationId, ConversationKind, MessageKind,
    MessageStatus, ServerMessageId, UserId,
};
