//! # tidings-store
//!
//! In-memory state of the Tidings sync client.
//!
//! The crate holds everything the UI renders: ordered per-conversation
//! message logs with optimistic-send reconciliation, the conversation
//! directory, unread counters, presence and typing indicators. None of it
//! performs I/O; the client engine owns a single instance of each tracker
//! and is their only mutator.

pub mod conversations;
pub mod messages;
pub mod models;
pub mod presence;
pub mod typing;
pub mod unread;

mod error;

pub use conversations::ConversationDirectory;
pub use error::{Result, StoreError};
pub use messages::{MessageStore, MessageTarget, PageMerge, ReconcileOutcome};
pub use models::*;
pub use presence::PresenceTracker;
pub use typing::{TypingExpiry, TypingTracker};
pub use unread::UnreadTracker;
