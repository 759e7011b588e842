//! Domain models held in memory by the store.
//!
//! Every struct derives `Serialize` so it can be handed directly to the UI
//! layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tidings_shared::protocol::{ConversationSummary, MessageBody};
use tidings_shared::types::{
    ClientRef, ConversationId, ConversationKind, MessageKind, MessageStatus, ServerMessageId,
    UserId,
};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A chat thread, direct or group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    /// Other participant of a direct conversation. Lookup only, never a key.
    pub peer_id: Option<UserId>,
    pub last_message_preview: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Stand-in for a conversation first seen through a message, before the
    /// list endpoint has described it.
    pub fn placeholder(id: ConversationId, kind: ConversationKind) -> Self {
        Self {
            id,
            kind,
            display_name: format!("#{id}"),
            avatar_ref: None,
            peer_id: None,
            last_message_preview: None,
            last_activity_at: None,
        }
    }
}

impl From<ConversationSummary> for Conversation {
    fn from(s: ConversationSummary) -> Self {
        Self {
            id: s.conversation_id,
            kind: s.kind,
            display_name: s.display_name,
            avatar_ref: s.avatar_ref,
            peer_id: s.peer_id,
            last_message_preview: s.last_message_preview,
            last_activity_at: s.last_activity_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// What the user typed, before it becomes a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub body: MessageBody,
    pub kind: MessageKind,
}

impl Draft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: MessageBody::text(body),
            kind: MessageKind::Text,
        }
    }
}

/// An entry in a conversation's ordered log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Assigned by the backend; `None` until the send is confirmed.
    pub server_id: Option<ServerMessageId>,
    /// Present on entries this client created.
    pub client_ref: Option<ClientRef>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub kind: MessageKind,
    /// Client clock for optimistic entries, server clock once confirmed.
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub is_mine: bool,
    pub recalled: bool,
    /// Why the send failed, for FAILED entries.
    pub failure: Option<String>,
    /// Insertion sequence, breaks `created_at` ties.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Message {
    pub(crate) fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.seq)
    }
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// History pagination cursor of one conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PageState {
    /// Highest page merged so far, 0 before the first load.
    pub page: u32,
    pub has_more: bool,
}

impl PageState {
    pub fn next_page(&self) -> u32 {
        self.page + 1
    }
}
