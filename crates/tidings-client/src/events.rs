use serde::Serialize;

use tidings_shared::protocol::MemberChange;
use tidings_shared::types::{ClientRef, ConnectionStatus, ConversationId, ServerMessageId, UserId};
use tidings_store::{Conversation, Message, PageState};

/// Notifications published to observers of the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SyncEvent {
    ConnectionChanged {
        status: ConnectionStatus,
    },
    /// Reconnect budget exhausted; only an explicit connect retries.
    ConnectionFailed {
        attempts: u32,
    },
    MessageAppended {
        message: Message,
    },
    MessageUpdated {
        message: Message,
    },
    /// Own messages up to `up_to` were read by another participant.
    MessagesRead {
        conversation_id: ConversationId,
        up_to: ServerMessageId,
        updated: usize,
    },
    PageLoaded {
        conversation_id: ConversationId,
        state: PageState,
        added: usize,
    },
    SendFailed {
        conversation_id: ConversationId,
        client_ref: ClientRef,
        reason: String,
    },
    ConversationChanged {
        conversation: Conversation,
    },
    ConversationRemoved {
        conversation_id: ConversationId,
    },
    ConversationCleared {
        conversation_id: ConversationId,
    },
    MembersChanged {
        change: MemberChange,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        count: u32,
        total: u32,
    },
    TypingChanged {
        conversation_id: ConversationId,
        users: Vec<UserId>,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    /// An error notice that could not be tied to a send.
    ServerError {
        message: String,
    },
}
