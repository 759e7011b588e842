use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DESTINATION_PREFIX, SYSTEM_SENDER};
use crate::error::ProtocolError;
use crate::types::{
    ClientRef, ConversationId, ConversationKind, MessageKind, MessageStatus, ServerMessageId,
    UserId,
};

// ---------------------------------------------------------------------------
// Transport frames
// ---------------------------------------------------------------------------

/// Frames written by the client onto the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Subscribe { id: String, destination: String },
    Unsubscribe { id: String },
    Send { destination: String, body: String },
    Disconnect,
}

/// Frames read by the client from the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// Handshake accepted.
    Connected {
        #[serde(default)]
        session: Option<String>,
    },
    /// A payload published on one of our subscribed topics. The body is the
    /// topic-specific JSON document, left undecoded until routing.
    Message { topic: String, body: String },
    /// Handshake rejection or session-level failure.
    Error { message: String },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::from)
    }

    /// Build a `SEND` frame for `destination` with a serialized payload.
    pub fn send<T: Serialize>(destination: Destination, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self::Send {
            destination: destination.path(),
            body: serde_json::to_string(payload)?,
        })
    }
}

impl ServerFrame {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::from)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::from)
    }
}

// ---------------------------------------------------------------------------
// Destinations and topics
// ---------------------------------------------------------------------------

/// Outbound application destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    SendPrivateMessage,
    SendGroupMessage,
    SendTyping,
    SendReadReceipt,
    SendHeartbeat,
    SendReaction,
}

impl Destination {
    pub fn name(self) -> &'static str {
        match self {
            Self::SendPrivateMessage => "send-private-message",
            Self::SendGroupMessage => "send-group-message",
            Self::SendTyping => "send-typing",
            Self::SendReadReceipt => "send-read-receipt",
            Self::SendHeartbeat => "send-heartbeat",
            Self::SendReaction => "send-reaction",
        }
    }

    pub fn path(self) -> String {
        format!("{DESTINATION_PREFIX}/{}", self.name())
    }
}

/// Per-identity inbound queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Private,
    ChatListUpdate,
    MessageStatus,
    ReadReceipt,
    GroupMemberChange,
    GroupInfoChange,
    Errors,
    Typing,
    Presence,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::Private,
        Topic::ChatListUpdate,
        Topic::MessageStatus,
        Topic::ReadReceipt,
        Topic::GroupMemberChange,
        Topic::GroupInfoChange,
        Topic::Errors,
        Topic::Typing,
        Topic::Presence,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::ChatListUpdate => "chat-list-update",
            Self::MessageStatus => "message-status",
            Self::ReadReceipt => "read-receipt",
            Self::GroupMemberChange => "group-member-change",
            Self::GroupInfoChange => "group-info-change",
            Self::Errors => "errors",
            Self::Typing => "typing",
            Self::Presence => "presence",
        }
    }

    /// Full subscription path of this queue for `user`.
    pub fn path_for(self, user: UserId) -> String {
        format!("/user/{user}/queue/{}", self.name())
    }
}

// ---------------------------------------------------------------------------
// Message payloads
// ---------------------------------------------------------------------------

/// Message content: plain text, or a structured document for file and
/// system messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Structured(serde_json::Value),
}

impl MessageBody {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Short human-readable rendering used for conversation previews.
    pub fn preview(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Structured(v) => v
                .get("name")
                .or_else(|| v.get("text"))
                .and_then(|n| n.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| "[attachment]".to_string()),
        }
    }
}

fn default_sent() -> MessageStatus {
    MessageStatus::Sent
}

/// Direct message as the backend publishes it. Older backends address it
/// only by the two participants, so `conversation_id` may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateFrame {
    pub server_id: ServerMessageId,
    #[serde(default)]
    pub client_ref: Option<ClientRef>,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: MessageBody,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default = "default_sent")]
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupFrame {
    pub server_id: ServerMessageId,
    #[serde(default)]
    pub client_ref: Option<ClientRef>,
    #[serde(alias = "groupId")]
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default = "default_sent")]
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemFrame {
    pub server_id: ServerMessageId,
    pub conversation_id: ConversationId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
}

/// Everything that may arrive on the private message queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "chatType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundMessage {
    Private(PrivateFrame),
    Group(GroupFrame),
    System(SystemFrame),
}

/// Canonical shape every inbound message is normalized into before it
/// reaches the message store. Also the shape of REST history items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrame {
    pub server_id: ServerMessageId,
    #[serde(default)]
    pub client_ref: Option<ClientRef>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default = "default_sent")]
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    /// Kind of the conversation the frame was addressed through, when the
    /// origin tells us. System frames and history items leave it unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_kind: Option<ConversationKind>,
}

impl InboundMessage {
    /// Resolve to the canonical frame.
    ///
    /// `lookup_peer` maps a direct-conversation peer to its conversation id
    /// and is only consulted when the frame carries no conversation id.
    pub fn into_canonical<F>(self, local: UserId, lookup_peer: F) -> Option<MessageFrame>
    where
        F: FnOnce(UserId) -> Option<ConversationId>,
    {
        match self {
            Self::Private(p) => {
                let conversation_id = match p.conversation_id {
                    Some(id) => id,
                    None => {
                        let peer = if p.sender_id == local {
                            p.receiver_id
                        } else {
                            p.sender_id
                        };
                        lookup_peer(peer)?
                    }
                };
                Some(MessageFrame {
                    server_id: p.server_id,
                    client_ref: p.client_ref,
                    conversation_id,
                    sender_id: p.sender_id,
                    body: p.body,
                    kind: p.kind,
                    status: p.status,
                    created_at: p.created_at,
                    conversation_kind: Some(ConversationKind::Direct),
                })
            }
            Self::Group(g) => Some(MessageFrame {
                server_id: g.server_id,
                client_ref: g.client_ref,
                conversation_id: g.conversation_id,
                sender_id: g.sender_id,
                body: g.body,
                kind: g.kind,
                status: g.status,
                created_at: g.created_at,
                conversation_kind: Some(ConversationKind::Group),
            }),
            Self::System(s) => Some(MessageFrame {
                server_id: s.server_id,
                client_ref: None,
                conversation_id: s.conversation_id,
                sender_id: SYSTEM_SENDER,
                body: s.body,
                kind: MessageKind::System,
                status: MessageStatus::Sent,
                created_at: s.created_at,
                conversation_kind: None,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Other inbound payloads
// ---------------------------------------------------------------------------

/// Lifecycle events for an already-known message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        conversation_id: ConversationId,
        #[serde(default)]
        server_id: Option<ServerMessageId>,
        #[serde(default)]
        client_ref: Option<ClientRef>,
        status: MessageStatus,
    },
    #[serde(rename_all = "camelCase")]
    Recall {
        conversation_id: ConversationId,
        server_id: ServerMessageId,
    },
}

/// A participant has read a conversation up to `up_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptNotice {
    pub conversation_id: ConversationId,
    pub reader_id: UserId,
    pub up_to: ServerMessageId,
}

/// Conversation list entry, from the list endpoint or a list-update push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    /// For direct conversations, the other participant.
    #[serde(default)]
    pub peer_id: Option<UserId>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberChangeKind {
    Joined,
    Left,
    Removed,
    Dissolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberChange {
    pub conversation_id: ConversationId,
    pub change: MemberChangeKind,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoChange {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    #[serde(default)]
    pub client_ref: Option<ClientRef>,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: UserId,
    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadEntry {
    pub conversation_id: ConversationId,
    pub count: u32,
}

/// One page of history from the REST collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub items: Vec<MessageFrame>,
    pub has_more: bool,
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub client_ref: ClientRef,
    pub conversation_id: ConversationId,
    /// Peer of a direct conversation, for backends that route by user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    pub body: MessageBody,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptSignal {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to: Option<ServerMessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSignal {
    pub conversation_id: ConversationId,
    pub server_id: ServerMessageId,
    pub emoji: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_frame_parses_tagged_json() {
        let frame = ServerFrame::from_json(
            r#"{"type":"MESSAGE","topic":"/user/7/queue/private","body":"{}"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ServerFrame::Message {
                topic: "/user/7/queue/private".into(),
                body: "{}".into()
            }
        );

        let connected = ServerFrame::from_json(r#"{"type":"CONNECTED"}"#).unwrap();
        assert_eq!(connected, ServerFrame::Connected { session: None });
    }

    #[test]
    fn test_send_frame_embeds_destination_and_payload() {
        let frame = ClientFrame::send(
            Destination::SendTyping,
            &TypingSignal {
                conversation_id: ConversationId(3),
                is_typing: true,
            },
        )
        .unwrap();
        match frame {
            ClientFrame::Send { destination, body } => {
                assert_eq!(destination, "/app/send-typing");
                assert_eq!(body, r#"{"conversationId":3,"isTyping":true}"#);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_topic_paths_are_per_identity() {
        assert_eq!(
            Topic::ReadReceipt.path_for(UserId(12)),
            "/user/12/queue/read-receipt"
        );
    }

    #[test]
    fn test_private_frame_resolves_conversation_through_peer() {
        let json = r#"{
            "chatType": "PRIVATE",
            "serverId": 9001,
            "clientRef": "c1",
            "senderId": 1,
            "receiverId": 2,
            "body": "hello",
            "createdAt": "2024-05-01T10:00:00Z"
        }"#;
        let inbound: InboundMessage = serde_json::from_str(json).unwrap();

        // Local user is the sender, so the peer is the receiver.
        let frame = inbound
            .into_canonical(UserId(1), |peer| {
                assert_eq!(peer, UserId(2));
                Some(ConversationId(42))
            })
            .unwrap();
        assert_eq!(frame.conversation_id, ConversationId(42));
        assert_eq!(frame.status, MessageStatus::Sent);
        assert_eq!(frame.kind, MessageKind::Text);
        assert_eq!(frame.client_ref, Some(ClientRef::from("c1")));
        assert_eq!(frame.conversation_kind, Some(ConversationKind::Direct));
    }

    #[test]
    fn test_unresolvable_private_frame_yields_none() {
        let inbound = InboundMessage::Private(PrivateFrame {
            server_id: ServerMessageId(1),
            client_ref: None,
            conversation_id: None,
            sender_id: UserId(5),
            receiver_id: UserId(1),
            body: MessageBody::text("x"),
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
            created_at: Utc::now(),
        });
        assert!(inbound.into_canonical(UserId(1), |_| None).is_none());
    }

    #[test]
    fn test_group_frame_accepts_group_id_alias() {
        let json = r#"{
            "chatType": "GROUP",
            "serverId": 10,
            "groupId": 77,
            "senderId": 3,
            "body": {"name": "report.pdf", "size": 1024},
            "kind": "FILE",
            "createdAt": "2024-05-01T10:00:00Z"
        }"#;
        let inbound: InboundMessage = serde_json::from_str(json).unwrap();
        let frame = inbound.into_canonical(UserId(1), |_| None).unwrap();
        assert_eq!(frame.conversation_id, ConversationId(77));
        assert_eq!(frame.conversation_kind, Some(ConversationKind::Group));
        assert_eq!(frame.body.preview(), "report.pdf");
    }

    #[test]
    fn test_status_event_recall_variant() {
        let ev: StatusEvent =
            serde_json::from_str(r#"{"event":"RECALL","conversationId":4,"serverId":8}"#).unwrap();
        assert_eq!(
            ev,
            StatusEvent::Recall {
                conversation_id: ConversationId(4),
                server_id: ServerMessageId(8)
            }
        );
    }
}
