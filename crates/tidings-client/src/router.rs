//! Subscription router: the per-identity topic set and the decoding of
//! frames published on it.
//!
//! Decoding fails soft. A payload that does not parse is logged and
//! dropped, and a topic we never subscribed to is ignored; neither ends the
//! session. Message payloads of every origin are normalized here into the
//! canonical [`MessageFrame`] before they reach the store.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use tidings_shared::protocol::{
    ClientFrame, ConversationSummary, ErrorNotice, InboundMessage, InfoChange, MemberChange,
    MessageFrame, PresenceNotice, ReadReceiptNotice, StatusEvent, Topic, TypingNotice,
};
use tidings_shared::types::{ConversationId, UserId};
use tidings_shared::ProtocolError;

/// A decoded inbound frame, by semantic type.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(MessageFrame),
    /// A direct message addressed only by peer, for a peer we cannot map to
    /// a conversation yet.
    Unresolved(InboundMessage),
    Conversations(Vec<ConversationSummary>),
    Status(StatusEvent),
    ReadReceipt(ReadReceiptNotice),
    MemberChange(MemberChange),
    InfoChange(InfoChange),
    Error(ErrorNotice),
    Typing(TypingNotice),
    Presence(PresenceNotice),
}

/// List updates arrive either as one summary or as a batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListUpdate {
    Many(Vec<ConversationSummary>),
    One(ConversationSummary),
}

pub struct SubscriptionRouter {
    local_user: UserId,
    routes: HashMap<String, Topic>,
}

impl SubscriptionRouter {
    pub fn new(local_user: UserId) -> Self {
        let routes = Topic::ALL
            .iter()
            .map(|topic| (topic.path_for(local_user), *topic))
            .collect();
        Self { local_user, routes }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// SUBSCRIBE frames for every per-identity topic, sent after each
    /// successful handshake.
    pub fn subscriptions(&self) -> Vec<ClientFrame> {
        Topic::ALL
            .iter()
            .enumerate()
            .map(|(i, topic)| ClientFrame::Subscribe {
                id: format!("sub-{i}"),
                destination: topic.path_for(self.local_user),
            })
            .collect()
    }

    pub fn topic_of(&self, path: &str) -> Option<Topic> {
        self.routes.get(path).copied()
    }

    /// Decode `raw` published on `topic`.
    ///
    /// `lookup_peer` resolves the conversation of a direct message that
    /// carries only the peer id. Returns `None` for frames that were
    /// dropped.
    pub fn dispatch<F>(&self, topic: &str, raw: &str, lookup_peer: F) -> Option<InboundEvent>
    where
        F: FnOnce(UserId) -> Option<ConversationId>,
    {
        let Some(kind) = self.topic_of(topic) else {
            debug!(topic, "Ignoring frame on unknown topic");
            return None;
        };

        match self.decode(kind, raw, lookup_peer) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(topic, error = %e, "Dropping malformed frame");
                None
            }
        }
    }

    fn decode<F>(&self, kind: Topic, raw: &str, lookup_peer: F) -> Result<InboundEvent, ProtocolError>
    where
        F: FnOnce(UserId) -> Option<ConversationId>,
    {
        let event = match kind {
            Topic::Private => {
                let message: InboundMessage = parse(raw)?;
                let parked = message.clone();
                match message.into_canonical(self.local_user, lookup_peer) {
                    Some(frame) => InboundEvent::Message(frame),
                    None => InboundEvent::Unresolved(parked),
                }
            }
            Topic::ChatListUpdate => match parse::<ListUpdate>(raw)? {
                ListUpdate::Many(list) => InboundEvent::Conversations(list),
                ListUpdate::One(one) => InboundEvent::Conversations(vec![one]),
            },
            Topic::MessageStatus => InboundEvent::Status(parse(raw)?),
            Topic::ReadReceipt => InboundEvent::ReadReceipt(parse(raw)?),
            Topic::GroupMemberChange => InboundEvent::MemberChange(parse(raw)?),
            Topic::GroupInfoChange => InboundEvent::InfoChange(parse(raw)?),
            Topic::Errors => InboundEvent::Error(parse(raw)?),
            Topic::Typing => InboundEvent::Typing(parse(raw)?),
            Topic::Presence => InboundEvent::Presence(parse(raw)?),
        };
        Ok(event)
    }
}

fn parse<T: DeserializeOwned>(raw: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(raw).map_err(ProtocolError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidings_shared::types::{MessageStatus, ServerMessageId};

    const ME: UserId = UserId(7);

    fn private_topic() -> String {
        Topic::Private.path_for(ME)
    }

    #[test]
    fn test_subscriptions_cover_every_queue() {
        let router = SubscriptionRouter::new(ME);
        let frames = router.subscriptions();
        assert_eq!(frames.len(), Topic::ALL.len());
        assert_eq!(
            frames[0],
            ClientFrame::Subscribe {
                id: "sub-0".into(),
                destination: "/user/7/queue/private".into(),
            }
        );
    }

    #[test]
    fn test_group_frame_normalizes() {
        let router = SubscriptionRouter::new(ME);
        let raw = r#"{"chatType":"GROUP","serverId":500,"groupId":12,"senderId":3,
            "body":"hi","createdAt":"2024-01-01T00:00:00Z"}"#;

        let event = router.dispatch(&private_topic(), raw, |_| None).unwrap();
        let InboundEvent::Message(frame) = event else {
            panic!("expected a message, got {event:?}");
        };
        assert_eq!(frame.conversation_id, ConversationId(12));
        assert_eq!(frame.server_id, ServerMessageId(500));
        assert_eq!(frame.status, MessageStatus::Sent);
    }

    #[test]
    fn test_private_frame_resolves_through_peer_lookup() {
        let router = SubscriptionRouter::new(ME);
        let raw = r#"{"chatType":"PRIVATE","serverId":1,"senderId":3,"receiverId":7,
            "body":"yo","createdAt":"2024-01-01T00:00:00Z"}"#;

        let event = router
            .dispatch(&private_topic(), raw, |peer| {
                (peer == UserId(3)).then_some(ConversationId(42))
            })
            .unwrap();
        assert!(matches!(
            event,
            InboundEvent::Message(MessageFrame {
                conversation_id: ConversationId(42),
                ..
            })
        ));

        let parked = router.dispatch(&private_topic(), raw, |_| None).unwrap();
        assert!(matches!(parked, InboundEvent::Unresolved(_)));
    }

    #[test]
    fn test_malformed_and_unknown_frames_are_dropped() {
        let router = SubscriptionRouter::new(ME);
        assert!(router.dispatch(&private_topic(), "{not json", |_| None).is_none());
        assert!(router
            .dispatch("/user/8/queue/private", r#"{"chatType":"SYSTEM"}"#, |_| None)
            .is_none());
        assert!(router.dispatch("/topic/other", "{}", |_| None).is_none());
    }

    #[test]
    fn test_list_update_accepts_single_or_batch() {
        let router = SubscriptionRouter::new(ME);
        let topic = Topic::ChatListUpdate.path_for(ME);
        let one = r#"{"conversationId":1,"kind":"DIRECT","displayName":"a"}"#;
        let many = format!("[{one},{one}]");

        assert!(matches!(
            router.dispatch(&topic, one, |_| None),
            Some(InboundEvent::Conversations(list)) if list.len() == 1
        ));
        assert!(matches!(
            router.dispatch(&topic, &many, |_| None),
            Some(InboundEvent::Conversations(list)) if list.len() == 2
        ));
    }

    #[test]
    fn test_status_recall_event() {
        let router = SubscriptionRouter::new(ME);
        let topic = Topic::MessageStatus.path_for(ME);
        let raw = r#"{"event":"RECALL","conversationId":4,"serverId":9}"#;

        assert_eq!(
            router.dispatch(&topic, raw, |_| None),
            Some(InboundEvent::Status(StatusEvent::Recall {
                conversation_id: ConversationId(4),
                server_id: ServerMessageId(9),
            }))
        );
    }
}
