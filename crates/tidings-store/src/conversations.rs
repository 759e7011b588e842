//! Conversation directory: the known conversations keyed by their
//! canonical id, plus the peer index used to resolve direct messages that
//! arrive addressed by user.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use tidings_shared::protocol::{ConversationSummary, InfoChange};
use tidings_shared::types::{ConversationId, ConversationKind, UserId};

use crate::models::Conversation;

#[derive(Debug, Default)]
pub struct ConversationDirectory {
    by_id: HashMap<ConversationId, Conversation>,
    by_peer: HashMap<UserId, ConversationId>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert or refresh a conversation from a server summary.
    ///
    /// Returns `true` if the conversation was not known before. Preview and
    /// activity only move forward in time.
    pub fn upsert(&mut self, summary: ConversationSummary) -> bool {
        if let Some(peer) = summary.peer_id {
            self.by_peer.insert(peer, summary.conversation_id);
        }

        match self.by_id.get_mut(&summary.conversation_id) {
            Some(existing) => {
                existing.kind = summary.kind;
                existing.display_name = summary.display_name;
                existing.avatar_ref = summary.avatar_ref;
                if summary.peer_id.is_some() {
                    existing.peer_id = summary.peer_id;
                }
                if is_newer(summary.last_activity_at, existing.last_activity_at) {
                    existing.last_activity_at = summary.last_activity_at;
                    existing.last_message_preview = summary.last_message_preview;
                }
                false
            }
            None => {
                debug!(conversation = %summary.conversation_id, "New conversation");
                self.by_id
                    .insert(summary.conversation_id, Conversation::from(summary));
                true
            }
        }
    }

    /// Make sure `id` exists, creating a placeholder if needed.
    ///
    /// `kind` is what the message origin says about the conversation. A
    /// placeholder takes it, defaulting to direct. A group hint also
    /// corrects an entry that was guessed direct and has no peer.
    pub fn ensure(&mut self, id: ConversationId, kind: Option<ConversationKind>) -> &mut Conversation {
        let conversation = self.by_id.entry(id).or_insert_with(|| {
            Conversation::placeholder(id, kind.unwrap_or(ConversationKind::Direct))
        });
        if kind == Some(ConversationKind::Group)
            && conversation.kind != ConversationKind::Group
            && conversation.peer_id.is_none()
        {
            debug!(conversation = %id, "Conversation is a group");
            conversation.kind = ConversationKind::Group;
        }
        conversation
    }

    /// Record a message as the latest activity if it is newer than what we
    /// have.
    pub fn touch(
        &mut self,
        id: ConversationId,
        kind: Option<ConversationKind>,
        preview: String,
        at: DateTime<Utc>,
    ) {
        let conversation = self.ensure(id, kind);
        if is_newer(Some(at), conversation.last_activity_at) {
            conversation.last_activity_at = Some(at);
            conversation.last_message_preview = Some(preview);
        }
    }

    /// Apply a name/avatar change. Returns `false` for unknown conversations.
    pub fn apply_info(&mut self, change: &InfoChange) -> bool {
        let Some(conversation) = self.by_id.get_mut(&change.conversation_id) else {
            return false;
        };
        if let Some(name) = &change.display_name {
            conversation.display_name = name.clone();
        }
        if let Some(avatar) = &change.avatar_ref {
            conversation.avatar_ref = Some(avatar.clone());
        }
        true
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    pub fn remove(&mut self, id: ConversationId) -> Option<Conversation> {
        let removed = self.by_id.remove(&id)?;
        self.by_peer.retain(|_, conv| *conv != id);
        Some(removed)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get(&self, id: ConversationId) -> Option<&Conversation> {
        self.by_id.get(&id)
    }

    pub fn contains(&self, id: ConversationId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Conversation held with `peer`, if one is known.
    pub fn lookup_peer(&self, peer: UserId) -> Option<ConversationId> {
        self.by_peer.get(&peer).copied()
    }

    /// All conversations, most recently active first.
    pub fn list(&self) -> Vec<Conversation> {
        let mut all: Vec<Conversation> = self.by_id.values().cloned().collect();
        all.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn is_newer(candidate: Option<DateTime<Utc>>, current: Option<DateTime<Utc>>) -> bool {
    match (candidate, current) {
        (Some(c), Some(cur)) => c >= cur,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn summary(id: i64, peer: Option<i64>, at_secs: Option<i64>) -> ConversationSummary {
        ConversationSummary {
            conversation_id: ConversationId(id),
            kind: ConversationKind::Direct,
            display_name: format!("conv {id}"),
            avatar_ref: None,
            peer_id: peer.map(UserId),
            last_message_preview: at_secs.map(|s| format!("msg at {s}")),
            last_activity_at: at_secs.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
        }
    }

    #[test]
    fn test_peer_lookup_never_becomes_the_key() {
        let mut dir = ConversationDirectory::new();
        assert!(dir.upsert(summary(42, Some(7), None)));

        assert_eq!(dir.lookup_peer(UserId(7)), Some(ConversationId(42)));
        assert!(dir.get(ConversationId(7)).is_none());
    }

    #[test]
    fn test_upsert_keeps_newer_activity() {
        let mut dir = ConversationDirectory::new();
        dir.upsert(summary(1, None, Some(200)));
        assert!(!dir.upsert(summary(1, None, Some(100))));

        let conv = dir.get(ConversationId(1)).unwrap();
        assert_eq!(conv.last_message_preview.as_deref(), Some("msg at 200"));
    }

    #[test]
    fn test_list_orders_by_recent_activity() {
        let mut dir = ConversationDirectory::new();
        dir.upsert(summary(1, None, Some(100)));
        dir.upsert(summary(2, None, Some(300)));
        dir.upsert(summary(3, None, None));

        let ids: Vec<i64> = dir.list().iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn test_remove_drops_peer_index() {
        let mut dir = ConversationDirectory::new();
        dir.upsert(summary(5, Some(9), None));
        assert!(dir.remove(ConversationId(5)).is_some());
        assert_eq!(dir.lookup_peer(UserId(9)), None);
        assert!(dir.remove(ConversationId(5)).is_none());
    }

    #[test]
    fn test_info_change_updates_name() {
        let mut dir = ConversationDirectory::new();
        dir.upsert(summary(5, None, None));
        let change = InfoChange {
            conversation_id: ConversationId(5),
            display_name: Some("renamed".into()),
            avatar_ref: None,
        };
        assert!(dir.apply_info(&change));
        assert_eq!(dir.get(ConversationId(5)).unwrap().display_name, "renamed");
    }

    #[test]
    fn test_group_hint_shapes_placeholder() {
        let mut dir = ConversationDirectory::new();
        let at = Utc.timestamp_opt(100, 0).unwrap();

        dir.touch(ConversationId(12), Some(ConversationKind::Group), "hi".into(), at);
        assert_eq!(dir.get(ConversationId(12)).unwrap().kind, ConversationKind::Group);

        // Guessed direct by a send before anything described it.
        dir.touch(ConversationId(13), None, "out".into(), at);
        assert_eq!(dir.get(ConversationId(13)).unwrap().kind, ConversationKind::Direct);
        dir.touch(ConversationId(13), Some(ConversationKind::Group), "in".into(), at);
        assert_eq!(dir.get(ConversationId(13)).unwrap().kind, ConversationKind::Group);
    }

    #[test]
    fn test_group_hint_never_rewrites_a_known_direct_conversation() {
        let mut dir = ConversationDirectory::new();
        dir.upsert(summary(42, Some(7), None));
        dir.ensure(ConversationId(42), Some(ConversationKind::Group));
        assert_eq!(dir.get(ConversationId(42)).unwrap().kind, ConversationKind::Direct);
    }
}
