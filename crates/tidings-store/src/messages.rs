//! Per-conversation message logs and the optimistic-send reconciliation.
//!
//! Three hazards are handled here:
//!
//! - a self-sent message may come back from the server before the sender
//!   has finished its own bookkeeping, so confirmations are matched by
//!   `clientRef`, never by timing;
//! - the same server message may be delivered more than once, so every log
//!   keeps the set of `serverId`s it already holds;
//! - a send may have been addressed by a key that differs from the
//!   canonical conversation id, so a confirmation re-homes the optimistic
//!   entry under the id the server reports.
//!
//! Logs stay ordered by `(createdAt, insertion sequence)`. Appends that
//! arrive in order are pushed; late ones are inserted at their position.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, warn};

use tidings_shared::constants::RECALL_TOMBSTONE;
use tidings_shared::protocol::{MessageBody, MessageFrame, MessagePage, ReadReceiptNotice};
use tidings_shared::types::{
    ClientRef, ConversationId, MessageKind, MessageStatus, ServerMessageId, UserId,
};

use crate::conversations::ConversationDirectory;
use crate::error::{Result, StoreError};
use crate::models::{Draft, Message, PageState};

/// What `reconcile_inbound` did with a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Already present; nothing changed.
    Duplicate {
        conversation_id: ConversationId,
        server_id: ServerMessageId,
    },
    /// An optimistic entry was confirmed in place.
    Confirmed {
        conversation_id: ConversationId,
        client_ref: ClientRef,
        server_id: ServerMessageId,
        /// Set when the entry was filed under a different key at send time.
        moved_from: Option<ConversationId>,
    },
    /// A new entry was added.
    Appended {
        conversation_id: ConversationId,
        server_id: ServerMessageId,
        is_mine: bool,
    },
}

/// Result of merging a page of history.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageMerge {
    pub added: usize,
    pub updated: usize,
    pub state: PageState,
    /// Optimistic entries the page confirmed.
    pub confirmed: Vec<ClientRef>,
}

/// Address of a message inside a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    Server(ServerMessageId),
    Client(ClientRef),
}

#[derive(Debug, Default)]
struct ConversationLog {
    messages: Vec<Message>,
    server_ids: HashSet<ServerMessageId>,
    page: PageState,
}

impl ConversationLog {
    /// Insert keeping sort order; returns the index used.
    fn insert(&mut self, msg: Message) -> usize {
        if let Some(id) = msg.server_id {
            self.server_ids.insert(id);
        }
        let key = msg.sort_key();
        let pos = match self.messages.last() {
            Some(last) if last.sort_key() > key => {
                self.messages.partition_point(|m| m.sort_key() <= key)
            }
            _ => self.messages.len(),
        };
        self.messages.insert(pos, msg);
        pos
    }

    fn take(&mut self, idx: usize) -> Message {
        let msg = self.messages.remove(idx);
        if let Some(id) = msg.server_id {
            self.server_ids.remove(&id);
        }
        msg
    }

    fn position_by_server_id(&self, id: ServerMessageId) -> Option<usize> {
        if !self.server_ids.contains(&id) {
            return None;
        }
        self.messages.iter().rposition(|m| m.server_id == Some(id))
    }

    fn position_by_client_ref(&self, client_ref: &ClientRef) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|m| m.client_ref.as_ref() == Some(client_ref))
    }

    fn position(&self, target: &MessageTarget) -> Option<usize> {
        match target {
            MessageTarget::Server(id) => self.position_by_server_id(*id),
            MessageTarget::Client(r) => self.position_by_client_ref(r),
        }
    }
}

/// Owner of every conversation log. The only mutator of message state.
#[derive(Debug)]
pub struct MessageStore {
    local_user: UserId,
    logs: HashMap<ConversationId, ConversationLog>,
    /// Every client ref this session created, to the log that holds it.
    refs: HashMap<ClientRef, ConversationId>,
    directory: ConversationDirectory,
    next_seq: u64,
}

impl MessageStore {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            logs: HashMap::new(),
            refs: HashMap::new(),
            directory: ConversationDirectory::new(),
            next_seq: 0,
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut ConversationDirectory {
        &mut self.directory
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Add a PENDING entry for a message the local user is sending.
    pub fn append_optimistic(&mut self, conversation_id: ConversationId, draft: Draft) -> ClientRef {
        let client_ref = ClientRef::new();
        let now = Utc::now();
        let seq = self.bump_seq();

        let msg = Message {
            server_id: None,
            client_ref: Some(client_ref.clone()),
            conversation_id,
            sender_id: self.local_user,
            body: draft.body,
            kind: draft.kind,
            created_at: now,
            status: MessageStatus::Pending,
            is_mine: true,
            recalled: false,
            failure: None,
            seq,
        };

        self.directory
            .touch(conversation_id, None, msg.body.preview(), now);
        self.logs.entry(conversation_id).or_default().insert(msg);
        self.refs.insert(client_ref.clone(), conversation_id);

        debug!(conversation = %conversation_id, client_ref = %client_ref, "Optimistic entry added");
        client_ref
    }

    /// Move a PENDING or SENT entry to FAILED.
    ///
    /// Returns the owning conversation when the status changed, `None` when
    /// the entry was already resolved.
    pub fn mark_failed(
        &mut self,
        client_ref: &ClientRef,
        reason: &str,
    ) -> Result<Option<ConversationId>> {
        let conversation_id = *self
            .refs
            .get(client_ref)
            .ok_or_else(|| StoreError::UnknownClientRef(client_ref.clone()))?;
        let log = self
            .logs
            .get_mut(&conversation_id)
            .ok_or_else(|| StoreError::UnknownClientRef(client_ref.clone()))?;
        let idx = log
            .position_by_client_ref(client_ref)
            .ok_or_else(|| StoreError::UnknownClientRef(client_ref.clone()))?;

        let msg = &mut log.messages[idx];
        if !msg.status.is_unconfirmed() {
            return Ok(None);
        }
        msg.status = MessageStatus::Failed;
        msg.failure = Some(reason.to_string());

        warn!(conversation = %conversation_id, client_ref = %client_ref, reason, "Send failed");
        Ok(Some(conversation_id))
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Merge one inbound message frame into its conversation log.
    pub fn reconcile_inbound(&mut self, frame: MessageFrame) -> ReconcileOutcome {
        let conversation_id = frame.conversation_id;

        let known = self
            .logs
            .get(&conversation_id)
            .map_or(false, |log| log.server_ids.contains(&frame.server_id));
        if known {
            debug!(conversation = %conversation_id, server_id = %frame.server_id, "Duplicate delivery dropped");
            return ReconcileOutcome::Duplicate {
                conversation_id,
                server_id: frame.server_id,
            };
        }

        if let Some(client_ref) = frame.client_ref.clone() {
            if let Some(outcome) = self.confirm(&client_ref, &frame) {
                return outcome;
            }
            debug!(
                client_ref = %client_ref,
                server_id = %frame.server_id,
                "No open entry for client ref, appending as new"
            );
        }

        let is_mine = frame.sender_id == self.local_user;
        let server_id = frame.server_id;
        self.append_confirmed(frame);
        ReconcileOutcome::Appended {
            conversation_id,
            server_id,
            is_mine,
        }
    }

    /// Collapse the open optimistic entry for `client_ref` into `frame`.
    fn confirm(&mut self, client_ref: &ClientRef, frame: &MessageFrame) -> Option<ReconcileOutcome> {
        let origin = *self.refs.get(client_ref)?;

        let mut msg = {
            let log = self.logs.get_mut(&origin)?;
            let idx = log.position_by_client_ref(client_ref)?;
            if !log.messages[idx].status.is_unconfirmed() {
                // A FAILED entry stays failed; the late copy is shown apart.
                return None;
            }
            log.take(idx)
        };

        let canonical = frame.conversation_id;
        msg.server_id = Some(frame.server_id);
        msg.created_at = frame.created_at;
        msg.conversation_id = canonical;
        msg.body = frame.body.clone();
        msg.kind = frame.kind;
        let next = match frame.status {
            MessageStatus::Pending => MessageStatus::Sent,
            other => other,
        };
        if msg.status.can_advance_to(next) {
            msg.status = next;
        }

        let moved_from = (origin != canonical).then_some(origin);
        if let Some(from) = moved_from {
            warn!(
                from = %from,
                to = %canonical,
                client_ref = %client_ref,
                "Confirmation re-keyed message to its canonical conversation"
            );
            self.refs.insert(client_ref.clone(), canonical);
        }

        self.directory
            .touch(canonical, frame.conversation_kind, msg.body.preview(), msg.created_at);
        self.logs.entry(canonical).or_default().insert(msg);

        Some(ReconcileOutcome::Confirmed {
            conversation_id: canonical,
            client_ref: client_ref.clone(),
            server_id: frame.server_id,
            moved_from,
        })
    }

    fn append_confirmed(&mut self, frame: MessageFrame) {
        let seq = self.bump_seq();
        // A ref we already track belongs to a failed entry; do not alias it.
        let client_ref = frame
            .client_ref
            .filter(|r| !self.refs.contains_key(r));
        let status = match frame.status {
            MessageStatus::Pending => MessageStatus::Sent,
            other => other,
        };

        let conversation_kind = frame.conversation_kind;
        let msg = Message {
            server_id: Some(frame.server_id),
            client_ref,
            conversation_id: frame.conversation_id,
            sender_id: frame.sender_id,
            is_mine: frame.sender_id == self.local_user,
            body: frame.body,
            kind: frame.kind,
            created_at: frame.created_at,
            status,
            recalled: false,
            failure: None,
            seq,
        };

        self.directory
            .touch(msg.conversation_id, conversation_kind, msg.body.preview(), msg.created_at);
        self.logs
            .entry(msg.conversation_id)
            .or_default()
            .insert(msg);
    }

    /// Merge page `page_no` of history for `conversation_id`.
    ///
    /// Page 1 is an authoritative resync: entries it contains overwrite the
    /// local copies and the cursor restarts at 1. Later pages backfill older
    /// history and skip what is already present. Nothing already in the log
    /// is dropped, so the visible count never shrinks.
    pub fn merge_page(
        &mut self,
        conversation_id: ConversationId,
        page_no: u32,
        page: MessagePage,
    ) -> PageMerge {
        let authoritative = page_no <= 1;
        let mut merge = PageMerge::default();
        self.directory.ensure(conversation_id, None);

        for mut item in page.items {
            if item.conversation_id != conversation_id {
                debug!(
                    expected = %conversation_id,
                    got = %item.conversation_id,
                    "History item filed under requested conversation"
                );
                item.conversation_id = conversation_id;
            }

            let existing = self
                .logs
                .get(&conversation_id)
                .and_then(|log| log.position_by_server_id(item.server_id));

            if let Some(idx) = existing {
                if authoritative && self.overwrite(conversation_id, idx, item) {
                    merge.updated += 1;
                }
                continue;
            }

            match self.reconcile_inbound(item) {
                ReconcileOutcome::Appended { .. } => merge.added += 1,
                ReconcileOutcome::Confirmed { client_ref, .. } => {
                    merge.updated += 1;
                    merge.confirmed.push(client_ref);
                }
                ReconcileOutcome::Duplicate { .. } => {}
            }
        }

        let log = self.logs.entry(conversation_id).or_default();
        if authoritative {
            log.page = PageState {
                page: 1,
                has_more: page.has_more,
            };
        } else if page_no >= log.page.page {
            log.page = PageState {
                page: page_no,
                has_more: page.has_more,
            };
        }
        merge.state = log.page;

        debug!(
            conversation = %conversation_id,
            page = page_no,
            added = merge.added,
            updated = merge.updated,
            has_more = merge.state.has_more,
            "History page merged"
        );
        merge
    }

    /// Replace the local copy at `idx` with the server's version.
    fn overwrite(&mut self, conversation_id: ConversationId, idx: usize, item: MessageFrame) -> bool {
        let Some(log) = self.logs.get_mut(&conversation_id) else {
            return false;
        };
        let mut msg = log.take(idx);
        let before = msg.clone();

        if !msg.recalled {
            msg.body = item.body;
            msg.kind = item.kind;
        }
        msg.created_at = item.created_at;
        if msg.status.can_advance_to(item.status) && item.status != MessageStatus::Failed {
            msg.status = item.status;
        }

        let changed = msg != before;
        log.insert(msg);
        changed
    }

    // ------------------------------------------------------------------
    // Lifecycle updates
    // ------------------------------------------------------------------

    /// Move a message forward to `status`.
    ///
    /// `Ok(false)` if the message is unknown or already there.
    pub fn advance_status(
        &mut self,
        conversation_id: ConversationId,
        target: MessageTarget,
        status: MessageStatus,
    ) -> Result<bool> {
        // Client refs resolve through the index in case the entry moved.
        let conversation_id = match &target {
            MessageTarget::Client(r) => self.refs.get(r).copied().unwrap_or(conversation_id),
            MessageTarget::Server(_) => conversation_id,
        };
        let log = self
            .logs
            .get_mut(&conversation_id)
            .ok_or(StoreError::UnknownConversation(conversation_id))?;
        let Some(idx) = log.position(&target) else {
            return Ok(false);
        };

        let msg = &mut log.messages[idx];
        if msg.status == status {
            return Ok(false);
        }
        if !msg.status.can_advance_to(status) {
            return Err(StoreError::InvalidTransition {
                from: msg.status,
                to: status,
            });
        }
        msg.status = status;
        Ok(true)
    }

    /// Another participant read the conversation up to `up_to`: the local
    /// user's confirmed messages at or before it become READ.
    pub fn apply_read_receipt(&mut self, notice: &ReadReceiptNotice) -> usize {
        if notice.reader_id == self.local_user {
            return 0;
        }
        let Some(log) = self.logs.get_mut(&notice.conversation_id) else {
            return 0;
        };

        let mut changed = 0;
        for msg in log.messages.iter_mut().filter(|m| m.is_mine) {
            let covered = msg.server_id.map_or(false, |id| id <= notice.up_to);
            if covered && matches!(msg.status, MessageStatus::Sent | MessageStatus::Delivered) {
                msg.status = MessageStatus::Read;
                changed += 1;
            }
        }
        changed
    }

    /// Replace a message's content with the recall tombstone.
    pub fn recall(
        &mut self,
        conversation_id: ConversationId,
        server_id: ServerMessageId,
    ) -> Result<bool> {
        let log = self
            .logs
            .get_mut(&conversation_id)
            .ok_or(StoreError::UnknownConversation(conversation_id))?;
        let Some(idx) = log.position_by_server_id(server_id) else {
            return Ok(false);
        };

        let msg = &mut log.messages[idx];
        if msg.recalled {
            return Ok(false);
        }
        msg.body = MessageBody::text(RECALL_TOMBSTONE);
        msg.kind = MessageKind::System;
        msg.recalled = true;
        Ok(true)
    }

    /// Empty a conversation's log on explicit user request.
    pub fn clear_conversation(&mut self, conversation_id: ConversationId) -> usize {
        self.refs.retain(|_, conv| *conv != conversation_id);
        match self.logs.get_mut(&conversation_id) {
            Some(log) => {
                let removed = log.messages.len();
                *log = ConversationLog::default();
                removed
            }
            None => 0,
        }
    }

    /// Forget a conversation entirely (left or dissolved).
    pub fn remove_conversation(&mut self, conversation_id: ConversationId) -> bool {
        self.refs.retain(|_, conv| *conv != conversation_id);
        let had_log = self.logs.remove(&conversation_id).is_some();
        let had_entry = self.directory.remove(conversation_id).is_some();
        had_log || had_entry
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn messages(&self, conversation_id: ConversationId) -> &[Message] {
        self.logs
            .get(&conversation_id)
            .map(|log| log.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self, conversation_id: ConversationId) -> usize {
        self.messages(conversation_id).len()
    }

    pub fn message(&self, conversation_id: ConversationId, target: &MessageTarget) -> Option<&Message> {
        let log = self.logs.get(&conversation_id)?;
        log.position(target).map(|idx| &log.messages[idx])
    }

    /// Entry created for `client_ref`, wherever it lives now.
    pub fn find_by_client_ref(&self, client_ref: &ClientRef) -> Option<&Message> {
        let conversation_id = self.refs.get(client_ref)?;
        self.message(*conversation_id, &MessageTarget::Client(client_ref.clone()))
    }

    pub fn page_state(&self, conversation_id: ConversationId) -> PageState {
        self.logs
            .get(&conversation_id)
            .map(|log| log.page)
            .unwrap_or_default()
    }

    /// Highest server id in a conversation, the natural read-receipt mark.
    pub fn latest_server_id(&self, conversation_id: ConversationId) -> Option<ServerMessageId> {
        self.logs
            .get(&conversation_id)?
            .server_ids
            .iter()
            .max()
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use tidings_shared::types::ConversationKind;

    const ME: UserId = UserId(1);
    const PEER: UserId = UserId(2);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn frame(server_id: i64, conv: i64, sender: UserId, secs: i64) -> MessageFrame {
        MessageFrame {
            server_id: ServerMessageId(server_id),
            client_ref: None,
            conversation_id: ConversationId(conv),
            sender_id: sender,
            body: MessageBody::text(format!("m{server_id}")),
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
            created_at: at(secs),
            conversation_kind: None,
        }
    }

    fn server_ids(store: &MessageStore, conv: i64) -> Vec<Option<i64>> {
        store
            .messages(ConversationId(conv))
            .iter()
            .map(|m| m.server_id.map(|s| s.0))
            .collect()
    }

    #[test]
    fn test_optimistic_send_collapses_into_confirmation() {
        let mut store = MessageStore::new(ME);
        let conv = ConversationId(42);
        let r = store.append_optimistic(conv, Draft::text("hello"));
        assert_eq!(store.messages(conv)[0].status, MessageStatus::Pending);

        let mut confirmation = frame(9001, 42, ME, 3);
        confirmation.client_ref = Some(r.clone());
        let outcome = store.reconcile_inbound(confirmation);

        assert_eq!(
            outcome,
            ReconcileOutcome::Confirmed {
                conversation_id: conv,
                client_ref: r,
                server_id: ServerMessageId(9001),
                moved_from: None,
            }
        );
        assert_eq!(store.len(conv), 1);
        let msg = &store.messages(conv)[0];
        assert_eq!(msg.server_id, Some(ServerMessageId(9001)));
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(msg.created_at, at(3));
        assert!(msg.is_mine);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let mut store = MessageStore::new(ME);
        let f = frame(500, 7, PEER, 0);

        assert!(matches!(
            store.reconcile_inbound(f.clone()),
            ReconcileOutcome::Appended { is_mine: false, .. }
        ));
        assert!(matches!(
            store.reconcile_inbound(f),
            ReconcileOutcome::Duplicate { .. }
        ));
        assert_eq!(server_ids(&store, 7), vec![Some(500)]);
    }

    #[test]
    fn test_confirmation_replayed_after_collapse_is_duplicate() {
        let mut store = MessageStore::new(ME);
        let conv = ConversationId(3);
        let r = store.append_optimistic(conv, Draft::text("hi"));
        let mut confirmation = frame(10, 3, ME, 1);
        confirmation.client_ref = Some(r);

        store.reconcile_inbound(confirmation.clone());
        assert!(matches!(
            store.reconcile_inbound(confirmation),
            ReconcileOutcome::Duplicate { .. }
        ));
        assert_eq!(store.len(conv), 1);
    }

    #[test]
    fn test_late_arrivals_are_placed_in_order() {
        let mut store = MessageStore::new(ME);
        store.reconcile_inbound(frame(1, 9, PEER, 10));
        store.reconcile_inbound(frame(3, 9, PEER, 30));
        store.reconcile_inbound(frame(2, 9, PEER, 20));
        store.reconcile_inbound(frame(0, 9, PEER, 5));

        assert_eq!(server_ids(&store, 9), vec![Some(0), Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_confirmation_timestamp_repositions_entry() {
        let mut store = MessageStore::new(ME);
        let conv = ConversationId(4);
        let r = store.append_optimistic(conv, Draft::text("mine"));
        store.reconcile_inbound(frame(20, 4, PEER, 10_000_000));

        let mut confirmation = frame(10, 4, ME, 0);
        confirmation.client_ref = Some(r);
        store.reconcile_inbound(confirmation);

        assert_eq!(server_ids(&store, 4), vec![Some(10), Some(20)]);
    }

    #[test]
    fn test_unknown_client_ref_is_appended_not_dropped() {
        let mut store = MessageStore::new(ME);
        let mut f = frame(77, 5, ME, 0);
        f.client_ref = Some(ClientRef::from("lost-after-restart"));

        assert!(matches!(
            store.reconcile_inbound(f),
            ReconcileOutcome::Appended { is_mine: true, .. }
        ));
        assert_eq!(store.len(ConversationId(5)), 1);
    }

    #[test]
    fn test_failed_entry_is_never_reactivated() {
        let mut store = MessageStore::new(ME);
        let conv = ConversationId(6);
        let r = store.append_optimistic(conv, Draft::text("slow"));
        assert_eq!(store.mark_failed(&r, "timeout"), Ok(Some(conv)));

        let mut late = frame(61, 6, ME, 1);
        late.client_ref = Some(r.clone());
        assert!(matches!(
            store.reconcile_inbound(late),
            ReconcileOutcome::Appended { .. }
        ));

        let failed = store.find_by_client_ref(&r).unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.failure.as_deref(), Some("timeout"));
        assert_eq!(store.len(conv), 2);
    }

    #[test]
    fn test_mark_failed_is_idempotent() {
        let mut store = MessageStore::new(ME);
        let r = store.append_optimistic(ConversationId(1), Draft::text("x"));

        assert!(store.mark_failed(&r, "not connected").unwrap().is_some());
        assert_eq!(store.mark_failed(&r, "again"), Ok(None));
        assert_eq!(
            store.mark_failed(&ClientRef::from("nope"), "x"),
            Err(StoreError::UnknownClientRef(ClientRef::from("nope")))
        );
    }

    #[test]
    fn test_confirmation_rekeys_to_canonical_conversation() {
        let mut store = MessageStore::new(ME);
        // The UI addressed the send with the peer's id.
        let r = store.append_optimistic(ConversationId(2), Draft::text("hey"));

        let mut confirmation = frame(300, 42, ME, 1);
        confirmation.client_ref = Some(r.clone());
        let outcome = store.reconcile_inbound(confirmation);

        assert!(matches!(
            outcome,
            ReconcileOutcome::Confirmed {
                moved_from: Some(ConversationId(2)),
                ..
            }
        ));
        assert_eq!(store.len(ConversationId(2)), 0);
        assert_eq!(store.len(ConversationId(42)), 1);
        assert_eq!(
            store.find_by_client_ref(&r).unwrap().conversation_id,
            ConversationId(42)
        );
    }

    #[test]
    fn test_history_pages_merge_without_duplicates() {
        let mut store = MessageStore::new(ME);
        let conv = ConversationId(8);
        store.reconcile_inbound(frame(5, 8, PEER, 50));

        let first = store.merge_page(
            conv,
            1,
            MessagePage {
                items: vec![frame(4, 8, PEER, 40), frame(5, 8, PEER, 50)],
                has_more: true,
            },
        );
        assert_eq!(first.added, 1);
        assert_eq!(first.state, PageState { page: 1, has_more: true });

        let second = store.merge_page(
            conv,
            2,
            MessagePage {
                items: vec![frame(1, 8, PEER, 10), frame(4, 8, PEER, 40)],
                has_more: false,
            },
        );
        assert_eq!(second.added, 1);
        assert_eq!(second.state, PageState { page: 2, has_more: false });
        assert_eq!(server_ids(&store, 8), vec![Some(1), Some(4), Some(5)]);
    }

    #[test]
    fn test_page_one_resync_keeps_unconfirmed_and_overwrites_known() {
        let mut store = MessageStore::new(ME);
        let conv = ConversationId(8);
        store.reconcile_inbound(frame(5, 8, ME, 50));
        let pending = store.append_optimistic(conv, Draft::text("queued"));

        let mut server_copy = frame(5, 8, ME, 50);
        server_copy.status = MessageStatus::Read;
        let merge = store.merge_page(
            conv,
            1,
            MessagePage {
                items: vec![server_copy],
                has_more: false,
            },
        );

        assert_eq!(merge.updated, 1);
        assert_eq!(store.len(conv), 2);
        assert_eq!(store.messages(conv)[0].status, MessageStatus::Read);
        assert_eq!(
            store.find_by_client_ref(&pending).unwrap().status,
            MessageStatus::Pending
        );
    }

    #[test]
    fn test_recall_tombstones_and_keeps_status() {
        let mut store = MessageStore::new(ME);
        let mut f = frame(9, 1, PEER, 0);
        f.status = MessageStatus::Delivered;
        store.reconcile_inbound(f);

        assert_eq!(store.recall(ConversationId(1), ServerMessageId(9)), Ok(true));
        let msg = &store.messages(ConversationId(1))[0];
        assert_eq!(msg.body, MessageBody::text(RECALL_TOMBSTONE));
        assert_eq!(msg.kind, MessageKind::System);
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(store.recall(ConversationId(1), ServerMessageId(9)), Ok(false));
    }

    #[test]
    fn test_read_receipt_marks_own_messages_read() {
        let mut store = MessageStore::new(ME);
        store.reconcile_inbound(frame(1, 3, ME, 1));
        store.reconcile_inbound(frame(2, 3, PEER, 2));
        store.reconcile_inbound(frame(3, 3, ME, 3));

        let changed = store.apply_read_receipt(&ReadReceiptNotice {
            conversation_id: ConversationId(3),
            reader_id: PEER,
            up_to: ServerMessageId(2),
        });
        assert_eq!(changed, 1);
        let statuses: Vec<MessageStatus> = store
            .messages(ConversationId(3))
            .iter()
            .map(|m| m.status)
            .collect();
        assert_eq!(
            statuses,
            vec![MessageStatus::Read, MessageStatus::Sent, MessageStatus::Sent]
        );
    }

    #[test]
    fn test_status_never_moves_backwards() {
        let mut store = MessageStore::new(ME);
        let mut f = frame(1, 3, ME, 1);
        f.status = MessageStatus::Read;
        store.reconcile_inbound(f);

        let target = MessageTarget::Server(ServerMessageId(1));
        assert_eq!(
            store.advance_status(ConversationId(3), target.clone(), MessageStatus::Delivered),
            Err(StoreError::InvalidTransition {
                from: MessageStatus::Read,
                to: MessageStatus::Delivered
            })
        );
        assert_eq!(
            store.advance_status(ConversationId(3), target, MessageStatus::Read),
            Ok(false)
        );
    }

    #[test]
    fn test_clear_conversation_empties_log() {
        let mut store = MessageStore::new(ME);
        store.reconcile_inbound(frame(1, 3, PEER, 1));
        let r = store.append_optimistic(ConversationId(3), Draft::text("x"));

        assert_eq!(store.clear_conversation(ConversationId(3)), 2);
        assert_eq!(store.len(ConversationId(3)), 0);
        assert!(store.mark_failed(&r, "late timer").is_err());
        // Cleared server ids may be delivered again.
        assert!(matches!(
            store.reconcile_inbound(frame(1, 3, PEER, 1)),
            ReconcileOutcome::Appended { .. }
        ));
    }

    #[test]
    fn test_first_group_frame_describes_conversation_as_group() {
        let mut store = MessageStore::new(ME);
        let mut inbound = frame(1, 12, PEER, 0);
        inbound.conversation_kind = Some(ConversationKind::Group);

        store.reconcile_inbound(inbound);

        let conv = store.directory().get(ConversationId(12)).unwrap();
        assert_eq!(conv.kind, ConversationKind::Group);
        assert_eq!(conv.peer_id, None);
    }
}
