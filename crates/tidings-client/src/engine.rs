//! The sync engine: one task that owns every piece of client state.
//!
//! Connection events, user commands, REST results, send timeouts and typing
//! expiries are all funneled into a single `select!` loop, so the store and
//! the trackers have exactly one mutator and need no locking. Work that
//! suspends (REST calls, timers) runs in spawned tasks and reports back
//! through internal channels.
//!
//! After every successful handshake the engine resubscribes first and only
//! then starts the offline catch-up. Catch-up results are tagged with the
//! session epoch and discarded if the session changed in the meantime.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tidings_net::{ConnectionEvent, ConnectionManager, Connector};
use tidings_shared::protocol::{
    ConversationSummary, ErrorNotice, InboundMessage, MemberChange, MemberChangeKind, MessageFrame,
    MessagePage, ReadReceiptNotice, StatusEvent, TypingNotice, UnreadEntry,
};
use tidings_shared::types::{ClientRef, ConversationId, MessageStatus, UserId};
use tidings_store::{
    MessageStore, MessageTarget, PageState, PresenceTracker, ReconcileOutcome, TypingExpiry,
    TypingTracker, UnreadTracker,
};

use crate::config::ClientConfig;
use crate::dispatcher::OutboundDispatcher;
use crate::error::{ClientError, Result};
use crate::events::SyncEvent;
use crate::handle::{EngineCommand, Query, SyncHandle};
use crate::rest::RestApi;
use crate::router::{InboundEvent, SubscriptionRouter};

/// Direct messages held back until their peer maps to a conversation.
const MAX_PARKED: usize = 256;

/// Results reported back by spawned work.
enum Internal {
    Catchup {
        epoch: u64,
        unread: Result<Vec<UnreadEntry>>,
        conversations: Result<Vec<ConversationSummary>>,
    },
    Page {
        conversation_id: ConversationId,
        page: u32,
        generation: u64,
        result: Result<MessagePage>,
        reply: Option<oneshot::Sender<Result<PageState>>>,
    },
    Conversations(Result<Vec<ConversationSummary>>),
    MarkReadDone {
        conversation_id: ConversationId,
        result: Result<()>,
    },
}

struct Inputs {
    commands: mpsc::Receiver<EngineCommand>,
    connection: mpsc::Receiver<ConnectionEvent>,
    internal: mpsc::UnboundedReceiver<Internal>,
    timeouts: mpsc::UnboundedReceiver<ClientRef>,
    typing: mpsc::UnboundedReceiver<TypingExpiry>,
}

/// Spawn the engine and its connection task.
///
/// Nothing is dialed until [`SyncHandle::connect`] is called.
pub fn spawn<C: Connector, R: RestApi>(
    config: &ClientConfig,
    local_user: UserId,
    connector: C,
    rest: R,
) -> (SyncHandle, JoinHandle<()>) {
    let (conn, connection, conn_task) = ConnectionManager::spawn(connector, config.connection());
    let (dispatcher, timeouts) = OutboundDispatcher::new(conn.clone(), config.send_timeout);
    let (typing, typing_rx) = TypingTracker::new(config.typing_ttl);

    let (cmd_tx, commands) = mpsc::channel(256);
    let (events, _) = broadcast::channel(1024);
    let (unread_tx, unread_rx) = watch::channel(0u32);
    let (internal_tx, internal) = mpsc::unbounded_channel();

    let handle = SyncHandle {
        cmd_tx,
        events: events.clone(),
        status_rx: conn.watch_status(),
        unread_rx,
    };

    let engine = Engine {
        local_user,
        page_size: config.page_size,
        router: SubscriptionRouter::new(local_user),
        conn,
        dispatcher,
        store: MessageStore::new(local_user),
        unread: UnreadTracker::new(),
        presence: PresenceTracker::new(),
        typing,
        rest: Arc::new(rest),
        active: None,
        epoch: 0,
        catchup: None,
        in_flight: HashSet::new(),
        removals: HashMap::new(),
        parked: Vec::new(),
        refreshing: false,
        events,
        unread_tx,
        internal_tx,
    };

    let inputs = Inputs {
        commands,
        connection,
        internal,
        timeouts,
        typing: typing_rx,
    };
    let task = tokio::spawn(engine.run(inputs, conn_task));

    (handle, task)
}

struct Engine<R: RestApi> {
    local_user: UserId,
    page_size: u32,
    router: SubscriptionRouter,
    conn: ConnectionManager,
    dispatcher: OutboundDispatcher,
    store: MessageStore,
    unread: UnreadTracker,
    presence: PresenceTracker,
    typing: TypingTracker,
    rest: Arc<R>,
    active: Option<ConversationId>,
    /// Bumped on every session start and end.
    epoch: u64,
    catchup: Option<JoinHandle<()>>,
    in_flight: HashSet<(ConversationId, u32)>,
    /// How many times each conversation was removed. Page results fetched
    /// before a removal are dropped.
    removals: HashMap<ConversationId, u64>,
    parked: Vec<InboundMessage>,
    refreshing: bool,
    events: broadcast::Sender<SyncEvent>,
    unread_tx: watch::Sender<u32>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl<R: RestApi> Engine<R> {
    async fn run(mut self, mut inputs: Inputs, conn_task: JoinHandle<()>) {
        info!(user = %self.local_user, "Sync engine started");

        loop {
            tokio::select! {
                cmd = inputs.commands.recv() => match cmd {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                Some(event) = inputs.connection.recv() => self.on_connection(event),
                Some(result) = inputs.internal.recv() => self.on_internal(result),
                Some(client_ref) = inputs.timeouts.recv() => self.on_send_timeout(client_ref),
                Some(expiry) = inputs.typing.recv() => self.on_typing_expiry(expiry),
            }
        }

        if let Some(task) = self.catchup.take() {
            task.abort();
        }
        self.dispatcher.cancel_all();
        self.typing.clear();
        if let Err(e) = self.conn.shutdown() {
            debug!(error = %e, "Connection task already gone");
        }
        let _ = conn_task.await;
        info!("Sync engine stopped");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn on_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Connect { credential, reply } => {
                self.rest.set_token(credential.expose());
                let result = self.conn.connect(credential);
                let _ = reply.send(result.map_err(ClientError::from));
            }
            EngineCommand::Disconnect(reply) => {
                let _ = reply.send(self.conn.disconnect().map_err(ClientError::from));
            }
            EngineCommand::Send {
                conversation_id,
                draft,
                reply,
            } => {
                let dispatched = self.dispatcher.send(&mut self.store, conversation_id, draft);
                if let Some(message) = self.store.find_by_client_ref(&dispatched.client_ref).cloned() {
                    self.emit(SyncEvent::MessageAppended { message });
                }
                if let Some(reason) = &dispatched.failure {
                    self.emit(SyncEvent::SendFailed {
                        conversation_id,
                        client_ref: dispatched.client_ref.clone(),
                        reason: reason.clone(),
                    });
                }
                self.emit_conversation(conversation_id);
                let _ = reply.send(dispatched);
            }
            EngineCommand::SendTyping {
                conversation_id,
                is_typing,
                reply,
            } => {
                let _ = reply.send(self.dispatcher.send_typing(conversation_id, is_typing));
            }
            EngineCommand::SendReaction {
                conversation_id,
                server_id,
                emoji,
                reply,
            } => {
                let result = self
                    .dispatcher
                    .send_reaction(conversation_id, server_id, emoji);
                let _ = reply.send(result);
            }
            EngineCommand::MarkRead {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.mark_read(conversation_id));
            }
            EngineCommand::OpenConversation {
                conversation_id,
                reply,
            } => {
                info!(conversation = %conversation_id, "Opening conversation");
                self.active = Some(conversation_id);
                self.mark_read(conversation_id);
                self.request_page(conversation_id, 1, Some(reply));
            }
            EngineCommand::CloseConversation(reply) => {
                self.active = None;
                let _ = reply.send(());
            }
            EngineCommand::LoadMore(reply) => {
                let Some(conversation_id) = self.active else {
                    let _ = reply.send(Err(ClientError::NoActiveConversation));
                    return;
                };
                let state = self.store.page_state(conversation_id);
                if state.page > 0 && !state.has_more {
                    let _ = reply.send(Ok(state));
                    return;
                }
                self.request_page(conversation_id, state.next_page(), Some(reply));
            }
            EngineCommand::ClearConversation {
                conversation_id,
                reply,
            } => {
                let removed = self.store.clear_conversation(conversation_id);
                info!(conversation = %conversation_id, removed, "Conversation cleared");
                self.emit(SyncEvent::ConversationCleared { conversation_id });
                let _ = reply.send(removed);
            }
            EngineCommand::Recall {
                conversation_id,
                server_id,
                reply,
            } => {
                let result = self.store.recall(conversation_id, server_id);
                if let Ok(true) = result {
                    self.emit_message(conversation_id, &MessageTarget::Server(server_id));
                }
                let _ = reply.send(result.map_err(ClientError::from));
            }
            EngineCommand::Query(query) => self.on_query(query),
            EngineCommand::Shutdown => {}
        }
    }

    fn on_query(&self, query: Query) {
        match query {
            Query::Messages(id, reply) => {
                let _ = reply.send(self.store.messages(id).to_vec());
            }
            Query::PageState(id, reply) => {
                let _ = reply.send(self.store.page_state(id));
            }
            Query::Conversations(reply) => {
                let _ = reply.send(self.store.directory().list());
            }
            Query::Unread(reply) => {
                let _ = reply.send(self.unread.snapshot());
            }
            Query::OnlineUsers(reply) => {
                let _ = reply.send(self.presence.online_users());
            }
            Query::Typing(id, reply) => {
                let _ = reply.send(self.typing.typing_in(id));
            }
            Query::Active(reply) => {
                let _ = reply.send(self.active);
            }
        }
    }

    /// Reset the local counter now and tell the server, retrying once.
    /// The local reset stands even if both calls fail.
    fn mark_read(&mut self, conversation_id: ConversationId) -> u32 {
        let previous = self.unread.mark_read(conversation_id);
        if previous > 0 {
            self.emit_unread(conversation_id);
        }

        let rest = self.rest.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match rest.mark_read(conversation_id).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    debug!(conversation = %conversation_id, error = %e, "mark-read failed, retrying once");
                    rest.mark_read(conversation_id).await
                }
            };
            let _ = tx.send(Internal::MarkReadDone {
                conversation_id,
                result,
            });
        });

        previous
    }

    fn request_page(
        &mut self,
        conversation_id: ConversationId,
        page: u32,
        reply: Option<oneshot::Sender<Result<PageState>>>,
    ) {
        if !self.in_flight.insert((conversation_id, page)) {
            debug!(conversation = %conversation_id, page, "Page already loading");
            if let Some(reply) = reply {
                let _ = reply.send(Ok(self.store.page_state(conversation_id)));
            }
            return;
        }

        let rest = self.rest.clone();
        let tx = self.internal_tx.clone();
        let size = self.page_size;
        let generation = self.generation(conversation_id);
        tokio::spawn(async move {
            let result = rest.fetch_messages(conversation_id, page, size).await;
            let _ = tx.send(Internal::Page {
                conversation_id,
                page,
                generation,
                result,
                reply,
            });
        });
    }

    fn generation(&self, conversation_id: ConversationId) -> u64 {
        self.removals.get(&conversation_id).copied().unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    fn on_connection(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.epoch += 1;
                let frames = self.router.subscriptions();
                let count = frames.len();
                for frame in frames {
                    if let Err(e) = self.conn.send(frame) {
                        warn!(error = %e, "Subscribe failed");
                    }
                }
                info!(topics = count, epoch = self.epoch, "Subscribed");
                self.emit_status();
                self.start_catchup();
            }
            ConnectionEvent::Frame { topic, body } => self.on_frame(&topic, &body),
            ConnectionEvent::Disconnected { reason } => {
                self.epoch += 1;
                if let Some(task) = self.catchup.take() {
                    task.abort();
                }
                info!(reason = %reason, "Session ended");
                self.emit_status();
            }
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                self.emit_status();
            }
            ConnectionEvent::Failed { attempts } => {
                warn!(attempts, "Connection failed, waiting for an explicit connect");
                self.emit(SyncEvent::ConnectionFailed { attempts });
                self.emit_status();
            }
        }
    }

    /// Fetch the unread snapshot and the conversation list, plus page 1 of
    /// the active conversation.
    fn start_catchup(&mut self) {
        if let Some(old) = self.catchup.take() {
            old.abort();
        }

        let epoch = self.epoch;
        let rest = self.rest.clone();
        let tx = self.internal_tx.clone();
        self.catchup = Some(tokio::spawn(async move {
            let (unread, conversations) =
                futures::join!(rest.unread_snapshot(), rest.list_conversations());
            let _ = tx.send(Internal::Catchup {
                epoch,
                unread,
                conversations,
            });
        }));

        if let Some(active) = self.active {
            self.request_page(active, 1, None);
        }
    }

    fn on_frame(&mut self, topic: &str, body: &str) {
        let store = &self.store;
        let event = self
            .router
            .dispatch(topic, body, |peer| store.directory().lookup_peer(peer));
        if let Some(event) = event {
            self.on_inbound(event);
        }
    }

    fn on_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Message(frame) => self.on_message(frame),
            InboundEvent::Unresolved(message) => self.park(message),
            InboundEvent::Conversations(list) => {
                self.apply_conversations(list);
                self.replay_parked(false);
            }
            InboundEvent::Status(event) => self.on_status(event),
            InboundEvent::ReadReceipt(notice) => self.on_read_receipt(notice),
            InboundEvent::MemberChange(change) => self.on_member_change(change),
            InboundEvent::InfoChange(change) => {
                if self.store.directory_mut().apply_info(&change) {
                    self.emit_conversation(change.conversation_id);
                } else {
                    debug!(conversation = %change.conversation_id, "Info change for unknown conversation");
                }
            }
            InboundEvent::Error(notice) => self.on_error_notice(notice),
            InboundEvent::Typing(notice) => self.on_typing(notice),
            InboundEvent::Presence(notice) => {
                if self.presence.set_online(notice.user_id, notice.online) {
                    self.emit(SyncEvent::PresenceChanged {
                        user_id: notice.user_id,
                        online: notice.online,
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound handlers
    // ------------------------------------------------------------------

    fn on_message(&mut self, frame: MessageFrame) {
        let sender = frame.sender_id;
        match self.store.reconcile_inbound(frame) {
            ReconcileOutcome::Duplicate { .. } => {}
            ReconcileOutcome::Confirmed {
                conversation_id,
                client_ref,
                ..
            } => {
                self.dispatcher.resolve(&client_ref);
                self.emit_message(conversation_id, &MessageTarget::Client(client_ref));
                self.emit_conversation(conversation_id);
            }
            ReconcileOutcome::Appended {
                conversation_id,
                server_id,
                is_mine,
            } => {
                if let Some(message) = self
                    .store
                    .message(conversation_id, &MessageTarget::Server(server_id))
                    .cloned()
                {
                    self.emit(SyncEvent::MessageAppended { message });
                }
                self.emit_conversation(conversation_id);

                if self.typing.stop(conversation_id, sender) {
                    self.emit_typing(conversation_id);
                }

                if is_mine {
                    return;
                }
                if self.active == Some(conversation_id) {
                    if let Err(e) = self
                        .dispatcher
                        .send_read_receipt(conversation_id, Some(server_id))
                    {
                        debug!(conversation = %conversation_id, error = %e, "Read receipt not sent");
                    }
                } else {
                    self.unread.increment(conversation_id);
                    self.emit_unread(conversation_id);
                }
            }
        }
    }

    fn park(&mut self, message: InboundMessage) {
        if self.parked.len() >= MAX_PARKED {
            warn!("Too many unresolved direct messages, dropping the oldest");
            self.parked.remove(0);
        }
        self.parked.push(message);

        if !self.refreshing {
            self.refreshing = true;
            debug!("Unknown peer, refreshing conversation list");
            let rest = self.rest.clone();
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let result = rest.list_conversations().await;
                let _ = tx.send(Internal::Conversations(result));
            });
        }
    }

    /// Re-resolve parked messages. With `last_chance`, the ones that still
    /// do not resolve are dropped.
    fn replay_parked(&mut self, last_chance: bool) {
        if self.parked.is_empty() {
            return;
        }
        let parked = std::mem::take(&mut self.parked);
        for message in parked {
            let store = &self.store;
            let resolved = message
                .clone()
                .into_canonical(self.local_user, |peer| store.directory().lookup_peer(peer));
            match resolved {
                Some(frame) => self.on_message(frame),
                None if last_chance => {
                    warn!(frame = ?message, "Dropping direct message from a peer with no conversation");
                }
                None => self.parked.push(message),
            }
        }
    }

    fn apply_conversations(&mut self, list: Vec<ConversationSummary>) {
        for summary in list {
            let id = summary.conversation_id;
            self.store.directory_mut().upsert(summary);
            self.emit_conversation(id);
        }
    }

    fn on_status(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::Status {
                conversation_id,
                server_id,
                client_ref,
                status,
            } => {
                if status == MessageStatus::Failed {
                    if let Some(client_ref) = &client_ref {
                        self.fail_send(client_ref, "rejected by server");
                        return;
                    }
                }

                let target = match (server_id, client_ref.clone()) {
                    (Some(id), _) => MessageTarget::Server(id),
                    (None, Some(r)) => MessageTarget::Client(r),
                    (None, None) => {
                        debug!(conversation = %conversation_id, "Status event without a message reference");
                        return;
                    }
                };

                match self.store.advance_status(conversation_id, target.clone(), status) {
                    Ok(true) => {
                        if let Some(r) = &client_ref {
                            self.dispatcher.resolve(r);
                        }
                        self.emit_message(conversation_id, &target);
                    }
                    Ok(false) => {}
                    Err(e) => debug!(error = %e, "Status update ignored"),
                }
            }
            StatusEvent::Recall {
                conversation_id,
                server_id,
            } => match self.store.recall(conversation_id, server_id) {
                Ok(true) => self.emit_message(conversation_id, &MessageTarget::Server(server_id)),
                Ok(false) => {}
                Err(e) => debug!(error = %e, "Recall ignored"),
            },
        }
    }

    fn on_read_receipt(&mut self, notice: ReadReceiptNotice) {
        let conversation_id = notice.conversation_id;
        if notice.reader_id == self.local_user {
            // Read on another device.
            if self.unread.mark_read(conversation_id) > 0 {
                self.emit_unread(conversation_id);
            }
            return;
        }

        let updated = self.store.apply_read_receipt(&notice);
        if updated > 0 {
            self.emit(SyncEvent::MessagesRead {
                conversation_id,
                up_to: notice.up_to,
                updated,
            });
        }
    }

    fn on_member_change(&mut self, change: MemberChange) {
        let gone = match change.change {
            MemberChangeKind::Dissolved => true,
            MemberChangeKind::Removed | MemberChangeKind::Left => {
                change.member_ids.contains(&self.local_user)
            }
            MemberChangeKind::Joined => false,
        };

        if !gone {
            self.emit(SyncEvent::MembersChanged { change });
            return;
        }

        let conversation_id = change.conversation_id;
        info!(conversation = %conversation_id, change = ?change.change, "Leaving conversation");
        self.store.remove_conversation(conversation_id);
        *self.removals.entry(conversation_id).or_default() += 1;
        self.typing.clear_conversation(conversation_id);
        self.unread.remove(conversation_id);
        self.publish_unread_total();
        if self.active == Some(conversation_id) {
            self.active = None;
        }
        self.emit(SyncEvent::ConversationRemoved { conversation_id });
    }

    fn on_error_notice(&mut self, notice: ErrorNotice) {
        match notice.client_ref {
            Some(client_ref) => self.fail_send(&client_ref, &notice.message),
            None => {
                warn!(code = ?notice.code, reason = %notice.message, "Server error");
                self.emit(SyncEvent::ServerError {
                    message: notice.message,
                });
            }
        }
    }

    fn on_typing(&mut self, notice: TypingNotice) {
        if notice.user_id == self.local_user {
            return;
        }
        let changed = if notice.is_typing {
            self.typing.start(notice.conversation_id, notice.user_id)
        } else {
            self.typing.stop(notice.conversation_id, notice.user_id)
        };
        if changed {
            self.emit_typing(notice.conversation_id);
        }
    }

    fn fail_send(&mut self, client_ref: &ClientRef, reason: &str) {
        self.dispatcher.resolve(client_ref);
        match self.store.mark_failed(client_ref, reason) {
            Ok(Some(conversation_id)) => {
                self.emit(SyncEvent::SendFailed {
                    conversation_id,
                    client_ref: client_ref.clone(),
                    reason: reason.to_string(),
                });
                self.emit_message(conversation_id, &MessageTarget::Client(client_ref.clone()));
            }
            Ok(None) => debug!(client_ref = %client_ref, "Failure for an already resolved send"),
            Err(e) => debug!(error = %e, "Failure for an unknown send"),
        }
    }

    // ------------------------------------------------------------------
    // Internal results and timers
    // ------------------------------------------------------------------

    fn on_internal(&mut self, result: Internal) {
        match result {
            Internal::Catchup {
                epoch,
                unread,
                conversations,
            } => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "Discarding stale catch-up");
                    return;
                }
                self.catchup = None;

                match conversations {
                    Ok(list) => {
                        self.apply_conversations(list);
                        self.replay_parked(false);
                    }
                    Err(e) => warn!(error = %e, "Conversation list fetch failed"),
                }
                match unread {
                    Ok(entries) => self.sync_unread(&entries),
                    Err(e) => warn!(error = %e, "Unread snapshot fetch failed"),
                }
                info!(epoch, "Catch-up complete");
            }
            Internal::Page {
                conversation_id,
                page,
                generation,
                result,
                reply,
            } => {
                self.in_flight.remove(&(conversation_id, page));
                if generation != self.generation(conversation_id) {
                    debug!(conversation = %conversation_id, page, "Dropping page of a removed conversation");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(ClientError::UnknownConversation(conversation_id)));
                    }
                    return;
                }
                let outcome = match result {
                    Ok(content) => {
                        let merge = self.store.merge_page(conversation_id, page, content);
                        for client_ref in &merge.confirmed {
                            self.dispatcher.resolve(client_ref);
                        }
                        self.emit(SyncEvent::PageLoaded {
                            conversation_id,
                            state: merge.state,
                            added: merge.added,
                        });
                        Ok(merge.state)
                    }
                    Err(e) => {
                        warn!(conversation = %conversation_id, page, error = %e, "History fetch failed");
                        Err(e)
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Internal::Conversations(result) => {
                self.refreshing = false;
                match result {
                    Ok(list) => self.apply_conversations(list),
                    Err(e) => warn!(error = %e, "Conversation list refresh failed"),
                }
                self.replay_parked(true);
            }
            Internal::MarkReadDone {
                conversation_id,
                result,
            } => match result {
                Ok(()) => debug!(conversation = %conversation_id, "Marked read on server"),
                Err(e) => warn!(conversation = %conversation_id, error = %e, "mark-read failed twice, keeping local state"),
            },
        }
    }

    /// Replace local counters with the server's and notify every
    /// conversation whose count moved.
    fn sync_unread(&mut self, entries: &[UnreadEntry]) {
        let before = self.unread.snapshot();
        self.unread.sync_from_server(entries);

        if let Some(active) = self.active {
            if self.unread.count(active) > 0 {
                self.mark_read(active);
            }
        }

        let touched: BTreeSet<ConversationId> = before
            .iter()
            .chain(self.unread.snapshot().iter())
            .map(|e| e.conversation_id)
            .collect();
        for conversation_id in touched {
            let old = before
                .iter()
                .find(|e| e.conversation_id == conversation_id)
                .map_or(0, |e| e.count);
            if old != self.unread.count(conversation_id) {
                self.emit_unread(conversation_id);
            }
        }
        self.publish_unread_total();
    }

    fn on_send_timeout(&mut self, client_ref: ClientRef) {
        if let Some(conversation_id) = self.dispatcher.on_timeout(&mut self.store, &client_ref) {
            let reason = "timed out waiting for confirmation".to_string();
            self.emit(SyncEvent::SendFailed {
                conversation_id,
                client_ref: client_ref.clone(),
                reason,
            });
            self.emit_message(conversation_id, &MessageTarget::Client(client_ref));
        }
    }

    fn on_typing_expiry(&mut self, expiry: TypingExpiry) {
        if self.typing.expire(expiry) {
            self.emit_typing(expiry.conversation_id);
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn emit_status(&self) {
        self.emit(SyncEvent::ConnectionChanged {
            status: self.conn.status(),
        });
    }

    fn emit_message(&self, conversation_id: ConversationId, target: &MessageTarget) {
        let message = match target {
            MessageTarget::Client(r) => self.store.find_by_client_ref(r),
            MessageTarget::Server(_) => self.store.message(conversation_id, target),
        };
        if let Some(message) = message.cloned() {
            self.emit(SyncEvent::MessageUpdated { message });
        }
    }

    fn emit_conversation(&self, conversation_id: ConversationId) {
        if let Some(conversation) = self.store.directory().get(conversation_id).cloned() {
            self.emit(SyncEvent::ConversationChanged { conversation });
        }
    }

    fn emit_unread(&self, conversation_id: ConversationId) {
        let total = self.publish_unread_total();
        self.emit(SyncEvent::UnreadChanged {
            conversation_id,
            count: self.unread.count(conversation_id),
            total,
        });
    }

    fn publish_unread_total(&self) -> u32 {
        let total = self.unread.total();
        self.unread_tx.send_if_modified(|current| {
            if *current == total {
                false
            } else {
                *current = total;
                true
            }
        });
        total
    }

    fn emit_typing(&self, conversation_id: ConversationId) {
        self.emit(SyncEvent::TypingChanged {
            conversation_id,
            users: self.typing.typing_in(conversation_id),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tidings_net::memory::{self, MemoryServer, MemorySession};
    use tidings_net::Credential;
    use tidings_shared::protocol::{ClientFrame, OutboundMessage, Topic};
    use tidings_shared::types::{ConversationKind, ServerMessageId};

    use crate::rest::fake::FakeRest;

    const ME: UserId = UserId(1);
    const PEER: UserId = UserId(2);

    struct Harness {
        handle: SyncHandle,
        server: MemoryServer,
        rest: FakeRest,
        events: broadcast::Receiver<SyncEvent>,
    }

    fn start() -> Harness {
        let (connector, server) = memory::pair();
        let rest = FakeRest::default();
        let (handle, _task) = spawn(
            &ClientConfig::default(),
            ME,
            connector,
            rest.clone(),
        );
        let events = handle.subscribe();
        Harness {
            handle,
            server,
            rest,
            events,
        }
    }

    impl Harness {
        /// Connect and consume the subscription frames.
        async fn connect(&mut self) -> MemorySession {
            self.handle.connect(Credential::new("token")).await.unwrap();
            let session = self.accept().await;
            settle().await;
            session
        }

        async fn accept(&mut self) -> MemorySession {
            let mut session = self.server.accept().await.unwrap();
            for _ in 0..Topic::ALL.len() {
                let frame = session.recv().await.unwrap();
                assert!(matches!(frame, ClientFrame::Subscribe { .. }), "{frame:?}");
            }
            session
        }

        async fn wait_for<F>(&mut self, pred: F) -> SyncEvent
        where
            F: Fn(&SyncEvent) -> bool,
        {
            let events = &mut self.events;
            tokio::time::timeout(Duration::from_secs(60), async {
                loop {
                    match events.recv().await {
                        Ok(event) if pred(&event) => return event,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => panic!("engine stopped"),
                    }
                }
            })
            .await
            .expect("event not observed")
        }
    }

    /// Let every runnable task finish its work.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn private_topic() -> String {
        Topic::Private.path_for(ME)
    }

    fn group_message(server_id: i64, conv: i64, sender: UserId, client_ref: Option<&str>) -> String {
        json!({
            "chatType": "GROUP",
            "serverId": server_id,
            "clientRef": client_ref,
            "conversationId": conv,
            "senderId": sender,
            "body": format!("m{server_id}"),
            "createdAt": "2024-05-01T12:00:00Z",
        })
        .to_string()
    }

    fn sent_payload(frame: ClientFrame) -> (String, OutboundMessage) {
        match frame {
            ClientFrame::Send { destination, body } => {
                (destination, serde_json::from_str(&body).unwrap())
            }
            other => panic!("expected SEND, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_send_collapses_on_confirmation() {
        let mut h = start();
        let mut session = h.connect().await;

        let client_ref = h.handle.send_text(ConversationId(42), "hello").await.unwrap();
        let (destination, payload) = sent_payload(session.recv().await.unwrap());
        assert_eq!(destination, "/app/send-private-message");
        assert_eq!(payload.client_ref, client_ref);

        session.push(
            &private_topic(),
            &group_message(9001, 42, ME, Some(client_ref.as_str())),
        );
        h.wait_for(|e| matches!(e, SyncEvent::MessageUpdated { .. })).await;

        let messages = h.handle.messages(ConversationId(42)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].server_id, Some(ServerMessageId(9001)));
        assert_eq!(messages[0].status, MessageStatus::Sent);

        // The timeout was cancelled with the confirmation.
        tokio::time::sleep(Duration::from_secs(30)).await;
        let messages = h.handle.messages(ConversationId(42)).await.unwrap();
        assert_eq!(messages[0].status, MessageStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_frame_is_dropped() {
        let mut h = start();
        let session = h.connect().await;

        session.push(&private_topic(), &group_message(500, 7, PEER, None));
        session.push(&private_topic(), &group_message(500, 7, PEER, None));
        session.push(&private_topic(), &group_message(501, 7, PEER, None));
        h.wait_for(|e| {
            matches!(e, SyncEvent::MessageAppended { message } if message.server_id == Some(ServerMessageId(501)))
        })
        .await;

        assert_eq!(h.handle.messages(ConversationId(7)).await.unwrap().len(), 2);
        assert_eq!(h.handle.unread_total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_offline_fails_immediately() {
        let h = start();
        let dispatched = h
            .handle
            .send(ConversationId(42), tidings_store::Draft::text("hello"))
            .await
            .unwrap();

        assert!(dispatched.failure.is_some());
        let messages = h.handle.messages(ConversationId(42)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_send_fails_and_stays_failed() {
        let mut h = start();
        let mut session = h.connect().await;

        let client_ref = h.handle.send_text(ConversationId(42), "hello").await.unwrap();
        let _ = session.recv().await;
        h.wait_for(|e| matches!(e, SyncEvent::SendFailed { .. })).await;

        // The confirmation shows up after the deadline.
        session.push(
            &private_topic(),
            &group_message(77, 42, ME, Some(client_ref.as_str())),
        );
        h.wait_for(|e| matches!(e, SyncEvent::MessageAppended { .. })).await;

        let messages = h.handle.messages(ConversationId(42)).await.unwrap();
        assert_eq!(messages.len(), 2);
        let original = messages
            .iter()
            .find(|m| m.client_ref.as_ref() == Some(&client_ref))
            .unwrap();
        assert_eq!(original.status, MessageStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resubscribes_and_server_unread_wins() {
        let mut h = start();
        let session = h.connect().await;

        session.push(&private_topic(), &group_message(1, 6, PEER, None));
        h.wait_for(|e| matches!(e, SyncEvent::UnreadChanged { count: 1, .. })).await;
        assert_eq!(h.handle.unread_total(), 1);

        h.rest.set_unread(vec![UnreadEntry {
            conversation_id: ConversationId(5),
            count: 3,
        }]);
        session.close();

        // Backoff, then a fresh session with a full resubscribe.
        let _session = h.accept().await;
        h.wait_for(|e| {
            matches!(e, SyncEvent::UnreadChanged { conversation_id: ConversationId(5), count: 3, .. })
        })
        .await;
        settle().await;

        assert_eq!(h.handle.unread_total(), 3);
        assert_eq!(
            h.handle.unread().await.unwrap(),
            vec![UnreadEntry {
                conversation_id: ConversationId(5),
                count: 3
            }]
        );
        assert_eq!(h.rest.unread_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_conversation_marks_read_and_pages() {
        let mut h = start();
        let conv = ConversationId(42);
        let item = |id: i64, min: u32| MessageFrame {
            server_id: ServerMessageId(id),
            client_ref: None,
            conversation_id: conv,
            conversation_kind: None,
            sender_id: PEER,
            body: tidings_shared::protocol::MessageBody::text("old"),
            kind: Default::default(),
            status: MessageStatus::Read,
            created_at: chrono::DateTime::parse_from_rfc3339(&format!("2024-01-01T00:{min:02}:00Z"))
                .unwrap()
                .into(),
        };
        h.rest.set_page(
            conv,
            1,
            MessagePage {
                items: vec![item(30, 30), item(31, 31)],
                has_more: true,
            },
        );
        h.rest.set_page(
            conv,
            2,
            MessagePage {
                items: vec![item(10, 10)],
                has_more: false,
            },
        );
        let session = h.connect().await;
        session.push(&private_topic(), &group_message(40, 42, PEER, None));
        h.wait_for(|e| matches!(e, SyncEvent::UnreadChanged { count: 1, .. })).await;

        let state = h.handle.open_conversation(conv).await.unwrap();
        assert_eq!(state, PageState { page: 1, has_more: true });
        assert_eq!(h.handle.unread_total(), 0);

        let state = h.handle.load_more().await.unwrap();
        assert_eq!(state, PageState { page: 2, has_more: false });
        // Exhausted history answers without another fetch.
        assert_eq!(h.handle.load_more().await.unwrap(), state);

        let ids: Vec<i64> = h
            .handle
            .messages(conv)
            .await
            .unwrap()
            .iter()
            .filter_map(|m| m.server_id.map(|s| s.0))
            .collect();
        assert_eq!(ids, vec![10, 30, 31, 40]);
        assert_eq!(h.rest.fetch_calls(), vec![(conv, 1), (conv, 2)]);
        assert_eq!(h.rest.mark_read_calls(), vec![conv]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_read_retries_once_without_rollback() {
        let mut h = start();
        let session = h.connect().await;
        session.push(&private_topic(), &group_message(1, 7, PEER, None));
        h.wait_for(|e| matches!(e, SyncEvent::UnreadChanged { count: 1, .. })).await;

        h.rest.fail_mark_read(2);
        assert_eq!(h.handle.mark_read(ConversationId(7)).await.unwrap(), 1);
        settle().await;

        assert_eq!(h.rest.mark_read_calls(), vec![ConversationId(7), ConversationId(7)]);
        assert_eq!(h.handle.unread_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_conversation_sends_read_receipt() {
        let mut h = start();
        let mut session = h.connect().await;
        h.handle.open_conversation(ConversationId(42)).await.unwrap();

        session.push(&private_topic(), &group_message(5, 42, PEER, None));
        let frame = session.recv().await.unwrap();
        match frame {
            ClientFrame::Send { destination, body } => {
                assert_eq!(destination, "/app/send-read-receipt");
                assert!(body.contains("\"upTo\":5"));
            }
            other => panic!("expected a read receipt, got {other:?}"),
        }
        assert_eq!(h.handle.unread_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dissolved_group_is_dropped() {
        let mut h = start();
        let session = h.connect().await;
        session.push(&private_topic(), &group_message(1, 12, PEER, None));
        h.wait_for(|e| matches!(e, SyncEvent::MessageAppended { .. })).await;

        let change = json!({"conversationId": 12, "change": "DISSOLVED"}).to_string();
        session.push(&Topic::GroupMemberChange.path_for(ME), &change);
        h.wait_for(|e| matches!(e, SyncEvent::ConversationRemoved { .. })).await;

        assert!(h.handle.messages(ConversationId(12)).await.unwrap().is_empty());
        assert!(h.handle.conversations().await.unwrap().is_empty());
        assert_eq!(h.handle.unread_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_indicator_expires() {
        let mut h = start();
        let session = h.connect().await;

        let notice = json!({"conversationId": 4, "userId": 9, "isTyping": true}).to_string();
        session.push(&Topic::Typing.path_for(ME), &notice);
        h.wait_for(|e| matches!(e, SyncEvent::TypingChanged { users, .. } if users == &vec![UserId(9)]))
            .await;

        h.wait_for(|e| matches!(e, SyncEvent::TypingChanged { users, .. } if users.is_empty()))
            .await;
        assert!(h.handle.typing_users(ConversationId(4)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_peer_resolved_after_list_refresh() {
        let mut h = start();
        let session = h.connect().await;

        h.rest.set_conversations(vec![ConversationSummary {
            conversation_id: ConversationId(42),
            kind: ConversationKind::Direct,
            display_name: "peer".into(),
            avatar_ref: None,
            peer_id: Some(PEER),
            last_message_preview: None,
            last_activity_at: None,
        }]);
        let raw = json!({
            "chatType": "PRIVATE",
            "serverId": 3,
            "senderId": PEER,
            "receiverId": ME,
            "body": "hi",
            "createdAt": "2024-05-01T12:00:00Z",
        })
        .to_string();
        session.push(&private_topic(), &raw);

        let event = h.wait_for(|e| matches!(e, SyncEvent::MessageAppended { .. })).await;
        let SyncEvent::MessageAppended { message } = event else {
            unreachable!()
        };
        assert_eq!(message.conversation_id, ConversationId(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnect_needs_explicit_connect() {
        let mut h = start();
        h.server.reject_next(6, "unauthorized");
        h.handle.connect(Credential::new("token")).await.unwrap();

        h.wait_for(|e| matches!(e, SyncEvent::ConnectionFailed { attempts: 5 })).await;
        settle().await;
        assert!(h.handle.connection_status().exhausted);
        assert_eq!(h.server.attempts(), 6);

        h.handle.connect(Credential::new("token")).await.unwrap();
        let _session = h.accept().await;
        settle().await;
        assert!(!h.handle.connection_status().exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_to_group_seen_before_list_load_goes_to_group() {
        let mut h = start();
        let mut session = h.connect().await;

        session.push(&private_topic(), &group_message(1, 12, PEER, None));
        h.wait_for(|e| matches!(e, SyncEvent::MessageAppended { .. })).await;

        h.handle.send_text(ConversationId(12), "reply").await.unwrap();
        let (destination, payload) = sent_payload(session.recv().await.unwrap());
        assert_eq!(destination, "/app/send-group-message");
        assert_eq!(payload.conversation_id, ConversationId(12));
        assert_eq!(payload.receiver_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_renewed_credential_after_rejection() {
        let mut h = start();
        h.server.reject_next(6, "token expired");
        h.handle.connect(Credential::new("expired")).await.unwrap();
        h.wait_for(|e| matches!(e, SyncEvent::ConnectionFailed { attempts: 5 })).await;

        h.handle.connect(Credential::new("renewed")).await.unwrap();
        let session = h.accept().await;
        settle().await;

        assert_eq!(session.credential, "renewed");
        assert_eq!(h.rest.tokens(), vec!["expired".to_string(), "renewed".to_string()]);
        assert!(!h.handle.connection_status().exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_arriving_after_dissolve_is_dropped() {
        let mut h = start();
        let conv = ConversationId(12);
        h.rest.set_page(
            conv,
            1,
            MessagePage {
                items: vec![MessageFrame {
                    server_id: ServerMessageId(3),
                    client_ref: None,
                    conversation_id: conv,
                    conversation_kind: None,
                    sender_id: PEER,
                    body: tidings_shared::protocol::MessageBody::text("old"),
                    kind: Default::default(),
                    status: MessageStatus::Read,
                    created_at: chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                        .unwrap()
                        .into(),
                }],
                has_more: false,
            },
        );
        h.rest.delay_fetch(Duration::from_secs(5));
        let session = h.connect().await;
        session.push(&private_topic(), &group_message(1, 12, PEER, None));
        h.wait_for(|e| matches!(e, SyncEvent::MessageAppended { .. })).await;

        let handle = h.handle.clone();
        let open = tokio::spawn(async move { handle.open_conversation(conv).await });
        settle().await;
        assert_eq!(h.rest.fetch_calls(), vec![(conv, 1)]);

        let change = json!({"conversationId": 12, "change": "DISSOLVED"}).to_string();
        session.push(&Topic::GroupMemberChange.path_for(ME), &change);
        h.wait_for(|e| matches!(e, SyncEvent::ConversationRemoved { .. })).await;

        let result = open.await.unwrap();
        assert_eq!(result, Err(ClientError::UnknownConversation(conv)));
        assert!(h.handle.conversations().await.unwrap().is_empty());
        assert!(h.handle.messages(conv).await.unwrap().is_empty());
        assert_eq!(h.handle.active_conversation().await.unwrap(), None);
    }
}
