//! Public handle to the sync engine.
//!
//! Every call is a command sent into the engine task, answered on a
//! oneshot. Observers read the connection status and the global unread
//! total from watch channels and everything else from the event broadcast.

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use tidings_net::Credential;
use tidings_shared::protocol::UnreadEntry;
use tidings_shared::types::{ClientRef, ConnectionStatus, ConversationId, ServerMessageId, UserId};
use tidings_store::{Conversation, Draft, Message, PageState};

use crate::dispatcher::Dispatched;
use crate::error::{ClientError, Result};
use crate::events::SyncEvent;

/// Commands sent *into* the engine task.
pub(crate) enum EngineCommand {
    Connect {
        credential: Credential,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect(oneshot::Sender<Result<()>>),
    Send {
        conversation_id: ConversationId,
        draft: Draft,
        reply: oneshot::Sender<Dispatched>,
    },
    SendTyping {
        conversation_id: ConversationId,
        is_typing: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SendReaction {
        conversation_id: ConversationId,
        server_id: ServerMessageId,
        emoji: String,
        reply: oneshot::Sender<Result<()>>,
    },
    MarkRead {
        conversation_id: ConversationId,
        reply: oneshot::Sender<u32>,
    },
    OpenConversation {
        conversation_id: ConversationId,
        reply: oneshot::Sender<Result<PageState>>,
    },
    CloseConversation(oneshot::Sender<()>),
    LoadMore(oneshot::Sender<Result<PageState>>),
    ClearConversation {
        conversation_id: ConversationId,
        reply: oneshot::Sender<usize>,
    },
    Recall {
        conversation_id: ConversationId,
        server_id: ServerMessageId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Query(Query),
    Shutdown,
}

/// Read-only snapshot requests.
pub(crate) enum Query {
    Messages(ConversationId, oneshot::Sender<Vec<Message>>),
    PageState(ConversationId, oneshot::Sender<PageState>),
    Conversations(oneshot::Sender<Vec<Conversation>>),
    Unread(oneshot::Sender<Vec<UnreadEntry>>),
    OnlineUsers(oneshot::Sender<Vec<UserId>>),
    Typing(ConversationId, oneshot::Sender<Vec<UserId>>),
    Active(oneshot::Sender<Option<ConversationId>>),
}

/// Handle to a running sync engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncHandle {
    pub(crate) cmd_tx: mpsc::Sender<EngineCommand>,
    pub(crate) events: broadcast::Sender<SyncEvent>,
    pub(crate) status_rx: watch::Receiver<ConnectionStatus>,
    pub(crate) unread_rx: watch::Receiver<u32>,
}

impl SyncHandle {
    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn unread_total(&self) -> u32 {
        *self.unread_rx.borrow()
    }

    pub fn watch_unread_total(&self) -> watch::Receiver<u32> {
        self.unread_rx.clone()
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    /// Open the session with `credential`, which also becomes the REST
    /// bearer token. While connecting, connected or waiting out a backoff
    /// nothing is dialed and the credential is kept for the next handshake.
    /// After an exhausted reconnect it starts over with a fresh budget.
    pub async fn connect(&self, credential: Credential) -> Result<()> {
        self.request(|reply| EngineCommand::Connect { credential, reply })
            .await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(EngineCommand::Disconnect).await?
    }

    /// Stop the engine and its connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.cmd_tx
            .send(EngineCommand::Shutdown)
            .await
            .map_err(|_| ClientError::EngineClosed)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send a message. The returned ref identifies the optimistic entry;
    /// an immediate failure is reported in `failure`, never as an error.
    pub async fn send(&self, conversation_id: ConversationId, draft: Draft) -> Result<Dispatched> {
        self.request(|reply| EngineCommand::Send {
            conversation_id,
            draft,
            reply,
        })
        .await
    }

    pub async fn send_text(
        &self,
        conversation_id: ConversationId,
        text: impl Into<String>,
    ) -> Result<ClientRef> {
        Ok(self.send(conversation_id, Draft::text(text)).await?.client_ref)
    }

    pub async fn send_typing(&self, conversation_id: ConversationId, is_typing: bool) -> Result<()> {
        self.request(|reply| EngineCommand::SendTyping {
            conversation_id,
            is_typing,
            reply,
        })
        .await?
    }

    pub async fn send_reaction(
        &self,
        conversation_id: ConversationId,
        server_id: ServerMessageId,
        emoji: impl Into<String>,
    ) -> Result<()> {
        let emoji = emoji.into();
        self.request(|reply| EngineCommand::SendReaction {
            conversation_id,
            server_id,
            emoji,
            reply,
        })
        .await?
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Reset the unread counter and tell the server. Returns the count
    /// that was cleared.
    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<u32> {
        self.request(|reply| EngineCommand::MarkRead {
            conversation_id,
            reply,
        })
        .await
    }

    /// Make `conversation_id` the active one, mark it read and load its
    /// latest page.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<PageState> {
        self.request(|reply| EngineCommand::OpenConversation {
            conversation_id,
            reply,
        })
        .await?
    }

    pub async fn close_conversation(&self) -> Result<()> {
        self.request(EngineCommand::CloseConversation).await
    }

    /// Load the next older page of the active conversation.
    pub async fn load_more(&self) -> Result<PageState> {
        self.request(EngineCommand::LoadMore).await?
    }

    pub async fn clear_conversation(&self, conversation_id: ConversationId) -> Result<usize> {
        self.request(|reply| EngineCommand::ClearConversation {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn recall(
        &self,
        conversation_id: ConversationId,
        server_id: ServerMessageId,
    ) -> Result<bool> {
        self.request(|reply| EngineCommand::Recall {
            conversation_id,
            server_id,
            reply,
        })
        .await?
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub async fn messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.query(|reply| Query::Messages(conversation_id, reply)).await
    }

    pub async fn page_state(&self, conversation_id: ConversationId) -> Result<PageState> {
        self.query(|reply| Query::PageState(conversation_id, reply)).await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.query(Query::Conversations).await
    }

    pub async fn unread(&self) -> Result<Vec<UnreadEntry>> {
        self.query(Query::Unread).await
    }

    pub async fn online_users(&self) -> Result<Vec<UserId>> {
        self.query(Query::OnlineUsers).await
    }

    pub async fn typing_users(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        self.query(|reply| Query::Typing(conversation_id, reply)).await
    }

    pub async fn active_conversation(&self) -> Result<Option<ConversationId>> {
        self.query(Query::Active).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| ClientError::EngineClosed)?;
        rx.await.map_err(|_| ClientError::EngineClosed)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T> {
        self.request(|reply| EngineCommand::Query(make(reply))).await
    }
}
