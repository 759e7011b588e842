//! Outbound dispatcher: turns user intents into frames.
//!
//! A message send adds an optimistic entry, hands the frame to the
//! connection and arms a timeout for it. A send the connection refuses is
//! failed at once; one it accepts stays PENDING until the server confirms it
//! or the timeout fails it. Nothing is retried automatically: a retry is a
//! new send with a new client ref.
//!
//! Typing, read-receipt and reaction signals are fire-and-forget.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tidings_net::ConnectionManager;
use tidings_shared::protocol::{
    ClientFrame, Destination, OutboundMessage, ReactionSignal, ReadReceiptSignal, TypingSignal,
};
use tidings_shared::types::{ClientRef, ConversationId, ConversationKind, ServerMessageId};
use tidings_store::{Draft, MessageStore};

use crate::error::Result;

/// Result of a message send.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub client_ref: ClientRef,
    pub conversation_id: ConversationId,
    /// Why the send failed immediately, if it did.
    pub failure: Option<String>,
}

pub struct OutboundDispatcher {
    conn: ConnectionManager,
    send_timeout: Duration,
    timers: HashMap<ClientRef, JoinHandle<()>>,
    timeout_tx: mpsc::UnboundedSender<ClientRef>,
}

impl OutboundDispatcher {
    /// Create a dispatcher and the receiver its send timeouts arrive on.
    pub fn new(
        conn: ConnectionManager,
        send_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ClientRef>) {
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            conn,
            send_timeout,
            timers: HashMap::new(),
            timeout_tx,
        };
        (dispatcher, timeout_rx)
    }

    /// Send a message to `conversation_id`.
    pub fn send(
        &mut self,
        store: &mut MessageStore,
        conversation_id: ConversationId,
        draft: Draft,
    ) -> Dispatched {
        let (destination, receiver_id) = match store.directory().get(conversation_id) {
            Some(c) if c.kind == ConversationKind::Group => (Destination::SendGroupMessage, None),
            Some(c) => (Destination::SendPrivateMessage, c.peer_id),
            None => (Destination::SendPrivateMessage, None),
        };

        let payload_body = draft.body.clone();
        let kind = draft.kind;
        let client_ref = store.append_optimistic(conversation_id, draft);

        let payload = OutboundMessage {
            client_ref: client_ref.clone(),
            conversation_id,
            receiver_id,
            body: payload_body,
            kind,
            created_at: Utc::now(),
        };

        let handed_over = ClientFrame::send(destination, &payload)
            .map_err(crate::error::ClientError::from)
            .and_then(|frame| self.conn.send(frame).map_err(Into::into));

        let failure = match handed_over {
            Ok(()) => {
                self.arm_timeout(client_ref.clone());
                debug!(conversation = %conversation_id, client_ref = %client_ref, "Message handed to transport");
                None
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(store_err) = store.mark_failed(&client_ref, &reason) {
                    warn!(error = %store_err, "Could not fail refused send");
                }
                Some(reason)
            }
        };

        Dispatched {
            client_ref,
            conversation_id,
            failure,
        }
    }

    fn arm_timeout(&mut self, client_ref: ClientRef) {
        let tx = self.timeout_tx.clone();
        let timeout = self.send_timeout;
        let key = client_ref.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(client_ref);
        });
        if let Some(old) = self.timers.insert(key, timer) {
            old.abort();
        }
    }

    /// The send for `client_ref` was resolved; cancel its timeout.
    pub fn resolve(&mut self, client_ref: &ClientRef) -> bool {
        match self.timers.remove(client_ref) {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Handle a fired timeout: fail the entry if it is still unconfirmed.
    ///
    /// Returns the conversation of the failed entry.
    pub fn on_timeout(
        &mut self,
        store: &mut MessageStore,
        client_ref: &ClientRef,
    ) -> Option<ConversationId> {
        if self.timers.remove(client_ref).is_none() {
            debug!(client_ref = %client_ref, "Stale send timeout ignored");
            return None;
        }
        let unconfirmed = store
            .find_by_client_ref(client_ref)
            .map_or(false, |m| m.server_id.is_none());
        if !unconfirmed {
            return None;
        }
        match store.mark_failed(client_ref, "timed out waiting for confirmation") {
            Ok(conversation) => conversation,
            Err(e) => {
                debug!(error = %e, "Timed out send no longer tracked");
                None
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    pub fn send_typing(&self, conversation_id: ConversationId, is_typing: bool) -> Result<()> {
        let signal = TypingSignal {
            conversation_id,
            is_typing,
        };
        self.signal(Destination::SendTyping, &signal)
    }

    pub fn send_read_receipt(
        &self,
        conversation_id: ConversationId,
        up_to: Option<ServerMessageId>,
    ) -> Result<()> {
        let signal = ReadReceiptSignal {
            conversation_id,
            up_to,
        };
        self.signal(Destination::SendReadReceipt, &signal)
    }

    pub fn send_reaction(
        &self,
        conversation_id: ConversationId,
        server_id: ServerMessageId,
        emoji: String,
    ) -> Result<()> {
        let signal = ReactionSignal {
            conversation_id,
            server_id,
            emoji,
        };
        self.signal(Destination::SendReaction, &signal)
    }

    fn signal<T: serde::Serialize>(&self, destination: Destination, payload: &T) -> Result<()> {
        let frame = ClientFrame::send(destination, payload)?;
        self.conn.send(frame)?;
        Ok(())
    }

    /// Cancel every outstanding timeout.
    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }
}

impl Drop for OutboundDispatcher {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidings_net::memory;
    use tidings_net::{ConnectionConfig, ConnectionEvent, Credential};
    use tidings_shared::types::{MessageStatus, UserId};

    const ME: UserId = UserId(1);

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_fails_immediately() {
        let (connector, _server) = memory::pair();
        let (conn, _events, _task) = ConnectionManager::spawn(connector, ConnectionConfig::default());
        let (mut dispatcher, _timeouts) = OutboundDispatcher::new(conn, Duration::from_secs(10));
        let mut store = MessageStore::new(ME);

        let sent = dispatcher.send(&mut store, ConversationId(42), Draft::text("hello"));

        assert!(sent.failure.is_some());
        assert_eq!(dispatcher.pending(), 0);
        let entry = store.find_by_client_ref(&sent.client_ref).unwrap();
        assert_eq!(entry.status, MessageStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_send_times_out() {
        let (connector, mut server) = memory::pair();
        let (conn, mut events, _task) =
            ConnectionManager::spawn(connector, ConnectionConfig::default());
        conn.connect(Credential::new("t")).unwrap();
        let mut session = server.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));

        let (mut dispatcher, mut timeouts) =
            OutboundDispatcher::new(conn, Duration::from_secs(10));
        let mut store = MessageStore::new(ME);
        let sent = dispatcher.send(&mut store, ConversationId(42), Draft::text("hello"));
        assert!(sent.failure.is_none());
        assert!(matches!(session.recv().await, Some(ClientFrame::Send { .. })));

        let fired = timeouts.recv().await.unwrap();
        assert_eq!(fired, sent.client_ref);
        assert_eq!(
            dispatcher.on_timeout(&mut store, &fired),
            Some(ConversationId(42))
        );
        assert_eq!(
            store.find_by_client_ref(&sent.client_ref).unwrap().status,
            MessageStatus::Failed
        );
        // A second delivery of the same timeout is a no-op.
        assert_eq!(dispatcher.on_timeout(&mut store, &fired), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_send_never_times_out() {
        let (connector, mut server) = memory::pair();
        let (conn, mut events, _task) =
            ConnectionManager::spawn(connector, ConnectionConfig::default());
        conn.connect(Credential::new("t")).unwrap();
        let _session = server.accept().await.unwrap();
        assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));

        let (mut dispatcher, mut timeouts) =
            OutboundDispatcher::new(conn, Duration::from_secs(10));
        let mut store = MessageStore::new(ME);
        let sent = dispatcher.send(&mut store, ConversationId(3), Draft::text("x"));

        assert!(dispatcher.resolve(&sent.client_ref));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(timeouts.try_recv().is_err());
    }
}
