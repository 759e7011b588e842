//! Receive-side typing indicators.
//!
//! Each `(conversation, user)` pair shown as typing owns one expiry task.
//! A fresh TYPING notice aborts the previous task and starts a new one, so
//! the indicator stays up for one TTL after the last notice. Expiries are
//! delivered on a channel and carry a generation so a stale expiry that
//! raced with a renewal is ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use tidings_shared::types::{ConversationId, UserId};

/// Posted when a typing indicator outlives its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingExpiry {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    generation: u64,
}

#[derive(Debug)]
struct Indicator {
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Debug)]
pub struct TypingTracker {
    ttl: Duration,
    active: HashMap<(ConversationId, UserId), Indicator>,
    next_generation: u64,
    expiry_tx: mpsc::UnboundedSender<TypingExpiry>,
}

impl TypingTracker {
    /// Create a tracker and the receiver its expiries arrive on.
    pub fn new(ttl: Duration) -> (Self, mpsc::UnboundedReceiver<TypingExpiry>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let tracker = Self {
            ttl,
            active: HashMap::new(),
            next_generation: 0,
            expiry_tx,
        };
        (tracker, expiry_rx)
    }

    /// Show `user` as typing in `conversation_id`, restarting the TTL.
    ///
    /// Returns `true` if the indicator was not already showing. Must be
    /// called from within a tokio runtime.
    pub fn start(&mut self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.next_generation += 1;
        let generation = self.next_generation;

        let tx = self.expiry_tx.clone();
        let ttl = self.ttl;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let _ = tx.send(TypingExpiry {
                conversation_id,
                user_id,
                generation,
            });
        });

        let previous = self
            .active
            .insert((conversation_id, user_id), Indicator { generation, timer });
        match previous {
            Some(old) => {
                old.timer.abort();
                false
            }
            None => true,
        }
    }

    /// Hide the indicator now. Returns `true` if it was showing.
    pub fn stop(&mut self, conversation_id: ConversationId, user_id: UserId) -> bool {
        match self.active.remove(&(conversation_id, user_id)) {
            Some(indicator) => {
                indicator.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Apply an expiry from the channel. Returns `true` if it hid an
    /// indicator; stale expiries return `false`.
    pub fn expire(&mut self, expiry: TypingExpiry) -> bool {
        let key = (expiry.conversation_id, expiry.user_id);
        match self.active.get(&key) {
            Some(current) if current.generation == expiry.generation => {
                self.active.remove(&key);
                debug!(
                    conversation = %expiry.conversation_id,
                    user = %expiry.user_id,
                    "Typing indicator expired"
                );
                true
            }
            _ => false,
        }
    }

    pub fn is_typing(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.active.contains_key(&(conversation_id, user_id))
    }

    /// Users currently typing in a conversation, ascending.
    pub fn typing_in(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .active
            .keys()
            .filter(|(conv, _)| *conv == conversation_id)
            .map(|(_, user)| *user)
            .collect();
        users.sort();
        users
    }

    /// Drop every indicator of a conversation.
    pub fn clear_conversation(&mut self, conversation_id: ConversationId) {
        self.active.retain(|(conv, _), indicator| {
            if *conv == conversation_id {
                indicator.timer.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn clear(&mut self) {
        for (_, indicator) in self.active.drain() {
            indicator.timer.abort();
        }
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        self.clear();
    }
}
