//! Per-conversation unread counters.
//!
//! Counts are never negative and an absent entry reads as zero. The server
//! snapshot is authoritative: `sync_from_server` replaces everything.

use std::collections::HashMap;

use tracing::debug;

use tidings_shared::protocol::UnreadEntry;
use tidings_shared::types::ConversationId;

#[derive(Debug, Clone, Default)]
pub struct UnreadTracker {
    counts: HashMap<ConversationId, u32>,
}

impl UnreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the counter for a message that arrived while the conversation
    /// was not in view. Returns the new count.
    pub fn increment(&mut self, conversation_id: ConversationId) -> u32 {
        let count = self.counts.entry(conversation_id).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Reset the local counter. Returns the count it had before.
    ///
    /// The reset is immediate and is not undone if the server call that
    /// follows it fails.
    pub fn mark_read(&mut self, conversation_id: ConversationId) -> u32 {
        self.counts.remove(&conversation_id).unwrap_or(0)
    }

    /// Replace every counter with the server's snapshot.
    pub fn sync_from_server(&mut self, entries: &[UnreadEntry]) {
        self.counts = entries
            .iter()
            .filter(|e| e.count > 0)
            .map(|e| (e.conversation_id, e.count))
            .collect();
        debug!(conversations = self.counts.len(), total = self.total(), "Unread counts synced");
    }

    pub fn remove(&mut self, conversation_id: ConversationId) {
        self.counts.remove(&conversation_id);
    }

    pub fn count(&self, conversation_id: ConversationId) -> u32 {
        self.counts.get(&conversation_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts
            .values()
            .fold(0u32, |acc, c| acc.saturating_add(*c))
    }

    /// Non-zero counters, ordered by conversation id.
    pub fn snapshot(&self) -> Vec<UnreadEntry> {
        let mut entries: Vec<UnreadEntry> = self
            .counts
            .iter()
            .map(|(id, count)| UnreadEntry {
                conversation_id: *id,
                count: *count,
            })
            .collect();
        entries.sort_by_key(|e| e.conversation_id);
        entries
    }
}
