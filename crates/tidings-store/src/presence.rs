//! Online presence of other users.
//!
//! Maintains an in-memory map of users the server reported as online and
//! when that was last observed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use tidings_shared::types::UserId;

/// Tracks which users are currently online.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: HashMap<UserId, DateTime<Utc>>,
}

impl PresenceTracker {
    /// Create a new, empty presence tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence report. Returns `true` if it changed anything.
    pub fn set_online(&mut self, user: UserId, online: bool) -> bool {
        let changed = if online {
            self.online.insert(user, Utc::now()).is_none()
        } else {
            self.online.remove(&user).is_some()
        };
        if changed {
            debug!(user = %user, online, "Presence changed");
        }
        changed
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.online.contains_key(&user)
    }

    /// When `user` was last reported online, if they still are.
    pub fn online_since(&self, user: UserId) -> Option<DateTime<Utc>> {
        self.online.get(&user).copied()
    }

    /// Online users in ascending id order.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.keys().copied().collect();
        users.sort();
        users
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Forget everything, e.g. when the session drops.
    pub fn clear(&mut self) {
        self.online.clear();
    }
}
