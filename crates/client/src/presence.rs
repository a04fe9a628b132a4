//! Last known presence of friends.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use murmur_shared::{PresenceStatus, ServerEvent};

#[derive(Default)]
struct Inner {
    statuses: HashMap<String, PresenceStatus>,
    /// Advisory; the server sends the full list on connect.
    online_users: Vec<String>,
}

#[derive(Default)]
pub struct PresenceStore {
    inner: RwLock<Inner>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a presence event. Returns `false` for any other event.
    pub fn apply(&self, event: &ServerEvent) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            ServerEvent::FriendStatus { user_id, status } => {
                inner.statuses.insert(user_id.clone(), *status);
                match status {
                    PresenceStatus::Online => {
                        if !inner.online_users.contains(user_id) {
                            inner.online_users.push(user_id.clone());
                        }
                    }
                    PresenceStatus::Offline => inner.online_users.retain(|u| u != user_id),
                }
                true
            }
            ServerEvent::UserStatus { online_users } => {
                inner.online_users = online_users.clone();
                true
            }
            _ => false,
        }
    }

    /// Unknown users are reported offline.
    pub fn status_of(&self, user_id: &str) -> PresenceStatus {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses
            .get(user_id)
            .copied()
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn online_users(&self) -> Vec<String> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).online_users.clone()
    }
}
