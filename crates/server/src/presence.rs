//! Presence fan-out: tells a user's connected friends when they come online or
//! go offline. Presence is advisory; nothing is queued for absent friends.

use std::sync::Arc;

use murmur_shared::{PresenceStatus, Room, ServerEvent, WsEnvelope};

use crate::registry::SessionRegistry;
use crate::services::FriendDirectory;

pub struct PresenceFanout {
    registry: Arc<SessionRegistry>,
    friends: Arc<dyn FriendDirectory>,
}

impl PresenceFanout {
    pub fn new(registry: Arc<SessionRegistry>, friends: Arc<dyn FriendDirectory>) -> Self {
        Self { registry, friends }
    }

    /// Deliver a `friend_status` event to the personal room of every friend
    /// with a live session, then broadcast the advisory online-user list.
    ///
    /// Returns the number of friends notified.
    pub async fn announce(&self, user_id: &str, status: PresenceStatus) -> usize {
        let friends = match self.friends.friends_of(user_id).await {
            Ok(friends) => friends,
            Err(e) => {
                tracing::warn!(user_id = %user_id, "Failed to load friends for presence: {}", e);
                Vec::new()
            }
        };

        let event = WsEnvelope::new(ServerEvent::FriendStatus {
            user_id: user_id.to_string(),
            status,
        });

        let mut notified = 0;
        for friend in friends {
            if !self.registry.is_online(&friend).await {
                continue;
            }
            notified += self.registry.deliver(&Room::User(friend), &event, None).await;
        }

        tracing::debug!(user_id = %user_id, ?status, notified, "Presence announced");

        self.broadcast_online_users().await;
        notified
    }

    /// Coarse "who is online" broadcast to every session. May be dropped.
    pub async fn broadcast_online_users(&self) -> usize {
        let online_users = self.registry.online_users().await;
        let event = WsEnvelope::new(ServerEvent::UserStatus { online_users });
        self.registry.broadcast(&event).await
    }
}
