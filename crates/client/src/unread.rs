//! Read receipts and server-side unread counts.

use std::sync::Arc;

use futures_util::future::join_all;
use murmur_shared::{ApiError, ChatTarget};
use tokio::task::JoinHandle;

use crate::api_client::MessageApi;
use crate::conversations::ConversationStore;

pub struct ReadReceipts {
    conversations: Arc<ConversationStore>,
    api: Arc<dyn MessageApi>,
}

impl ReadReceipts {
    pub fn new(conversations: Arc<ConversationStore>, api: Arc<dyn MessageApi>) -> Self {
        Self { conversations, api }
    }

    /// Open `chat`: its unread counter drops to zero at once and the server
    /// is asked in the background to mark the persisted messages read. A
    /// failed request is logged; the local counter stays at zero.
    pub fn mark_as_read(&self, chat: &ChatTarget) -> JoinHandle<()> {
        self.conversations.set_active(Some(chat.clone()));
        self.conversations.clear_unread(chat);

        let api = self.api.clone();
        let chat = chat.clone();
        tokio::spawn(async move {
            match api.mark_conversation_read(&chat).await {
                Ok(response) => tracing::debug!(chat = %chat, updated = response.updated, "Marked conversation read"),
                Err(e) => tracing::warn!(chat = %chat, "Failed to mark conversation read: {}", e),
            }
        })
    }

    /// Mark a single received message read. Returns whether the server
    /// changed anything; it ignores messages the caller did not receive.
    pub async fn mark_message_read(&self, message_id: &str) -> Result<bool, ApiError> {
        let response = self.api.mark_read(message_id).await?;
        tracing::debug!(message_id, updated = response.updated, "Marked message read");
        Ok(response.updated > 0)
    }

    /// Fetch unread counts for `chats` concurrently. Chats whose query fails
    /// keep their local value. Returns how many were updated.
    pub async fn sync_unread_counts(&self, chats: &[ChatTarget]) -> usize {
        let results = join_all(chats.iter().map(|chat| self.api.unread_count(chat))).await;

        let mut updated = 0;
        for (chat, result) in chats.iter().zip(results) {
            match result {
                Ok(count) => {
                    self.conversations.set_unread(chat, count.count);
                    updated += 1;
                }
                Err(e) => tracing::debug!(chat = %chat, "Unread count unavailable: {}", e),
            }
        }
        updated
    }
}
