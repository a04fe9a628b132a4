//! Local conversation state.
//!
//! Messages are kept per chat in local insertion order. Server timestamps are
//! carried as metadata but never used to reorder. Every message has a local
//! sequence number; optimistic sends also carry a provisional `local_id` until
//! the server assigns a persisted id.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use murmur_shared::{ChatMessage, ChatTarget, HistoryPage, PersistedMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Shown locally, not yet confirmed by the server.
    Pending,
    Sent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalMessage {
    pub seq: u64,
    pub local_id: Option<String>,
    pub server_id: Option<String>,
    pub message: ChatMessage,
    pub status: DeliveryStatus,
    pub from_self: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    pub chat_id: ChatTarget,
    pub ordered_messages: Vec<LocalMessage>,
    pub unread_count: u64,
    pub last_message_preview: Option<String>,
    /// Whether history was fetched from the server at least once.
    pub history_loaded: bool,
}

impl ConversationState {
    fn new(chat_id: ChatTarget) -> Self {
        Self {
            chat_id,
            ordered_messages: Vec::new(),
            unread_count: 0,
            last_message_preview: None,
            history_loaded: false,
        }
    }

    fn has_server_id(&self, id: &str) -> bool {
        self.ordered_messages.iter().any(|m| m.server_id.as_deref() == Some(id))
    }

    fn find_local_mut(&mut self, local_id: &str) -> Option<&mut LocalMessage> {
        self.ordered_messages
            .iter_mut()
            .find(|m| m.local_id.as_deref() == Some(local_id))
    }

    fn push(&mut self, entry: LocalMessage) {
        self.last_message_preview = Some(entry.message.content.clone());
        self.ordered_messages.push(entry);
    }
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<ChatTarget, ConversationState>,
    next_seq: u64,
    active: Option<ChatTarget>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn conversation(&mut self, chat: &ChatTarget) -> &mut ConversationState {
        self.conversations
            .entry(chat.clone())
            .or_insert_with(|| ConversationState::new(chat.clone()))
    }
}

/// Conversations as seen by one user.
pub struct ConversationStore {
    user_id: String,
    inner: RwLock<Inner>,
}

impl ConversationStore {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an optimistic message authored by this user. The returned
    /// entry's `local_id` is the provisional id.
    pub fn append_local(&self, target: &ChatTarget, content: &str) -> LocalMessage {
        let local_id = uuid::Uuid::new_v4().to_string();
        let message = ChatMessage::new(self.user_id.clone(), target, content).with_client_id(local_id.clone());

        let mut inner = self.write();
        let entry = LocalMessage {
            seq: inner.next_seq(),
            local_id: Some(local_id),
            server_id: None,
            message,
            status: DeliveryStatus::Pending,
            from_self: true,
        };
        inner.conversation(target).push(entry.clone());
        entry
    }

    /// Fold a server-delivered message into its conversation. Returns the
    /// chat it landed in, or `None` when it was a duplicate or unaddressable.
    pub fn merge_remote(&self, persisted: &PersistedMessage) -> Option<ChatTarget> {
        self.absorb(persisted, true)
    }

    /// Confirm an optimistic send. The provisional entry keeps its position
    /// and takes the persisted id.
    pub fn reconcile_ack(&self, local_id: &str, persisted: &PersistedMessage) -> bool {
        let Ok(chat) = persisted.message.chat_for(&self.user_id) else {
            return false;
        };
        let mut inner = self.write();
        let conversation = inner.conversation(&chat);

        // History or a websocket ack may already have brought the persisted copy.
        let duplicate_at = conversation.ordered_messages.iter().position(|m| {
            m.server_id.as_deref() == Some(persisted.id.as_str()) && m.local_id.as_deref() != Some(local_id)
        });

        let Some(entry) = conversation.find_local_mut(local_id) else {
            return false;
        };
        entry.server_id = Some(persisted.id.clone());
        entry.message = persisted.message.clone();
        entry.status = DeliveryStatus::Sent;

        if let Some(index) = duplicate_at {
            conversation.ordered_messages.remove(index);
        }
        true
    }

    /// Merge a page of history. Messages already present are skipped; new
    /// ones are appended in page order and never count as unread.
    pub fn merge_history(&self, page: &HistoryPage) -> usize {
        let added = page.items.iter().filter(|item| self.absorb(item, false).is_some()).count();
        self.write().conversation(&page.chat_id).history_loaded = true;
        added
    }

    fn absorb(&self, persisted: &PersistedMessage, count_unread: bool) -> Option<ChatTarget> {
        let chat = match persisted.message.chat_for(&self.user_id) {
            Ok(chat) => chat,
            Err(_) => {
                tracing::warn!(message_id = %persisted.id, "Dropping message without a valid address");
                return None;
            }
        };
        let from_self = persisted.message.sender_id == self.user_id;

        let mut inner = self.write();
        let seq = inner.next_seq();
        let is_active = inner.active.as_ref() == Some(&chat);
        let conversation = inner.conversation(&chat);

        if conversation.has_server_id(&persisted.id) {
            return None;
        }
        if from_self {
            if let Some(client_id) = persisted.message.client_id.as_deref() {
                if let Some(entry) = conversation.find_local_mut(client_id) {
                    entry.server_id = Some(persisted.id.clone());
                    entry.status = DeliveryStatus::Sent;
                    return None;
                }
            }
        }

        conversation.push(LocalMessage {
            seq,
            local_id: None,
            server_id: Some(persisted.id.clone()),
            message: persisted.message.clone(),
            status: DeliveryStatus::Sent,
            from_self,
        });
        if count_unread && !from_self && !is_active {
            conversation.unread_count += 1;
        }
        Some(chat)
    }

    /// The conversation currently open on screen. Messages arriving for it
    /// are not counted as unread.
    pub fn set_active(&self, chat: Option<ChatTarget>) {
        self.write().active = chat;
    }

    pub fn active(&self) -> Option<ChatTarget> {
        self.read().active.clone()
    }

    pub fn set_unread(&self, chat: &ChatTarget, count: u64) {
        self.write().conversation(chat).unread_count = count;
    }

    pub fn clear_unread(&self, chat: &ChatTarget) {
        self.set_unread(chat, 0);
    }

    pub fn unread_count(&self, chat: &ChatTarget) -> u64 {
        self.read().conversations.get(chat).map_or(0, |c| c.unread_count)
    }

    pub fn snapshot(&self, chat: &ChatTarget) -> Option<ConversationState> {
        self.read().conversations.get(chat).cloned()
    }

    /// Every known chat id.
    pub fn chats(&self) -> Vec<ChatTarget> {
        let mut chats: Vec<ChatTarget> = self.read().conversations.keys().cloned().collect();
        chats.sort();
        chats
    }
}
