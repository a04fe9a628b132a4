//! In-memory implementation of every storage collaborator.
//!
//! Used for tests and for `MURMUR_STORAGE=memory` development runs. Writes can
//! be switched to fail to exercise the persistence-error paths.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use murmur_shared::{ChatMessage, ChatTarget, GroupSummary, PersistedMessage, UserProfile};
use tokio::sync::RwLock;

use crate::services::{FriendDirectory, GroupDirectory, KeyDirectory, MessageStore, StoreError, UserDirectory};

#[derive(Default)]
struct MemoryInner {
    users: HashMap<String, UserProfile>,
    groups: HashMap<String, GroupSummary>,
    members: HashSet<(String, String)>,
    friends: HashMap<String, BTreeSet<String>>,
    device_keys: HashMap<(String, String), String>,
    /// Stored in creation order.
    messages: Vec<PersistedMessage>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    fail_writes: AtomicBool,
}

/// Whether `message` belongs to `chat` as seen by `viewer`.
fn in_conversation(message: &ChatMessage, viewer: &str, chat: &ChatTarget) -> bool {
    match chat {
        ChatTarget::Group(group) => message.group_id.as_deref() == Some(group.as_str()),
        ChatTarget::User(peer) => {
            let receiver = message.receiver_id.as_deref();
            (message.sender_id == viewer && receiver == Some(peer.as_str()))
                || (message.sender_id == *peer && receiver == Some(viewer))
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent message write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn add_user(&self, id: &str, display_name: Option<&str>) {
        let profile = UserProfile {
            id: id.to_string(),
            display_name: display_name.map(str::to_string),
            avatar: None,
        };
        self.inner.write().await.users.insert(id.to_string(), profile);
    }

    pub async fn add_group(&self, id: &str, name: &str) {
        let group = GroupSummary {
            id: id.to_string(),
            name: name.to_string(),
        };
        self.inner.write().await.groups.insert(id.to_string(), group);
    }

    pub async fn add_member(&self, group_id: &str, user_id: &str) {
        self.inner
            .write()
            .await
            .members
            .insert((group_id.to_string(), user_id.to_string()));
    }

    pub async fn remove_member(&self, group_id: &str, user_id: &str) {
        self.inner
            .write()
            .await
            .members
            .remove(&(group_id.to_string(), user_id.to_string()));
    }

    /// Friendship is symmetric.
    pub async fn add_friendship(&self, a: &str, b: &str) {
        let mut inner = self.inner.write().await;
        inner.friends.entry(a.to_string()).or_default().insert(b.to_string());
        inner.friends.entry(b.to_string()).or_default().insert(a.to_string());
    }

    pub async fn add_device_key(&self, handle: &str, key_id: &str, public_key: &str) {
        self.inner
            .write()
            .await
            .device_keys
            .insert((handle.to_string(), key_id.to_string()), public_key.to_string());
    }

    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    pub async fn all_messages(&self) -> Vec<PersistedMessage> {
        self.inner.read().await.messages.clone()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(
        &self,
        message: &ChatMessage,
        sender: Option<&UserProfile>,
    ) -> Result<PersistedMessage, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;

        if let Some(client_id) = &message.client_id {
            let existing = inner.messages.iter().find(|m| {
                m.message.sender_id == message.sender_id && m.message.client_id.as_ref() == Some(client_id)
            });
            if let Some(existing) = existing {
                return Ok(existing.clone());
            }
        }

        let persisted = PersistedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            message: message.clone(),
            sender_name: sender.and_then(|p| p.display_name.clone()),
            sender_avatar: sender.and_then(|p| p.avatar.clone()),
            read_status: false,
            is_deleted: false,
        };
        inner.messages.push(persisted.clone());
        Ok(persisted)
    }

    async fn query_by_conversation(
        &self,
        viewer: &str,
        chat: &ChatTarget,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<PersistedMessage>, StoreError> {
        let inner = self.inner.read().await;
        let mut page: Vec<PersistedMessage> = inner
            .messages
            .iter()
            .rev()
            .filter(|m| !m.is_deleted && in_conversation(&m.message, viewer, chat))
            .skip(skip)
            .take(limit)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn mark_read(&self, viewer: &str, message_id: &str) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let MemoryInner { messages, members, .. } = &mut *inner;
        let Some(message) = messages.iter_mut().find(|m| m.id == message_id) else {
            return Ok(false);
        };
        let received = match &message.message.group_id {
            Some(group) => members.contains(&(group.clone(), viewer.to_string())),
            None => message.message.receiver_id.as_deref() == Some(viewer),
        };
        if !received || message.message.sender_id == viewer || message.read_status {
            return Ok(false);
        }
        message.read_status = true;
        Ok(true)
    }

    async fn mark_conversation_read(&self, viewer: &str, chat: &ChatTarget) -> Result<u64, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let mut updated = 0;
        for message in inner.messages.iter_mut() {
            if message.read_status
                || message.message.sender_id == viewer
                || !in_conversation(&message.message, viewer, chat)
            {
                continue;
            }
            message.read_status = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn unread_count(&self, viewer: &str, chat: &ChatTarget) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        let count = inner
            .messages
            .iter()
            .filter(|m| {
                !m.read_status
                    && !m.is_deleted
                    && m.message.sender_id != viewer
                    && in_conversation(&m.message, viewer, chat)
            })
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl GroupDirectory for MemoryStore {
    async fn groups_of(&self, user_id: &str) -> Result<Vec<GroupSummary>, StoreError> {
        let inner = self.inner.read().await;
        let mut groups: Vec<GroupSummary> = inner
            .members
            .iter()
            .filter(|(_, member)| member == user_id)
            .filter_map(|(group_id, _)| inner.groups.get(group_id).cloned())
            .collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    async fn group_exists(&self, group_id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.groups.contains_key(group_id))
    }

    async fn is_member(&self, user_id: &str, group_id: &str) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.members.contains(&(group_id.to_string(), user_id.to_string())))
    }
}

#[async_trait]
impl FriendDirectory for MemoryStore {
    async fn friends_of(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .friends
            .get(user_id)
            .map(|friends| friends.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.inner.read().await.users.get(user_id).cloned())
    }
}

#[async_trait]
impl KeyDirectory for MemoryStore {
    async fn public_key(&self, handle: &str, key_id: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .device_keys
            .get(&(handle.to_string(), key_id.to_string()))
            .cloned())
    }
}
