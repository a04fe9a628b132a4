//! Interfaces to the collaborators the gateway consumes but does not own:
//! identity verification, the message store, and the group, friend, user and
//! device-key directories.

use std::sync::Arc;

use async_trait::async_trait;
use murmur_shared::{ChatError, ChatMessage, ChatTarget, Credential, GroupSummary, PersistedMessage, UserProfile};
use thiserror::Error;

/// Failure inside a storage collaborator.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("store unavailable")]
    Unavailable,
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        ChatError::Persistence(err.to_string())
    }
}

/// Turns a presented credential into a user identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify `credential` as a signature over the given request parts.
    async fn verify(
        &self,
        credential: &Credential,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> Result<String, ChatError>;
}

/// Durable create/query of chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create a message. When `message.client_id` matches a message already
    /// stored for the same sender, the existing record is returned instead.
    async fn create(
        &self,
        message: &ChatMessage,
        sender: Option<&UserProfile>,
    ) -> Result<PersistedMessage, StoreError>;

    /// A page of `chat` as seen by `viewer`, skipping the `skip` newest
    /// messages and returning at most `limit`, oldest first.
    async fn query_by_conversation(
        &self,
        viewer: &str,
        chat: &ChatTarget,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<PersistedMessage>, StoreError>;

    /// Mark one message read on behalf of `viewer`. Only a recipient can do
    /// this: the private receiver or a member of the group. Returns whether a
    /// message changed state.
    async fn mark_read(&self, viewer: &str, message_id: &str) -> Result<bool, StoreError>;

    /// Mark every message in `chat` not sent by `viewer` as read.
    async fn mark_conversation_read(&self, viewer: &str, chat: &ChatTarget) -> Result<u64, StoreError>;

    /// Messages in `chat` not sent by `viewer` that are still unread.
    async fn unread_count(&self, viewer: &str, chat: &ChatTarget) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn groups_of(&self, user_id: &str) -> Result<Vec<GroupSummary>, StoreError>;
    async fn group_exists(&self, group_id: &str) -> Result<bool, StoreError>;
    async fn is_member(&self, user_id: &str, group_id: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait FriendDirectory: Send + Sync {
    async fn friends_of(&self, user_id: &str) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// `None` when the user does not exist.
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError>;
}

/// Public keys registered for a user's devices.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn public_key(&self, handle: &str, key_id: &str) -> Result<Option<String>, StoreError>;
}

/// The set of collaborators handed to the gateway.
#[derive(Clone)]
pub struct Services {
    pub verifier: Arc<dyn IdentityVerifier>,
    pub messages: Arc<dyn MessageStore>,
    pub groups: Arc<dyn GroupDirectory>,
    pub friends: Arc<dyn FriendDirectory>,
    pub users: Arc<dyn UserDirectory>,
}

impl Services {
    /// Wire every directory to a single backing store.
    pub fn from_store<S>(store: Arc<S>, verifier: Arc<dyn IdentityVerifier>) -> Self
    where
        S: MessageStore + GroupDirectory + FriendDirectory + UserDirectory + 'static,
    {
        Self {
            verifier,
            messages: store.clone(),
            groups: store.clone(),
            friends: store.clone(),
            users: store,
        }
    }
}
