//! Shared data models for chat messages, rooms and presence.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

// --- Addressing ---

/// The conversation a message belongs to, from one participant's point of view.
///
/// Serialized as `user:{peerId}` or `group:{groupId}`; the same string is the
/// `chatId` used by the history and read-receipt routes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChatTarget {
    User(String),
    Group(String),
}

impl ChatTarget {
    pub fn user(id: impl Into<String>) -> Self {
        ChatTarget::User(id.into())
    }

    pub fn group(id: impl Into<String>) -> Self {
        ChatTarget::Group(id.into())
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ChatTarget::Group(_))
    }

    pub fn id(&self) -> &str {
        match self {
            ChatTarget::User(id) | ChatTarget::Group(id) => id,
        }
    }
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatTarget::User(id) => write!(f, "user:{}", id),
            ChatTarget::Group(id) => write!(f, "group:{}", id),
        }
    }
}

impl FromStr for ChatTarget {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("user", id)) if !id.is_empty() => Ok(ChatTarget::User(id.to_string())),
            Some(("group", id)) if !id.is_empty() => Ok(ChatTarget::Group(id.to_string())),
            _ => Err(ChatError::Malformed),
        }
    }
}

impl TryFrom<String> for ChatTarget {
    type Error = ChatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChatTarget> for String {
    fn from(target: ChatTarget) -> Self {
        target.to_string()
    }
}

/// An addressable broadcast group on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// Personal room; its only subscriber is the user's active session.
    User(String),
    /// Group room; subscribers are the connected members of the group.
    Group(String),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user:{}", id),
            Room::Group(id) => write!(f, "group:{}", id),
        }
    }
}

// --- Messaging ---

/// A chat message as it travels on the wire.
///
/// Exactly one of `receiver_id` / `group_id` is set; that field decides whether
/// the message is routed privately or to a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub content: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    /// Client-generated idempotency key (the pending message's local id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ChatMessage {
    pub fn new(sender_id: impl Into<String>, target: &ChatTarget, content: impl Into<String>) -> Self {
        let (receiver_id, group_id) = match target {
            ChatTarget::User(id) => (Some(id.clone()), None),
            ChatTarget::Group(id) => (None, Some(id.clone())),
        };

        Self {
            content: content.into(),
            sender_id: sender_id.into(),
            receiver_id,
            group_id,
            sent_at: Utc::now(),
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Where this message is addressed. Fails when both or neither of
    /// `receiver_id` / `group_id` are set.
    pub fn target(&self) -> Result<ChatTarget, ChatError> {
        match (&self.receiver_id, &self.group_id) {
            (Some(receiver), None) if !receiver.is_empty() => Ok(ChatTarget::User(receiver.clone())),
            (None, Some(group)) if !group.is_empty() => Ok(ChatTarget::Group(group.clone())),
            _ => Err(ChatError::Malformed),
        }
    }

    /// The conversation this message belongs to as seen by `viewer_id`.
    pub fn chat_for(&self, viewer_id: &str) -> Result<ChatTarget, ChatError> {
        match self.target()? {
            ChatTarget::Group(id) => Ok(ChatTarget::Group(id)),
            ChatTarget::User(receiver) if self.sender_id == viewer_id => Ok(ChatTarget::User(receiver)),
            ChatTarget::User(_) => Ok(ChatTarget::User(self.sender_id.clone())),
        }
    }
}

/// A chat message after the message store accepted it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub id: String,
    #[serde(flatten)]
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    #[serde(default)]
    pub read_status: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

impl PersistedMessage {
    pub fn is_private(&self) -> bool {
        self.message.group_id.is_none()
    }
}

// --- Presence ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

// --- Directory ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: String,
    pub name: String,
}

// --- HTTP payloads ---

/// Body of `POST /api/messages`. The sender is the signed caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl CreateMessageRequest {
    pub fn new(target: &ChatTarget, content: impl Into<String>, client_id: Option<String>) -> Self {
        let (receiver_id, group_id) = match target {
            ChatTarget::User(id) => (Some(id.clone()), None),
            ChatTarget::Group(id) => (None, Some(id.clone())),
        };
        Self {
            content: content.into(),
            receiver_id,
            group_id,
            client_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub chat_id: ChatTarget,
    pub items: Vec<PersistedMessage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResponse {
    pub updated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_target_string_form() {
        let target: ChatTarget = "group:g1".parse().unwrap();
        assert_eq!(target, ChatTarget::group("g1"));
        assert_eq!(ChatTarget::user("u2").to_string(), "user:u2");
        assert!("channel:x".parse::<ChatTarget>().is_err());
        assert!("user:".parse::<ChatTarget>().is_err());
    }

    #[test]
    fn target_requires_exactly_one_address() {
        let mut msg = ChatMessage::new("u1", &ChatTarget::user("u2"), "hi");
        assert_eq!(msg.target().unwrap(), ChatTarget::user("u2"));

        msg.group_id = Some("g1".to_string());
        assert_eq!(msg.target(), Err(ChatError::Malformed));

        msg.receiver_id = None;
        msg.group_id = None;
        assert_eq!(msg.target(), Err(ChatError::Malformed));
    }

    #[test]
    fn chat_for_is_the_other_party() {
        let msg = ChatMessage::new("u1", &ChatTarget::user("u2"), "hi");
        assert_eq!(msg.chat_for("u1").unwrap(), ChatTarget::user("u2"));
        assert_eq!(msg.chat_for("u2").unwrap(), ChatTarget::user("u1"));

        let group = ChatMessage::new("u1", &ChatTarget::group("g1"), "hey");
        assert_eq!(group.chat_for("u3").unwrap(), ChatTarget::group("g1"));
    }

    #[test]
    fn persisted_message_flattens_chat_message() {
        let persisted = PersistedMessage {
            id: "m1".to_string(),
            message: ChatMessage::new("u1", &ChatTarget::user("u2"), "hi"),
            sender_name: Some("Alice".to_string()),
            sender_avatar: None,
            read_status: false,
            is_deleted: false,
        };

        let json = serde_json::to_value(&persisted).unwrap();
        assert_eq!(json["content"], "hi");
        assert_eq!(json["receiverId"], "u2");
        assert!(json.get("groupId").is_none());
        assert!(persisted.is_private());
    }
}
