//! Database initialization, schema setup and the Aurora-backed store.

use aurora_db::{Aurora, Document, FieldType};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use murmur_shared::{ChatMessage, ChatTarget, GroupSummary, PersistedMessage, UserProfile};

use crate::services::{FriendDirectory, GroupDirectory, KeyDirectory, MessageStore, StoreError, UserDirectory};

/// Open the Aurora database at `db_path` and create all collections.
pub fn init_database(db_path: &str) -> anyhow::Result<Aurora> {
    let db = Aurora::open(db_path)?;

    // Collections already present on disk are left untouched.
    let _ = db.new_collection(
        "users",
        vec![
            ("handle", FieldType::String, true),
            ("display_name", FieldType::String, false),
            ("avatar", FieldType::String, false),
            ("created_at", FieldType::String, false),
        ],
    );

    let _ = db.new_collection(
        "groups",
        vec![
            ("id", FieldType::String, true),
            ("name", FieldType::String, false),
            ("created_at", FieldType::String, false),
        ],
    );

    let _ = db.new_collection(
        "group_members",
        vec![
            ("group_id", FieldType::String, false),
            ("user_id", FieldType::String, false),
            ("created_at", FieldType::String, false),
        ],
    );

    // One row per direction.
    let _ = db.new_collection(
        "friendships",
        vec![
            ("user_id", FieldType::String, false),
            ("friend_id", FieldType::String, false),
            ("created_at", FieldType::String, false),
        ],
    );

    let _ = db.new_collection(
        "device_keys",
        vec![
            ("key_id", FieldType::String, true),
            ("user_handle", FieldType::String, false),
            ("public_key", FieldType::String, false),
            ("created_at", FieldType::String, false),
            ("revoked", FieldType::String, false),
        ],
    );

    let _ = db.new_collection(
        "messages",
        vec![
            ("id", FieldType::String, true),
            ("sender_id", FieldType::String, false),
            ("receiver_id", FieldType::String, false),
            ("group_id", FieldType::String, false),
            ("content", FieldType::String, false),
            ("client_id", FieldType::String, false),
            ("sender_name", FieldType::String, false),
            ("sender_avatar", FieldType::String, false),
            ("read_status", FieldType::String, false),
            ("is_deleted", FieldType::String, false),
            ("sent_at", FieldType::String, false),
        ],
    );

    tracing::info!(path = %db_path, "Database opened");
    Ok(db)
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

fn field<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    doc.data.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn flag(doc: &Document, key: &str) -> bool {
    field(doc, key) == Some("true")
}

/// Fixed-width timestamps so lexical order matches time order.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn message_from_doc(doc: &Document) -> PersistedMessage {
    let sent_at = field(doc, "sent_at")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    PersistedMessage {
        id: field(doc, "id").unwrap_or_default().to_string(),
        message: ChatMessage {
            content: doc
                .data
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            sender_id: field(doc, "sender_id").unwrap_or_default().to_string(),
            receiver_id: field(doc, "receiver_id").map(str::to_string),
            group_id: field(doc, "group_id").map(str::to_string),
            sent_at,
            client_id: field(doc, "client_id").map(str::to_string),
        },
        sender_name: field(doc, "sender_name").map(str::to_string),
        sender_avatar: field(doc, "sender_avatar").map(str::to_string),
        read_status: flag(doc, "read_status"),
        is_deleted: flag(doc, "is_deleted"),
    }
}

fn in_conversation(doc: &Document, viewer: &str, chat: &ChatTarget) -> bool {
    match chat {
        ChatTarget::Group(group) => field(doc, "group_id") == Some(group.as_str()),
        ChatTarget::User(peer) => {
            let sender = field(doc, "sender_id");
            let receiver = field(doc, "receiver_id");
            (sender == Some(viewer) && receiver == Some(peer.as_str()))
                || (sender == Some(peer.as_str()) && receiver == Some(viewer))
        }
    }
}

/// Store backed by an Aurora database.
pub struct AuroraStore {
    db: Aurora,
}

impl AuroraStore {
    pub fn new(db: Aurora) -> Self {
        Self { db }
    }

    /// Every live document of `chat` visible to `viewer`, oldest first.
    async fn conversation_docs(&self, viewer: &str, chat: &ChatTarget) -> Result<Vec<Document>, StoreError> {
        let docs = match chat {
            ChatTarget::Group(group) => {
                let group = group.clone();
                self.db
                    .query("messages")
                    .filter(|f| f.eq("group_id", group.clone()))
                    .collect()
                    .await
                    .map_err(db_err)?
            }
            ChatTarget::User(_) => {
                let viewer = viewer.to_string();
                let mut docs = self
                    .db
                    .query("messages")
                    .filter(|f| f.eq("sender_id", viewer.clone()))
                    .collect()
                    .await
                    .map_err(db_err)?;
                docs.extend(
                    self.db
                        .query("messages")
                        .filter(|f| f.eq("receiver_id", viewer.clone()))
                        .collect()
                        .await
                        .map_err(db_err)?,
                );
                docs
            }
        };

        let mut docs: Vec<Document> = docs
            .into_iter()
            .filter(|doc| !flag(doc, "is_deleted") && in_conversation(doc, viewer, chat))
            .collect();
        // Self-addressed messages match both queries.
        docs.sort_by(|a, b| {
            let a_key = (field(a, "sent_at").unwrap_or(""), field(a, "id").unwrap_or(""));
            let b_key = (field(b, "sent_at").unwrap_or(""), field(b, "id").unwrap_or(""));
            a_key.cmp(&b_key)
        });
        docs.dedup_by(|a, b| a.id == b.id);
        Ok(docs)
    }

    async fn find_by_client_id(&self, sender_id: &str, client_id: &str) -> Result<Option<Document>, StoreError> {
        let docs = self
            .db
            .query("messages")
            .filter(|f| f.eq("sender_id", sender_id.to_string()) & f.eq("client_id", client_id.to_string()))
            .collect()
            .await
            .map_err(db_err)?;
        Ok(docs.into_iter().next())
    }

    async fn set_read(&self, doc: &Document) -> Result<(), StoreError> {
        self.db
            .update_document("messages", &doc.id, vec![("read_status", "true".into())])
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for AuroraStore {
    async fn create(
        &self,
        message: &ChatMessage,
        sender: Option<&UserProfile>,
    ) -> Result<PersistedMessage, StoreError> {
        if let Some(client_id) = &message.client_id {
            if let Some(existing) = self.find_by_client_id(&message.sender_id, client_id).await? {
                tracing::debug!(client_id = %client_id, "Duplicate send, returning stored message");
                return Ok(message_from_doc(&existing));
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

        let fields = vec![
            ("id", persisted.id.clone().into()),
            ("sender_id", message.sender_id.clone().into()),
            ("receiver_id", message.receiver_id.clone().unwrap_or_default().into()),
            ("group_id", message.group_id.clone().unwrap_or_default().into()),
            ("content", message.content.clone().into()),
            ("client_id", message.client_id.clone().unwrap_or_default().into()),
            ("sender_name", persisted.sender_name.clone().unwrap_or_default().into()),
            ("sender_avatar", persisted.sender_avatar.clone().unwrap_or_default().into()),
            ("read_status", "false".into()),
            ("is_deleted", "false".into()),
            ("sent_at", timestamp(&message.sent_at).into()),
        ];

        self.db.insert_into("messages", fields).await.map_err(db_err)?;
        Ok(persisted)
    }

    async fn query_by_conversation(
        &self,
        viewer: &str,
        chat: &ChatTarget,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<PersistedMessage>, StoreError> {
        let docs = self.conversation_docs(viewer, chat).await?;
        let end = docs.len().saturating_sub(skip);
        let start = end.saturating_sub(limit);
        Ok(docs[start..end].iter().map(message_from_doc).collect())
    }

    async fn mark_read(&self, viewer: &str, message_id: &str) -> Result<bool, StoreError> {
        let docs = self
            .db
            .query("messages")
            .filter(|f| f.eq("id", message_id.to_string()))
            .collect()
            .await
            .map_err(db_err)?;

        let Some(doc) = docs.into_iter().next() else {
            return Ok(false);
        };
        if field(&doc, "sender_id") == Some(viewer) || flag(&doc, "read_status") {
            return Ok(false);
        }
        let received = match field(&doc, "group_id") {
            Some(group) => GroupDirectory::is_member(self, viewer, group).await?,
            None => field(&doc, "receiver_id") == Some(viewer),
        };
        if !received {
            return Ok(false);
        }
        self.set_read(&doc).await?;
        Ok(true)
    }

    async fn mark_conversation_read(&self, viewer: &str, chat: &ChatTarget) -> Result<u64, StoreError> {
        let mut updated = 0;
        for doc in self.conversation_docs(viewer, chat).await? {
            if flag(&doc, "read_status") || field(&doc, "sender_id") == Some(viewer) {
                continue;
            }
            self.set_read(&doc).await?;
            updated += 1;
        }
        Ok(updated)
    }

    async fn unread_count(&self, viewer: &str, chat: &ChatTarget) -> Result<u64, StoreError> {
        let docs = self.conversation_docs(viewer, chat).await?;
        let count = docs
            .iter()
            .filter(|doc| !flag(doc, "read_status") && field(doc, "sender_id") != Some(viewer))
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl GroupDirectory for AuroraStore {
    async fn groups_of(&self, user_id: &str) -> Result<Vec<GroupSummary>, StoreError> {
        let memberships = self
            .db
            .query("group_members")
            .filter(|f| f.eq("user_id", user_id.to_string()))
            .collect()
            .await
            .map_err(db_err)?;

        let mut groups = Vec::new();
        for membership in memberships {
            let Some(group_id) = field(&membership, "group_id") else {
                continue;
            };
            let group_id = group_id.to_string();
            let docs = self
                .db
                .query("groups")
                .filter(|f| f.eq("id", group_id.clone()))
                .collect()
                .await
                .map_err(db_err)?;
            if let Some(doc) = docs.into_iter().next() {
                groups.push(GroupSummary {
                    id: group_id,
                    name: field(&doc, "name").unwrap_or_default().to_string(),
                });
            }
        }
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    async fn group_exists(&self, group_id: &str) -> Result<bool, StoreError> {
        let docs = self
            .db
            .query("groups")
            .filter(|f| f.eq("id", group_id.to_string()))
            .collect()
            .await
            .map_err(db_err)?;
        Ok(!docs.is_empty())
    }

    async fn is_member(&self, user_id: &str, group_id: &str) -> Result<bool, StoreError> {
        let docs = self
            .db
            .query("group_members")
            .filter(|f| f.eq("group_id", group_id.to_string()) & f.eq("user_id", user_id.to_string()))
            .collect()
            .await
            .map_err(db_err)?;
        Ok(!docs.is_empty())
    }
}

#[async_trait]
impl FriendDirectory for AuroraStore {
    async fn friends_of(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let docs = self
            .db
            .query("friendships")
            .filter(|f| f.eq("user_id", user_id.to_string()))
            .collect()
            .await
            .map_err(db_err)?;
        let mut friends: Vec<String> = docs
            .iter()
            .filter_map(|doc| field(doc, "friend_id").map(str::to_string))
            .collect();
        friends.sort();
        friends.dedup();
        Ok(friends)
    }
}

#[async_trait]
impl UserDirectory for AuroraStore {
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let docs = self
            .db
            .query("users")
            .filter(|f| f.eq("handle", user_id.to_string()))
            .collect()
            .await
            .map_err(db_err)?;
        Ok(docs.into_iter().next().map(|doc| UserProfile {
            id: user_id.to_string(),
            display_name: field(&doc, "display_name").map(str::to_string),
            avatar: field(&doc, "avatar").map(str::to_string),
        }))
    }
}

#[async_trait]
impl KeyDirectory for AuroraStore {
    async fn public_key(&self, handle: &str, key_id: &str) -> Result<Option<String>, StoreError> {
        let keys = self
            .db
            .query("device_keys")
            .filter(|f| {
                f.eq("key_id", key_id.to_string())
                    & f.eq("user_handle", handle.to_string())
                    & f.eq("revoked", "false")
            })
            .collect()
            .await
            .map_err(db_err)?;
        Ok(keys
            .into_iter()
            .next()
            .and_then(|doc| field(&doc, "public_key").map(str::to_string)))
    }
}
