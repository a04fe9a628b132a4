//! Durable queue of messages whose persistence failed.
//!
//! The whole queue is rewritten to the key-value store on every change while
//! the write lock is held, so appends and removals from a concurrent retry
//! sweep never overwrite each other.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use murmur_shared::{ChatTarget, CreateMessageRequest};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::storage::{self, KeyValueStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOutboundMessage {
    pub local_id: String,
    pub chat_id: ChatTarget,
    /// Exactly what the create call sends; `clientId` is the local id.
    pub payload: CreateMessageRequest,
    pub enqueued_at: DateTime<Utc>,
}

pub struct RetryQueue {
    store: Arc<dyn KeyValueStore>,
    key: String,
    entries: RwLock<Vec<PendingOutboundMessage>>,
}

impl RetryQueue {
    /// Open the queue stored under `key`, restoring any entries left from a
    /// previous run.
    pub fn load(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        let entries: Vec<PendingOutboundMessage> = storage::load(store.as_ref(), &key).unwrap_or_default();
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Restored pending outbound messages");
        }
        Self {
            store,
            key,
            entries: RwLock::new(entries),
        }
    }

    fn persist(&self, entries: &[PendingOutboundMessage]) {
        if !storage::save(self.store.as_ref(), &self.key, &entries) {
            tracing::error!(key = %self.key, "Failed to write retry queue");
        }
    }

    /// Add an entry. A second entry with the same local id replaces the
    /// first, so a message is queued at most once.
    pub async fn enqueue(&self, entry: PendingOutboundMessage) {
        let mut entries = self.entries.write().await;
        entries.retain(|e| e.local_id != entry.local_id);
        tracing::debug!(local_id = %entry.local_id, "Queued message for retry");
        entries.push(entry);
        self.persist(&entries);
    }

    /// Remove the entry for `local_id` after it was persisted. Returns whether
    /// one was removed.
    pub async fn remove(&self, local_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.local_id != local_id);
        let removed = entries.len() != before;
        if removed {
            self.persist(&entries);
        }
        removed
    }

    /// Drop an entry without persisting it.
    pub async fn clear(&self, local_id: &str) -> bool {
        let removed = self.remove(local_id).await;
        if removed {
            tracing::info!(local_id, "Pending message cleared");
        }
        removed
    }

    /// Copy of the current entries, oldest first.
    pub async fn snapshot(&self) -> Vec<PendingOutboundMessage> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;

    fn pending(local_id: &str) -> PendingOutboundMessage {
        let chat = ChatTarget::user("u2");
        PendingOutboundMessage {
            local_id: local_id.to_string(),
            payload: CreateMessageRequest::new(&chat, "hi", Some(local_id.to_string())),
            chat_id: chat,
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn survives_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let queue = RetryQueue::load(store.clone(), "pending:u1");
        queue.enqueue(pending("a")).await;
        queue.enqueue(pending("b")).await;
        drop(queue);

        let reopened = RetryQueue::load(store, "pending:u1");
        let ids: Vec<String> = reopened.snapshot().await.into_iter().map(|e| e.local_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_local_id() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let queue = RetryQueue::load(store, "pending:u1");
        queue.enqueue(pending("a")).await;
        queue.enqueue(pending("a")).await;
        assert_eq!(queue.len().await, 1);
        assert!(queue.clear("a").await);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_appends_during_sweep_are_kept() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let queue = Arc::new(RetryQueue::load(store.clone(), "pending:u1"));
        for i in 0..10 {
            queue.enqueue(pending(&format!("old-{}", i))).await;
        }

        let sweep = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for entry in queue.snapshot().await {
                    queue.remove(&entry.local_id).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        let append = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    queue.enqueue(pending(&format!("new-{}", i))).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        sweep.await.unwrap();
        append.await.unwrap();

        let left = RetryQueue::load(store, "pending:u1").snapshot().await;
        assert_eq!(left.len(), 10);
        assert!(left.iter().all(|e| e.local_id.starts_with("new-")));
    }
}
