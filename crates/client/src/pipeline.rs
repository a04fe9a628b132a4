//! Optimistic send pipeline.
//!
//! A message shows up locally before anything touches the network. Live
//! delivery over the websocket and durable persistence over HTTP run
//! independently; only a persistence failure puts the message in the retry
//! queue.

use std::sync::Arc;

use chrono::Utc;
use murmur_shared::{ChatTarget, ClientCommand, CreateMessageRequest};
use tokio::task::JoinHandle;

use crate::api_client::MessageApi;
use crate::conversations::ConversationStore;
use crate::retry_queue::{PendingOutboundMessage, RetryQueue};
use crate::ws::CommandSink;

/// Returned by [`SendPipeline::send`].
pub struct SendReceipt {
    pub local_id: String,
    /// Completes once the persistence attempt succeeded or the message was
    /// queued.
    pub persist: JoinHandle<()>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SendPipeline {
    conversations: Arc<ConversationStore>,
    queue: Arc<RetryQueue>,
    api: Arc<dyn MessageApi>,
    sink: Arc<dyn CommandSink>,
}

impl SendPipeline {
    pub fn new(
        conversations: Arc<ConversationStore>,
        queue: Arc<RetryQueue>,
        api: Arc<dyn MessageApi>,
        sink: Arc<dyn CommandSink>,
    ) -> Self {
        Self {
            conversations,
            queue,
            api,
            sink,
        }
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn send(&self, content: &str, target: &ChatTarget) -> SendReceipt {
        let entry = self.conversations.append_local(target, content);
        let local_id = entry.local_id.clone().unwrap_or_default();

        if self.sink.is_connected() {
            let command = ClientCommand::SendMessage {
                content: content.to_string(),
                receiver_id: entry.message.receiver_id.clone(),
                group_id: entry.message.group_id.clone(),
                sender_id: Some(self.conversations.user_id().to_string()),
                local_id: Some(local_id.clone()),
            };
            if let Err(e) = self.sink.send(command) {
                tracing::debug!(local_id = %local_id, "Live delivery skipped: {}", e);
            }
        }

        let pending = PendingOutboundMessage {
            local_id: local_id.clone(),
            chat_id: target.clone(),
            payload: CreateMessageRequest::new(target, content, Some(local_id.clone())),
            enqueued_at: Utc::now(),
        };
        let pipeline = self.clone();
        let persist = tokio::spawn(async move { pipeline.persist(pending).await });

        SendReceipt { local_id, persist }
    }

    async fn persist(&self, pending: PendingOutboundMessage) {
        match self.api.create_message(&pending.payload).await {
            Ok(persisted) => {
                self.conversations.reconcile_ack(&pending.local_id, &persisted);
                tracing::debug!(local_id = %pending.local_id, message_id = %persisted.id, "Message persisted");
            }
            Err(e) => {
                tracing::warn!(local_id = %pending.local_id, "Persistence failed, queueing for retry: {}", e);
                self.queue.enqueue(pending).await;
            }
        }
    }

    /// Try every queued message once. Each success removes exactly its own
    /// entry; failures stay queued for the next sweep.
    pub async fn retry_pending(&self) -> RetryReport {
        let mut report = RetryReport::default();
        for pending in self.queue.snapshot().await {
            match self.api.create_message(&pending.payload).await {
                Ok(persisted) => {
                    self.queue.remove(&pending.local_id).await;
                    self.conversations.reconcile_ack(&pending.local_id, &persisted);
                    report.succeeded += 1;
                }
                Err(e) => {
                    tracing::debug!(local_id = %pending.local_id, "Retry failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        if report.succeeded + report.failed > 0 {
            tracing::info!(succeeded = report.succeeded, failed = report.failed, "Retry sweep finished");
        }
        report
    }
}
