mod common;

use std::sync::Arc;

use common::{RecordingSink, ScriptedApi};
use murmur_client::{
    ConversationStore, DeliveryStatus, KeyValueStore, MemoryKvStore, RetryQueue, RetryReport, SendPipeline,
};
use murmur_shared::{ChatTarget, ClientCommand};

struct Harness {
    api: Arc<ScriptedApi>,
    sink: Arc<RecordingSink>,
    conversations: Arc<ConversationStore>,
    store: Arc<dyn KeyValueStore>,
    pipeline: SendPipeline,
}

fn harness(sink: RecordingSink) -> Harness {
    let api = Arc::new(ScriptedApi::new("u1"));
    let sink = Arc::new(sink);
    let conversations = Arc::new(ConversationStore::new("u1"));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
    let queue = Arc::new(RetryQueue::load(store.clone(), "pending_outbound:u1"));
    let pipeline = SendPipeline::new(conversations.clone(), queue, api.clone(), sink.clone());
    Harness {
        api,
        sink,
        conversations,
        store,
        pipeline,
    }
}

#[tokio::test]
async fn message_is_visible_before_persistence_completes() {
    let h = harness(RecordingSink::connected());
    let chat = ChatTarget::user("u2");

    let receipt = h.pipeline.send("hi", &chat);
    let state = h.conversations.snapshot(&chat).unwrap();
    assert_eq!(state.ordered_messages.len(), 1);
    assert_eq!(state.ordered_messages[0].local_id.as_deref(), Some(receipt.local_id.as_str()));

    receipt.persist.await.unwrap();
    let state = h.conversations.snapshot(&chat).unwrap();
    assert_eq!(state.ordered_messages[0].status, DeliveryStatus::Sent);
    assert_eq!(state.ordered_messages[0].server_id.as_deref(), Some("m1"));
    assert!(h.pipeline.queue().is_empty().await);

    let sent = h.sink.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        ClientCommand::SendMessage {
            content,
            receiver_id,
            local_id,
            ..
        } => {
            assert_eq!(content, "hi");
            assert_eq!(receiver_id.as_deref(), Some("u2"));
            assert_eq!(local_id.as_deref(), Some(receipt.local_id.as_str()));
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[tokio::test]
async fn offline_send_is_kept_locally_and_queued_until_retry() {
    let h = harness(RecordingSink::default());
    h.api.set_online(false);
    let chat = ChatTarget::group("g1");

    let receipt = h.pipeline.send("hello group", &chat);
    receipt.persist.await.unwrap();

    assert!(h.sink.sent.lock().unwrap().is_empty());
    let state = h.conversations.snapshot(&chat).unwrap();
    assert_eq!(state.ordered_messages.len(), 1);
    assert_eq!(state.ordered_messages[0].status, DeliveryStatus::Pending);
    assert_eq!(h.pipeline.queue().len().await, 1);

    // Still offline: the entry stays.
    assert_eq!(h.pipeline.retry_pending().await, RetryReport { succeeded: 0, failed: 1 });
    assert_eq!(h.pipeline.queue().len().await, 1);

    h.api.set_online(true);
    assert_eq!(h.pipeline.retry_pending().await, RetryReport { succeeded: 1, failed: 0 });
    assert!(h.pipeline.queue().is_empty().await);
    assert_eq!(h.api.stored_count(), 1);

    let state = h.conversations.snapshot(&chat).unwrap();
    assert_eq!(state.ordered_messages.len(), 1);
    assert_eq!(state.ordered_messages[0].status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn successful_retry_removes_only_its_own_entry() {
    let h = harness(RecordingSink::default());
    h.api.set_online(false);
    let chat = ChatTarget::user("u2");

    let first = h.pipeline.send("one", &chat);
    let second = h.pipeline.send("two", &chat);
    let first_id = first.local_id.clone();
    let second_id = second.local_id.clone();
    first.persist.await.unwrap();
    second.persist.await.unwrap();
    assert_eq!(h.pipeline.queue().len().await, 2);

    h.api.set_online(true);
    h.api.reject(&second_id);
    assert_eq!(h.pipeline.retry_pending().await, RetryReport { succeeded: 1, failed: 1 });

    let left: Vec<String> = h.pipeline.queue().snapshot().await.into_iter().map(|e| e.local_id).collect();
    assert_eq!(left, vec![second_id]);
    assert_ne!(left[0], first_id);

    // The queue on disk agrees with memory.
    let reloaded = RetryQueue::load(h.store.clone(), "pending_outbound:u1");
    assert_eq!(reloaded.len().await, 1);
}

#[tokio::test]
async fn replayed_persistence_does_not_duplicate() {
    let h = harness(RecordingSink::default());
    let chat = ChatTarget::user("u2");

    let receipt = h.pipeline.send("once", &chat);
    let local_id = receipt.local_id.clone();
    receipt.persist.await.unwrap();

    // A stale queue entry for an already persisted message.
    let snapshot = h.conversations.snapshot(&chat).unwrap();
    let payload = murmur_shared::CreateMessageRequest::new(&chat, "once", Some(local_id.clone()));
    h.pipeline
        .queue()
        .enqueue(murmur_client::PendingOutboundMessage {
            local_id,
            chat_id: chat.clone(),
            payload,
            enqueued_at: chrono::Utc::now(),
        })
        .await;
    h.pipeline.retry_pending().await;

    assert_eq!(h.api.stored_count(), 1);
    assert_eq!(h.conversations.snapshot(&chat).unwrap(), snapshot);
}
