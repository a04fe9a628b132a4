mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::ScriptedApi;
use murmur_client::ws::{ConnectionEvent, ConnectionState, ReconnectConfig, UrlBuilder, WsConnection};
use murmur_client::{ChatClient, ClientConfig, DeliveryStatus, KeyValueStore, MemoryKvStore};
use murmur_shared::{ChatError, ChatTarget};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

fn offline_client(api: Arc<ScriptedApi>, store: Arc<dyn KeyValueStore>) -> ChatClient {
    ChatClient::with_api(ClientConfig::default(), "u1", None, store, api)
}

#[tokio::test]
async fn start_without_credential_refuses_but_sending_still_works() {
    let api = Arc::new(ScriptedApi::new("u1"));
    api.set_online(false);
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
    let client = offline_client(api.clone(), store.clone());

    assert_eq!(client.start().await, Err(ChatError::Unauthenticated));
    assert!(client.is_offline());
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    let chat = ChatTarget::user("u2");
    client.send("while offline", &chat).persist.await.unwrap();
    assert_eq!(client.conversation(&chat).unwrap().ordered_messages.len(), 1);
    assert_eq!(client.retry_queue().len().await, 1);

    // A fresh client over the same storage picks the entry up again.
    drop(client);
    api.set_online(true);
    let restarted = offline_client(api.clone(), store);
    assert_eq!(restarted.retry_queue().len().await, 1);
    restarted.retry_pending().await;
    assert!(restarted.retry_queue().is_empty().await);
    assert_eq!(api.stored_count(), 1);
}

#[tokio::test]
async fn history_merges_once() {
    let api = Arc::new(ScriptedApi::new("u1"));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
    let client = offline_client(api.clone(), store);
    let chat = ChatTarget::group("g1");

    client.send("first", &chat).persist.await.unwrap();
    client.send("second", &chat).persist.await.unwrap();

    // Both are already known locally under their persisted ids.
    assert_eq!(client.load_history(&chat, 50, 0).await.unwrap(), 0);
    let state = client.conversation(&chat).unwrap();
    assert!(state.history_loaded);
    assert_eq!(state.ordered_messages.len(), 2);
    assert!(state.ordered_messages.iter().all(|m| m.status == DeliveryStatus::Sent));
}

#[tokio::test]
async fn connection_refuses_without_credential() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let url_builder: UrlBuilder = Arc::new(|| None);
    let result = WsConnection::spawn(ReconnectConfig::default(), url_builder, tx);
    assert!(matches!(result, Err(ChatError::Unauthenticated)));
}

/// Accepts connections and drops them straight away, counting how many arrived.
async fn dropping_listener() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/api/ws", listener.local_addr().unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });
    (url, accepted)
}

/// Answers every handshake with `401 Unauthorized`.
async fn refusing_listener() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/api/ws", listener.local_addr().unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
                .await;
            let _ = socket.shutdown().await;
        }
    });
    (url, accepted)
}

#[tokio::test]
async fn disconnect_cancels_the_pending_reconnect() {
    let (url, accepted) = dropping_listener().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let url_builder: UrlBuilder = Arc::new(move || Some(url.clone()));
    let config = ReconnectConfig {
        base_delay_ms: 3_600_000,
        max_attempts: 3,
    };
    let connection = WsConnection::spawn(config, url_builder, tx).unwrap();

    // The first handshake fails and an hour-long backoff starts.
    let mut scheduled = None;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        if let ConnectionEvent::ReconnectScheduled { attempt, delay } = event {
            scheduled = Some((attempt, delay));
            break;
        }
    }
    assert_eq!(scheduled, Some((1, Duration::from_secs(3600))));

    tokio::time::timeout(Duration::from_secs(5), connection.disconnect())
        .await
        .expect("disconnect should not wait for the backoff timer");

    let mut last = None;
    while let Some(event) = rx.recv().await {
        if let ConnectionEvent::StateChanged(state) = event {
            last = Some(state);
        }
    }
    assert_eq!(last, Some(ConnectionState::Disconnected));
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_handshake_stops_without_retrying() {
    let (url, accepted) = refusing_listener().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let url_builder: UrlBuilder = Arc::new(move || Some(url.clone()));
    let config = ReconnectConfig {
        base_delay_ms: 10,
        max_attempts: 4,
    };
    let connection = WsConnection::spawn(config, url_builder, tx).unwrap();

    // The driver gives up on its own, which closes the event channel.
    let mut states = Vec::new();
    let mut scheduled = 0;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ConnectionEvent::StateChanged(state))) => states.push(state),
            Ok(Some(ConnectionEvent::ReconnectScheduled { .. })) => scheduled += 1,
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => panic!("driver kept running after a 401"),
        }
    }

    assert!(states.last().is_some_and(ConnectionState::is_errored));
    assert!(connection.state().is_errored());
    assert_eq!(scheduled, 0);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}
