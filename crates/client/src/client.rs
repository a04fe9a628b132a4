//! The chat client facade.
//!
//! Owns the local stores, the send pipeline and the websocket connection, and
//! applies incoming events to the stores before handing them to subscribers.

use std::sync::{Arc, PoisonError, RwLock};

use murmur_shared::{ApiError, ChatError, ChatTarget, ClientCommand, GroupSummary, ServerEvent, WsEnvelope, WS_PATH};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::api_client::{ApiClient, MessageApi};
use crate::client_keys::{sign_ws_request, KeyPair};
use crate::config::ClientConfig;
use crate::conversations::{ConversationState, ConversationStore};
use crate::events::EventBus;
use crate::pipeline::{RetryReport, SendPipeline, SendReceipt};
use crate::presence::PresenceStore;
use crate::retry_queue::RetryQueue;
use crate::storage::KeyValueStore;
use crate::unread::ReadReceipts;
use crate::ws::{CommandSink, ConnectionEvent, ConnectionState, UrlBuilder, WsConnection, WsHandle};

/// Command sink that follows whichever connection is current.
#[derive(Default)]
struct LiveLink {
    handle: RwLock<Option<WsHandle>>,
}

impl LiveLink {
    fn set(&self, handle: Option<WsHandle>) {
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = handle;
    }

    fn state(&self) -> ConnectionState {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(ConnectionState::Disconnected, WsHandle::state)
    }
}

impl CommandSink for LiveLink {
    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    fn send(&self, command: ClientCommand) -> Result<(), ChatError> {
        match self.handle.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(handle) => handle.send(command),
            None => Err(ChatError::Transport("not connected".to_string())),
        }
    }
}

/// Everything the dispatcher task needs to apply events.
#[derive(Clone)]
struct Stores {
    conversations: Arc<ConversationStore>,
    presence: Arc<PresenceStore>,
    groups: Arc<RwLock<Vec<GroupSummary>>>,
    events: Arc<EventBus>,
}

impl Stores {
    fn apply(&self, envelope: &WsEnvelope<ServerEvent>) {
        match &envelope.payload {
            ServerEvent::ReceiveMessage { message, .. } => {
                self.conversations.merge_remote(message);
            }
            ServerEvent::MessageSent { message, local_id } => {
                let reconciled = local_id
                    .as_deref()
                    .is_some_and(|local_id| self.conversations.reconcile_ack(local_id, message));
                if !reconciled {
                    self.conversations.merge_remote(message);
                }
            }
            ServerEvent::UserStatus { .. } | ServerEvent::FriendStatus { .. } => {
                self.presence.apply(&envelope.payload);
            }
            ServerEvent::GroupsReloaded { groups } => {
                tracing::debug!(count = groups.len(), "Group list reloaded");
                *self.groups.write().unwrap_or_else(PoisonError::into_inner) = groups.clone();
            }
            ServerEvent::Error { code, message } => {
                tracing::warn!(code = %code, "Server rejected a command: {}", message);
            }
        }
        self.events.emit(envelope);
    }
}

pub struct ChatClient {
    config: ClientConfig,
    user_id: String,
    keys: Option<KeyPair>,
    stores: Stores,
    pipeline: SendPipeline,
    receipts: ReadReceipts,
    api: Arc<dyn MessageApi>,
    link: Arc<LiveLink>,
    connection: Mutex<Option<(WsConnection, JoinHandle<()>)>>,
}

impl ChatClient {
    /// Client talking to `config.server_url`, signing requests as `user_id`.
    pub fn new(config: ClientConfig, user_id: impl Into<String>, keys: Option<KeyPair>, store: Arc<dyn KeyValueStore>) -> Self {
        let user_id = user_id.into();
        let api = ApiClient::new()
            .with_base_url(config.server_url.clone())
            .with_signing(keys.clone(), Some(user_id.clone()));
        Self::with_api(config, user_id, keys, store, Arc::new(api))
    }

    pub fn with_api(
        config: ClientConfig,
        user_id: impl Into<String>,
        keys: Option<KeyPair>,
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn MessageApi>,
    ) -> Self {
        let user_id = user_id.into();
        let conversations = Arc::new(ConversationStore::new(user_id.clone()));
        let queue = Arc::new(RetryQueue::load(store, format!("pending_outbound:{}", user_id)));
        let link = Arc::new(LiveLink::default());

        let pipeline = SendPipeline::new(conversations.clone(), queue, api.clone(), link.clone());
        let receipts = ReadReceipts::new(conversations.clone(), api.clone());

        Self {
            config,
            user_id,
            keys,
            stores: Stores {
                conversations,
                presence: Arc::new(PresenceStore::new()),
                groups: Arc::new(RwLock::new(Vec::new())),
                events: Arc::new(EventBus::new()),
            },
            pipeline,
            receipts,
            api,
            link,
            connection: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Retry anything left in the queue from a previous run, then connect.
    pub async fn start(&self) -> Result<(), ChatError> {
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move { pipeline.retry_pending().await });
        self.connect().await
    }

    /// Open the websocket. Fails with `Unauthenticated` when no key pair is
    /// configured. A live connection is left alone; one that gave up after
    /// exhausting its reconnect attempts is replaced.
    pub async fn connect(&self) -> Result<(), ChatError> {
        let mut connection = self.connection.lock().await;
        if let Some((ws, _)) = connection.as_ref() {
            if !ws.state().is_errored() {
                return Ok(());
            }
        }
        if let Some((ws, dispatcher)) = connection.take() {
            ws.disconnect().await;
            let _ = dispatcher.await;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ws = WsConnection::spawn(self.config.reconnect.clone(), self.url_builder(), events_tx)?;
        self.link.set(Some(ws.handle()));

        let dispatcher = tokio::spawn(dispatch(events_rx, self.stores.clone(), self.pipeline.clone()));
        *connection = Some((ws, dispatcher));
        Ok(())
    }

    fn url_builder(&self) -> UrlBuilder {
        let keys = self.keys.clone();
        let actor = self.user_id.clone();
        let config = self.config.clone();
        Arc::new(move || {
            let keys = keys.as_ref()?;
            let credential = sign_ws_request(WS_PATH, keys, &actor)?;
            match config.ws_url(&credential) {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::error!("Invalid server url: {}", e);
                    None
                }
            }
        })
    }

    /// Close the websocket and cancel any pending reconnect. Sends already in
    /// flight over HTTP are not affected.
    pub async fn disconnect(&self) {
        let Some((ws, dispatcher)) = self.connection.lock().await.take() else {
            return;
        };
        self.link.set(None);
        ws.disconnect().await;
        if let Err(e) = dispatcher.await {
            tracing::error!("Dispatcher ended abnormally: {}", e);
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Whether to show the offline banner. Sending still works while offline.
    pub fn is_offline(&self) -> bool {
        !self.connection_state().is_connected()
    }

    pub fn send(&self, content: &str, target: &ChatTarget) -> SendReceipt {
        self.pipeline.send(content, target)
    }

    pub async fn retry_pending(&self) -> RetryReport {
        self.pipeline.retry_pending().await
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        self.pipeline.queue()
    }

    pub fn mark_as_read(&self, chat: &ChatTarget) -> JoinHandle<()> {
        self.receipts.mark_as_read(chat)
    }

    /// Mark one received message read on the server.
    pub async fn mark_message_read(&self, message_id: &str) -> Result<bool, ApiError> {
        self.receipts.mark_message_read(message_id).await
    }

    pub async fn sync_unread_counts(&self, chats: &[ChatTarget]) -> usize {
        self.receipts.sync_unread_counts(chats).await
    }

    /// Fetch one page of history and merge it. Returns how many messages were
    /// new locally.
    pub async fn load_history(&self, chat: &ChatTarget, limit: usize, skip: usize) -> Result<usize, ApiError> {
        let page = self.api.history(chat, limit, skip).await?;
        Ok(self.stores.conversations.merge_history(&page))
    }

    pub fn events(&self) -> &EventBus {
        &self.stores.events
    }

    pub fn conversation(&self, chat: &ChatTarget) -> Option<ConversationState> {
        self.stores.conversations.snapshot(chat)
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.stores.conversations
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.stores.presence
    }

    pub fn groups(&self) -> Vec<GroupSummary> {
        self.stores.groups.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Applies connection events in arrival order. Ends when the connection task
/// drops its sender.
async fn dispatch(mut events: mpsc::UnboundedReceiver<ConnectionEvent>, stores: Stores, pipeline: SendPipeline) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Server(envelope) => stores.apply(&envelope),
            ConnectionEvent::Connected { reconnect } => {
                tracing::info!(reconnect, "Connected, retrying pending messages");
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.retry_pending().await });
            }
            ConnectionEvent::StateChanged(state) => {
                tracing::debug!(?state, "Connection state changed");
            }
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
            }
        }
    }
}
