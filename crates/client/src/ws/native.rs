//! WebSocket driver using tokio-tungstenite.

use std::sync::Arc;
use std::time::Duration;

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use murmur_shared::{ChatError, ClientCommand, ServerEvent, WsEnvelope};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{http::StatusCode, Error as WsError, Message},
};

use super::connection::{ConnectionState, ReconnectConfig, WsHandle};
use super::controller::ReconnectController;

/// What the driver reports to its owner, in order.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Server(WsEnvelope<ServerEvent>),
    /// The socket opened and `reload_groups` was sent.
    Connected { reconnect: bool },
    StateChanged(ConnectionState),
    /// The socket is down and the next attempt starts after `delay`.
    ReconnectScheduled { attempt: u32, delay: Duration },
}

/// Builds a freshly signed websocket URL, or `None` without credentials.
pub type UrlBuilder = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// A managed WebSocket connection with automatic reconnect.
pub struct WsConnection {
    sender: UnboundedSender<WsEnvelope<ClientCommand>>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

impl WsConnection {
    /// Start connecting in a background task. Fails immediately, without
    /// spawning anything, when no credential is available.
    pub fn spawn(
        config: ReconnectConfig,
        url_builder: UrlBuilder,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self, ChatError> {
        let mut controller = ReconnectController::new(config);
        controller.request_connect(url_builder().is_some())?;

        let (sender, receiver) = unbounded();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(controller, url_builder, receiver, state_tx, events, shutdown_rx));

        Ok(Self {
            sender,
            state,
            shutdown,
            task,
        })
    }

    /// Get a handle for sending commands
    pub fn handle(&self) -> WsHandle {
        WsHandle::new(self.sender.clone(), self.state.clone())
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Close the socket and cancel any scheduled reconnect.
    pub async fn disconnect(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("WebSocket task ended abnormally: {}", e);
        }
    }
}

fn publish(
    controller: &ReconnectController,
    state_tx: &watch::Sender<ConnectionState>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    let state = controller.state().clone();
    if *state_tx.borrow() == state {
        return;
    }
    state_tx.send_replace(state.clone());
    let _ = events.send(ConnectionEvent::StateChanged(state));
}

async fn run(
    mut controller: ReconnectController,
    url_builder: UrlBuilder,
    mut commands: UnboundedReceiver<WsEnvelope<ClientCommand>>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let url = url_builder();
        let result = controller.request_connect(url.is_some());
        publish(&controller, &state_tx, &events);
        let (Ok(()), Some(url)) = (result, url) else {
            tracing::warn!("No credential available, not connecting");
            return;
        };

        let attempt = tokio::select! {
            _ = shutdown.changed() => break,
            result = connect_async(url.as_str()) => result,
        };

        let reason = match attempt {
            Ok((stream, _response)) => {
                let reconnect = controller.on_connected();
                publish(&controller, &state_tx, &events);
                tracing::info!(reconnect, "WebSocket connected");

                match run_session(stream, reconnect, &mut commands, &events, &mut shutdown).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(reason) => reason,
                }
            }
            Err(WsError::Http(response))
                if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
            {
                controller.on_rejected(&response.status().to_string());
                publish(&controller, &state_tx, &events);
                tracing::error!(status = %response.status(), "WebSocket handshake rejected, not reconnecting");
                return;
            }
            Err(e) => e.to_string(),
        };

        match controller.on_connection_lost(&reason) {
            Some(delay) => {
                publish(&controller, &state_tx, &events);
                tracing::info!(
                    attempt = controller.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "WebSocket lost ({}), reconnecting",
                    reason
                );
                let _ = events.send(ConnectionEvent::ReconnectScheduled {
                    attempt: controller.attempt(),
                    delay,
                });
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                tracing::error!("WebSocket reconnect attempts exhausted: {}", reason);
                publish(&controller, &state_tx, &events);
                return;
            }
        }
    }

    controller.disconnect();
    publish(&controller, &state_tx, &events);
    tracing::info!("WebSocket disconnected");
}

async fn run_session<S>(
    stream: S,
    reconnect: bool,
    commands: &mut UnboundedReceiver<WsEnvelope<ClientCommand>>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = stream.split();

    // Membership may have changed while we were away.
    let reload = WsEnvelope::new(ClientCommand::ReloadGroups);
    match serde_json::to_string(&reload) {
        Ok(json) => {
            if let Err(e) = write.send(Message::Text(json.into())).await {
                return SessionEnd::Lost(e.to_string());
            }
        }
        Err(e) => tracing::error!("Serialize failed: {}", e),
    }
    if events.send(ConnectionEvent::Connected { reconnect }).is_err() {
        // Nobody is listening any more.
        return SessionEnd::Shutdown;
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<WsEnvelope<ServerEvent>>(text.as_str()) {
                        Ok(event) => {
                            let _ = events.send(ConnectionEvent::Server(event));
                        }
                        Err(e) => tracing::error!("Failed to parse message: {}", e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost("closed by server".to_string()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
            },
            cmd = commands.next() => match cmd {
                Some(envelope) => match serde_json::to_string(&envelope) {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Err(e) => tracing::error!("Serialize failed: {}", e),
                },
                None => return SessionEnd::Shutdown,
            },
        }
    }
}
