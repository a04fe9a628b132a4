//! Connection state, backoff configuration and the command handle.

use std::time::Duration;

use futures_channel::mpsc::UnboundedSender;
use murmur_shared::{ChatError, ClientCommand, WsEnvelope};
use tokio::sync::watch;

/// Connection state for a WebSocket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal until the caller connects again explicitly.
    Errored { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, ConnectionState::Errored { .. })
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// `base * 2^(attempt-1)` for attempts `1..=max_attempts`, `None` outside
    /// that range.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        Some(Duration::from_millis(self.base_delay_ms.saturating_mul(factor)))
    }
}

/// Outbound side of the live channel.
pub trait CommandSink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Queue `command` for the socket. Fails when the channel is down.
    fn send(&self, command: ClientCommand) -> Result<(), ChatError>;
}

/// Handle for sending commands through a WebSocket connection
#[derive(Clone)]
pub struct WsHandle {
    sender: UnboundedSender<WsEnvelope<ClientCommand>>,
    state: watch::Receiver<ConnectionState>,
}

impl WsHandle {
    pub(crate) fn new(
        sender: UnboundedSender<WsEnvelope<ClientCommand>>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self { sender, state }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn enqueue(&self, envelope: WsEnvelope<ClientCommand>) -> Result<(), ChatError> {
        if !self.is_connected() {
            return Err(ChatError::Transport("not connected".to_string()));
        }
        self.sender
            .unbounded_send(envelope)
            .map_err(|e| ChatError::Transport(format!("Failed to send: {}", e)))
    }
}

impl CommandSink for WsHandle {
    fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    fn send(&self, command: ClientCommand) -> Result<(), ChatError> {
        tracing::debug!(?command, "Sending command");
        self.enqueue(WsEnvelope::new(command))
    }
}
