//! Reconnection state machine.
//!
//! Pure bookkeeping: the socket driver reports what happened and the
//! controller decides the next state and whether (and when) to retry.

use std::time::Duration;

use murmur_shared::ChatError;

use super::connection::{ConnectionState, ReconnectConfig};

#[derive(Debug, Clone)]
pub struct ReconnectController {
    config: ReconnectConfig,
    state: ConnectionState,
    attempt: u32,
    connected_once: bool,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            attempt: 0,
            connected_once: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start a connection attempt. Without a credential the controller stays
    /// disconnected.
    pub fn request_connect(&mut self, has_credential: bool) -> Result<(), ChatError> {
        if !has_credential {
            self.state = ConnectionState::Disconnected;
            return Err(ChatError::Unauthenticated);
        }
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// The socket is open. Returns `true` when this is a reconnect rather
    /// than the first connection.
    pub fn on_connected(&mut self) -> bool {
        self.state = ConnectionState::Connected;
        self.attempt = 0;
        std::mem::replace(&mut self.connected_once, true)
    }

    /// The socket closed or a connect attempt failed. Returns the delay
    /// before the next attempt, or `None` once the attempt cap is exceeded
    /// and the controller is `Errored`.
    pub fn on_connection_lost(&mut self, reason: &str) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        match self.config.delay_for_attempt(self.attempt) {
            Some(delay) => {
                self.state = ConnectionState::Connecting;
                Some(delay)
            }
            None => {
                self.state = ConnectionState::Errored {
                    reason: format!("gave up after {} attempts: {}", self.config.max_attempts, reason),
                };
                None
            }
        }
    }

    /// The server refused the credential during the handshake. Retrying with
    /// the same key cannot succeed, so the controller stops at once.
    pub fn on_rejected(&mut self, reason: &str) {
        self.attempt = self.attempt.saturating_add(1);
        self.state = ConnectionState::Errored {
            reason: format!("rejected by server: {}", reason),
        };
    }

    /// Explicit disconnect. Resets the backoff.
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempt = 0;
    }
}
