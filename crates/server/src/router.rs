//! Message router.
//!
//! Each inbound send runs `Received → Validated → Persisted → Routed → Acked`
//! and may exit early as `Rejected`. Persistence is awaited before routing, so
//! recipients never see a message the store did not accept.

use std::fmt;
use std::sync::Arc;

use murmur_shared::{ChatError, ChatMessage, ChatTarget, PersistedMessage, Room, ServerEvent, WsEnvelope};

use crate::registry::{Connection, SessionRegistry};
use crate::services::Services;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStage {
    Received,
    Validated,
    Persisted,
    Routed,
    Acked,
}

impl fmt::Display for RouteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteStage::Received => "received",
            RouteStage::Validated => "validated",
            RouteStage::Persisted => "persisted",
            RouteStage::Routed => "routed",
            RouteStage::Acked => "acked",
        };
        f.write_str(name)
    }
}

/// A send request as decoded from the wire.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub content: String,
    pub receiver_id: Option<String>,
    pub group_id: Option<String>,
    pub local_id: Option<String>,
    /// Id of the inbound envelope, echoed on the ack and on errors.
    pub correlation_id: Option<String>,
}

/// Result of a send that reached `Acked`.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub message: PersistedMessage,
    /// Sessions the room delivery reached (zero when nobody is connected).
    pub delivered: usize,
    pub acked: bool,
}

pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    services: Services,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>, services: Services) -> Self {
        Self { registry, services }
    }

    /// Run a send from `connection` through every stage. On rejection the
    /// error is also reported to the sending socket, and only to it.
    pub async fn route(&self, connection: &Connection, request: SendRequest) -> Result<RouteOutcome, ChatError> {
        let correlation_id = request.correlation_id.clone();
        match self.try_route(connection, request).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracing::warn!(handle = %connection.handle, code = err.code(), "Send rejected: {}", err);
                connection.reply(WsEnvelope::correlated(ServerEvent::from(&err), correlation_id));
                Err(err)
            }
        }
    }

    async fn try_route(&self, connection: &Connection, request: SendRequest) -> Result<RouteOutcome, ChatError> {
        let handle = connection.handle;
        let sender_id = self
            .registry
            .lookup_user(handle)
            .await
            .ok_or(ChatError::Unauthenticated)?;
        tracing::debug!(%handle, sender_id = %sender_id, stage = %RouteStage::Received, "Send received");

        let message = ChatMessage {
            content: request.content,
            sender_id,
            receiver_id: request.receiver_id,
            group_id: request.group_id,
            sent_at: chrono::Utc::now(),
            client_id: request.local_id.clone(),
        };

        let persisted = self.persist(&message).await?;
        let target = persisted.message.target()?;

        let is_private = !target.is_group();
        let room = match &target {
            ChatTarget::User(receiver) => Room::User(receiver.clone()),
            ChatTarget::Group(group) => Room::Group(group.clone()),
        };
        let broadcast = WsEnvelope::new(ServerEvent::ReceiveMessage {
            message: persisted.clone(),
            is_private,
        });
        // Group rooms include the sender; it gets the ack instead.
        let delivered = self.registry.deliver(&room, &broadcast, Some(handle)).await;
        tracing::debug!(%handle, room = %room, delivered, stage = %RouteStage::Routed, "Message routed");

        let ack = WsEnvelope::correlated(
            ServerEvent::MessageSent {
                message: persisted.clone(),
                local_id: request.local_id,
            },
            request.correlation_id,
        );
        let acked = connection.reply(ack);
        tracing::debug!(%handle, message_id = %persisted.id, stage = %RouteStage::Acked, "Send acknowledged");

        Ok(RouteOutcome {
            message: persisted,
            delivered,
            acked,
        })
    }

    /// Validate and durably create `message` without routing it. Shared by
    /// the websocket path and the HTTP create route.
    pub async fn persist(&self, message: &ChatMessage) -> Result<PersistedMessage, ChatError> {
        self.validate(message).await?;
        tracing::debug!(sender_id = %message.sender_id, stage = %RouteStage::Validated, "Send validated");

        let sender = match self.services.users.profile(&message.sender_id).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(sender_id = %message.sender_id, "Sender profile lookup failed: {}", e);
                None
            }
        };

        let persisted = self
            .services
            .messages
            .create(message, sender.as_ref())
            .await
            .map_err(|e| {
                tracing::error!(sender_id = %message.sender_id, "Failed to save message: {}", e);
                ChatError::from(e)
            })?;
        tracing::debug!(message_id = %persisted.id, stage = %RouteStage::Persisted, "Message persisted");

        Ok(persisted)
    }

    async fn validate(&self, message: &ChatMessage) -> Result<(), ChatError> {
        match message.target()? {
            ChatTarget::User(receiver) => {
                if self.services.users.profile(&receiver).await?.is_none() {
                    return Err(ChatError::ReceiverNotFound);
                }
            }
            ChatTarget::Group(group) => {
                if !self.services.groups.group_exists(&group).await? {
                    return Err(ChatError::GroupNotFound);
                }
                // Checked live; room joins from bind time may be stale.
                if !self.services.groups.is_member(&message.sender_id, &group).await? {
                    return Err(ChatError::NotGroupMember);
                }
            }
        }
        Ok(())
    }
}
