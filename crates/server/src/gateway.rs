//! Session lifecycle and command dispatch for authenticated connections.
//!
//! The websocket handler owns the socket; everything it does with a verified
//! identity goes through [`Gateway`], which keeps the registry, presence and
//! router consistent with each other.

use std::sync::Arc;

use murmur_shared::{ChatError, ClientCommand, GroupSummary, PresenceStatus, ServerEvent, WsEnvelope};
use uuid::Uuid;

use crate::presence::PresenceFanout;
use crate::registry::{Connection, ConnectionHandle, Outbound, SessionRegistry};
use crate::router::{MessageRouter, SendRequest};
use crate::services::Services;

pub struct Gateway {
    registry: Arc<SessionRegistry>,
    services: Services,
    presence: PresenceFanout,
    router: MessageRouter,
}

impl Gateway {
    pub fn new(registry: Arc<SessionRegistry>, services: Services) -> Self {
        let presence = PresenceFanout::new(registry.clone(), services.friends.clone());
        let router = MessageRouter::new(registry.clone(), services.clone());
        Self {
            registry,
            services,
            presence,
            router,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Bind a verified user to a new connection, join its rooms and announce
    /// it online.
    pub async fn open_session(&self, user_id: &str, outbound: Outbound) -> Connection {
        let handle = Uuid::new_v4();

        let group_ids: Vec<String> = match self.services.groups.groups_of(user_id).await {
            Ok(groups) => groups.into_iter().map(|g| g.id).collect(),
            Err(e) => {
                // The client's reload_groups after connect fills these in.
                tracing::warn!(user_id = %user_id, "Failed to load groups on connect: {}", e);
                Vec::new()
            }
        };

        let connection = Connection {
            handle,
            outbound: outbound.clone(),
        };
        let outcome = self.registry.bind(handle, user_id, outbound, &group_ids).await;
        if let Some(previous) = outcome.replaced {
            tracing::info!(user_id = %user_id, %previous, "Replaced stale session");
        }
        tracing::info!(user_id = %user_id, %handle, rooms = outcome.rooms.len(), "Session bound");

        self.presence.announce(user_id, PresenceStatus::Online).await;
        connection
    }

    /// Unbind a connection. Offline is announced only if this connection was
    /// still the user's active one.
    pub async fn close_session(&self, handle: ConnectionHandle) {
        match self.registry.unbind(handle).await {
            Some(user_id) => {
                tracing::info!(user_id = %user_id, %handle, "Session unbound");
                self.presence.announce(&user_id, PresenceStatus::Offline).await;
            }
            None => tracing::debug!(%handle, "Connection closed without an active session"),
        }
    }

    /// Dispatch one inbound command. Replies and errors go back on the
    /// issuing socket, bound or not.
    pub async fn handle_command(&self, connection: &Connection, envelope: WsEnvelope<ClientCommand>) {
        let handle = connection.handle;
        match envelope.payload {
            ClientCommand::SendMessage {
                content,
                receiver_id,
                group_id,
                sender_id,
                local_id,
            } => {
                if let Some(claimed) = &sender_id {
                    let bound = self.registry.lookup_user(handle).await;
                    if bound.as_deref() != Some(claimed.as_str()) {
                        tracing::warn!(%handle, claimed = %claimed, "Ignoring sender id that does not match session");
                    }
                }

                let request = SendRequest {
                    content,
                    receiver_id,
                    group_id,
                    local_id,
                    correlation_id: Some(envelope.id),
                };
                // Rejections are already reported to the sender by the router.
                let _ = self.router.route(connection, request).await;
            }
            ClientCommand::ReloadGroups => {
                if let Err(err) = self.reload_groups(connection, Some(envelope.id.clone())).await {
                    tracing::debug!(%handle, code = err.code(), "Group reload rejected");
                    connection.reply(WsEnvelope::correlated(ServerEvent::from(&err), Some(envelope.id)));
                }
            }
        }
    }

    /// Refresh the connection's group rooms from the group directory and reply
    /// with `groups_reloaded`.
    pub async fn reload_groups(
        &self,
        connection: &Connection,
        correlation_id: Option<String>,
    ) -> Result<Vec<GroupSummary>, ChatError> {
        let handle = connection.handle;
        let user_id = self
            .registry
            .lookup_user(handle)
            .await
            .ok_or(ChatError::Unauthenticated)?;

        let groups = self.services.groups.groups_of(&user_id).await?;
        let group_ids: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();
        if !self.registry.sync_group_rooms(handle, &group_ids).await {
            return Err(ChatError::Unauthenticated);
        }

        tracing::debug!(user_id = %user_id, groups = groups.len(), "Groups reloaded");
        let event = WsEnvelope::correlated(ServerEvent::GroupsReloaded { groups: groups.clone() }, correlation_id);
        connection.reply(event);
        Ok(groups)
    }
}
