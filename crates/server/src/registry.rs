//! Session registry: connection handle ↔ user identity, plus room membership.
//!
//! The registry keeps three indexes under one lock:
//! - handle → session (user id, outbound channel, joined rooms)
//! - user id → handle (one active connection per user, last connect wins)
//! - room → subscribed handles (for delivery)
//!
//! Delivery snapshots the subscribers' outbound channels under the read lock
//! and sends after releasing it, so routing never waits on a membership change.

use std::collections::{HashMap, HashSet};

use murmur_shared::{Room, ServerEvent, WsEnvelope};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Identifies one websocket connection.
pub type ConnectionHandle = Uuid;

/// Outbound side of a connection; the socket task drains it.
pub type Outbound = mpsc::UnboundedSender<WsEnvelope<ServerEvent>>;

/// One accepted socket. `outbound` keeps reaching that socket after a newer
/// connection of the same user replaced it in the registry.
#[derive(Debug, Clone)]
pub struct Connection {
    pub handle: ConnectionHandle,
    pub outbound: Outbound,
}

impl Connection {
    /// Send straight to this socket. Returns `false` once it has closed.
    pub fn reply(&self, envelope: WsEnvelope<ServerEvent>) -> bool {
        self.outbound.send(envelope).is_ok()
    }
}

struct Session {
    user_id: String,
    outbound: Outbound,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<ConnectionHandle, Session>,
    user_sessions: HashMap<String, ConnectionHandle>,
    room_subscriptions: HashMap<Room, HashSet<ConnectionHandle>>,
}

impl RegistryInner {
    fn subscribe(&mut self, handle: ConnectionHandle, room: Room) -> bool {
        let Some(session) = self.sessions.get_mut(&handle) else {
            return false;
        };
        session.rooms.insert(room.clone());
        self.room_subscriptions.entry(room).or_default().insert(handle)
    }

    fn unsubscribe(&mut self, handle: ConnectionHandle, room: &Room) -> bool {
        let removed = self
            .room_subscriptions
            .get_mut(room)
            .is_some_and(|subscribers| subscribers.remove(&handle));

        if self.room_subscriptions.get(room).is_some_and(HashSet::is_empty) {
            self.room_subscriptions.remove(room);
        }
        if let Some(session) = self.sessions.get_mut(&handle) {
            session.rooms.remove(room);
        }
        removed
    }

    fn remove_session(&mut self, handle: ConnectionHandle) -> Option<Session> {
        let session = self.sessions.remove(&handle)?;
        for room in &session.rooms {
            if let Some(subscribers) = self.room_subscriptions.get_mut(room) {
                subscribers.remove(&handle);
                if subscribers.is_empty() {
                    self.room_subscriptions.remove(room);
                }
            }
        }
        if self.user_sessions.get(&session.user_id) == Some(&handle) {
            self.user_sessions.remove(&session.user_id);
        }
        Some(session)
    }
}

/// What happened to the user's previous connection when a new one was bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOutcome {
    /// The connection that was active for this user before, now evicted.
    pub replaced: Option<ConnectionHandle>,
    pub rooms: Vec<Room>,
}

/// Lock-guarded registry of live sessions. Construct one per server (and one
/// per test case).
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handle` to `user_id` and join the personal room plus one room per
    /// group in `group_ids`.
    ///
    /// Any connection previously bound to the same user is dropped from the
    /// registry (and from all its rooms) but not closed.
    pub async fn bind(
        &self,
        handle: ConnectionHandle,
        user_id: &str,
        outbound: Outbound,
        group_ids: &[String],
    ) -> BindOutcome {
        let mut inner = self.inner.write().await;

        let replaced = match inner.user_sessions.get(user_id).copied() {
            Some(previous) if previous != handle => {
                inner.remove_session(previous);
                Some(previous)
            }
            _ => None,
        };
        // Rebinding the same handle starts over with a fresh room set.
        inner.remove_session(handle);

        inner.sessions.insert(
            handle,
            Session {
                user_id: user_id.to_string(),
                outbound,
                rooms: HashSet::new(),
            },
        );
        inner.user_sessions.insert(user_id.to_string(), handle);

        let mut rooms = Vec::with_capacity(group_ids.len() + 1);
        rooms.push(Room::User(user_id.to_string()));
        rooms.extend(group_ids.iter().map(|g| Room::Group(g.clone())));
        for room in &rooms {
            inner.subscribe(handle, room.clone());
        }

        BindOutcome { replaced, rooms }
    }

    /// Remove `handle` from both directions of the map and from every room.
    /// Returns the user that was bound, or `None` if nothing was bound (so a
    /// second call is a no-op).
    pub async fn unbind(&self, handle: ConnectionHandle) -> Option<String> {
        let mut inner = self.inner.write().await;
        inner.remove_session(handle).map(|session| session.user_id)
    }

    pub async fn lookup_user(&self, handle: ConnectionHandle) -> Option<String> {
        let inner = self.inner.read().await;
        inner.sessions.get(&handle).map(|s| s.user_id.clone())
    }

    pub async fn lookup_handle(&self, user_id: &str) -> Option<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner.user_sessions.get(user_id).copied()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.lookup_handle(user_id).await.is_some()
    }

    /// Join a room. Returns `false` if the handle is not bound or was already
    /// subscribed.
    pub async fn join(&self, handle: ConnectionHandle, room: Room) -> bool {
        self.inner.write().await.subscribe(handle, room)
    }

    pub async fn leave(&self, handle: ConnectionHandle, room: &Room) -> bool {
        self.inner.write().await.unsubscribe(handle, room)
    }

    /// Make the session's group rooms exactly `group_ids`, leaving groups the
    /// user no longer belongs to. The personal room is untouched.
    pub async fn sync_group_rooms(&self, handle: ConnectionHandle, group_ids: &[String]) -> bool {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get(&handle) else {
            return false;
        };

        let wanted: HashSet<Room> = group_ids.iter().map(|g| Room::Group(g.clone())).collect();
        let stale: Vec<Room> = session
            .rooms
            .iter()
            .filter(|room| matches!(room, Room::Group(_)) && !wanted.contains(*room))
            .cloned()
            .collect();

        for room in &stale {
            inner.unsubscribe(handle, room);
        }
        for room in wanted {
            inner.subscribe(handle, room);
        }
        true
    }

    pub async fn rooms_of(&self, handle: ConnectionHandle) -> HashSet<Room> {
        let inner = self.inner.read().await;
        inner.sessions.get(&handle).map(|s| s.rooms.clone()).unwrap_or_default()
    }

    pub async fn subscribers(&self, room: &Room) -> Vec<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner
            .room_subscriptions
            .get(room)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Sorted ids of every user with a bound session.
    pub async fn online_users(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut users: Vec<String> = inner.user_sessions.keys().cloned().collect();
        users.sort();
        users
    }

    /// Deliver `envelope` to every subscriber of `room` except `exclude`.
    /// Returns how many sessions accepted it; an empty room is a no-op.
    pub async fn deliver(
        &self,
        room: &Room,
        envelope: &WsEnvelope<ServerEvent>,
        exclude: Option<ConnectionHandle>,
    ) -> usize {
        let targets: Vec<Outbound> = {
            let inner = self.inner.read().await;
            inner
                .room_subscriptions
                .get(room)
                .into_iter()
                .flatten()
                .filter(|handle| Some(**handle) != exclude)
                .filter_map(|handle| inner.sessions.get(handle))
                .map(|session| session.outbound.clone())
                .collect()
        };

        targets
            .iter()
            .filter(|outbound| outbound.send(envelope.clone()).is_ok())
            .count()
    }

    /// Deliver to every bound session.
    pub async fn broadcast(&self, envelope: &WsEnvelope<ServerEvent>) -> usize {
        let targets: Vec<Outbound> = {
            let inner = self.inner.read().await;
            inner.sessions.values().map(|s| s.outbound.clone()).collect()
        };
        targets
            .iter()
            .filter(|outbound| outbound.send(envelope.clone()).is_ok())
            .count()
    }
}
