use std::sync::Arc;

use murmur_server::auth::SignatureVerifier;
use murmur_server::gateway::Gateway;
use murmur_server::memory::MemoryStore;
use murmur_server::registry::{Connection, SessionRegistry};
use murmur_server::router::SendRequest;
use murmur_server::services::Services;
use murmur_shared::{ChatError, ClientCommand, PresenceStatus, Room, ServerEvent, WsEnvelope};
use tokio::sync::mpsc::{self, UnboundedReceiver};

type Inbox = UnboundedReceiver<WsEnvelope<ServerEvent>>;

struct Harness {
    store: Arc<MemoryStore>,
    gateway: Gateway,
}

/// u1 and u2 are friends and both in g1. g2 exists but only u3 is a member.
async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.add_user("u1", Some("Alice")).await;
    store.add_user("u2", Some("Bob")).await;
    store.add_user("u3", None).await;
    store.add_group("g1", "General").await;
    store.add_group("g2", "Private").await;
    store.add_member("g1", "u1").await;
    store.add_member("g1", "u2").await;
    store.add_member("g2", "u3").await;
    store.add_friendship("u1", "u2").await;

    let verifier = Arc::new(SignatureVerifier::new(store.clone(), 300));
    let services = Services::from_store(store.clone(), verifier);
    let gateway = Gateway::new(Arc::new(SessionRegistry::new()), services);
    Harness { store, gateway }
}

async fn connect(gateway: &Gateway, user_id: &str) -> (Connection, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = gateway.open_session(user_id, tx).await;
    (connection, rx)
}

fn drain(inbox: &mut Inbox) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = inbox.try_recv() {
        events.push(envelope.payload);
    }
    events
}

fn to_user(receiver: &str, content: &str, local_id: &str) -> SendRequest {
    SendRequest {
        content: content.to_string(),
        receiver_id: Some(receiver.to_string()),
        local_id: Some(local_id.to_string()),
        ..Default::default()
    }
}

fn to_group(group: &str, content: &str) -> SendRequest {
    SendRequest {
        content: content.to_string(),
        group_id: Some(group.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn private_send_reaches_receiver_and_acks_sender() {
    let h = harness().await;
    let (u1, mut inbox1) = connect(&h.gateway, "u1").await;
    let (_u2, mut inbox2) = connect(&h.gateway, "u2").await;
    drain(&mut inbox1);
    drain(&mut inbox2);

    let outcome = h.gateway.router().route(&u1, to_user("u2", "hi", "local-1")).await.unwrap();
    assert_eq!(outcome.delivered, 1);
    assert!(outcome.acked);

    let received = drain(&mut inbox2);
    assert_eq!(received.len(), 1);
    match &received[0] {
        ServerEvent::ReceiveMessage { message, is_private } => {
            assert!(*is_private);
            assert_eq!(message.message.content, "hi");
            assert_eq!(message.message.sender_id, "u1");
            assert_eq!(message.sender_name.as_deref(), Some("Alice"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let acks = drain(&mut inbox1);
    assert_eq!(acks.len(), 1);
    match &acks[0] {
        ServerEvent::MessageSent { message, local_id } => {
            assert_eq!(message.message.content, "hi");
            assert_eq!(local_id.as_deref(), Some("local-1"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn private_send_to_offline_receiver_is_persisted_only() {
    let h = harness().await;
    let (u1, mut inbox1) = connect(&h.gateway, "u1").await;
    drain(&mut inbox1);

    let outcome = h.gateway.router().route(&u1, to_user("u2", "later", "local-2")).await.unwrap();
    assert_eq!(outcome.delivered, 0);
    assert!(outcome.acked);
    assert_eq!(h.store.message_count().await, 1);
}

#[tokio::test]
async fn non_member_group_send_is_rejected_before_persistence() {
    let h = harness().await;
    let (u1, mut inbox1) = connect(&h.gateway, "u1").await;
    let (_u3, mut inbox3) = connect(&h.gateway, "u3").await;
    drain(&mut inbox1);
    drain(&mut inbox3);

    let result = h.gateway.router().route(&u1, to_group("g2", "let me in")).await;
    assert!(result.is_err());

    let events = drain(&mut inbox1);
    assert_eq!(
        events,
        vec![ServerEvent::Error {
            code: "FORBIDDEN".to_string(),
            message: "您不是该群组成员".to_string(),
        }]
    );
    assert!(drain(&mut inbox3).is_empty());
    assert_eq!(h.store.message_count().await, 0);
}

#[tokio::test]
async fn invalid_addressing_is_reported_to_sender_only() {
    let h = harness().await;
    let (u1, mut inbox1) = connect(&h.gateway, "u1").await;
    let (_u2, mut inbox2) = connect(&h.gateway, "u2").await;
    drain(&mut inbox1);
    drain(&mut inbox2);

    let both = SendRequest {
        content: "?".to_string(),
        receiver_id: Some("u2".to_string()),
        group_id: Some("g1".to_string()),
        ..Default::default()
    };
    h.gateway.router().route(&u1, both).await.unwrap_err();
    h.gateway.router().route(&u1, to_user("ghost", "boo", "l")).await.unwrap_err();
    h.gateway.router().route(&u1, to_group("nope", "boo")).await.unwrap_err();

    let codes: Vec<String> = drain(&mut inbox1)
        .into_iter()
        .map(|event| match event {
            ServerEvent::Error { code, .. } => code,
            other => panic!("unexpected event {:?}", other),
        })
        .collect();
    assert_eq!(codes, vec!["MALFORMED", "NOT_FOUND", "NOT_FOUND"]);
    assert!(drain(&mut inbox2).is_empty());
    assert_eq!(h.store.message_count().await, 0);
}

#[tokio::test]
async fn persistence_failure_is_not_routed() {
    let h = harness().await;
    let (u1, mut inbox1) = connect(&h.gateway, "u1").await;
    let (_u2, mut inbox2) = connect(&h.gateway, "u2").await;
    drain(&mut inbox1);
    drain(&mut inbox2);

    h.store.set_fail_writes(true);
    h.gateway.router().route(&u1, to_group("g1", "lost?")).await.unwrap_err();

    assert!(drain(&mut inbox2).is_empty());
    match drain(&mut inbox1).as_slice() {
        [ServerEvent::Error { code, .. }] => assert_eq!(code, "PERSISTENCE_ERROR"),
        other => panic!("unexpected events {:?}", other),
    }
}

#[tokio::test]
async fn group_send_reaches_other_members_not_sender() {
    let h = harness().await;
    let (u1, mut inbox1) = connect(&h.gateway, "u1").await;
    let (_u2, mut inbox2) = connect(&h.gateway, "u2").await;
    let (_u3, mut inbox3) = connect(&h.gateway, "u3").await;
    drain(&mut inbox1);
    drain(&mut inbox2);
    drain(&mut inbox3);

    h.gateway.router().route(&u1, to_group("g1", "hello all")).await.unwrap();

    assert!(matches!(
        drain(&mut inbox2).as_slice(),
        [ServerEvent::ReceiveMessage { is_private: false, .. }]
    ));
    assert!(matches!(drain(&mut inbox1).as_slice(), [ServerEvent::MessageSent { .. }]));
    assert!(drain(&mut inbox3).is_empty());
}

#[tokio::test]
async fn presence_reaches_online_friends_only() {
    let h = harness().await;
    let (_u2, mut inbox2) = connect(&h.gateway, "u2").await;
    let (_u3, mut inbox3) = connect(&h.gateway, "u3").await;
    drain(&mut inbox2);
    drain(&mut inbox3);

    let (u1, _inbox1) = connect(&h.gateway, "u1").await;
    let friend_events: Vec<ServerEvent> = drain(&mut inbox2)
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::FriendStatus { .. }))
        .collect();
    assert_eq!(
        friend_events,
        vec![ServerEvent::FriendStatus {
            user_id: "u1".to_string(),
            status: PresenceStatus::Online,
        }]
    );
    // u3 is not a friend; it only sees the coarse online list.
    assert!(drain(&mut inbox3)
        .iter()
        .all(|e| matches!(e, ServerEvent::UserStatus { .. })));

    h.gateway.close_session(u1.handle).await;
    assert!(drain(&mut inbox2).contains(&ServerEvent::FriendStatus {
        user_id: "u1".to_string(),
        status: PresenceStatus::Offline,
    }));
}

#[tokio::test]
async fn reconnect_rejoins_rooms_and_reloads_groups() {
    let h = harness().await;
    let (first, _inbox) = connect(&h.gateway, "u1").await;
    h.gateway.close_session(first.handle).await;

    // Joined while offline.
    h.store.add_group("g3", "Book club").await;
    h.store.add_member("g3", "u1").await;

    let (second, mut inbox) = connect(&h.gateway, "u1").await;
    let rooms = h.gateway.registry().rooms_of(second.handle).await;
    assert!(rooms.contains(&Room::User("u1".into())));
    assert!(rooms.contains(&Room::Group("g1".into())));
    assert!(rooms.contains(&Room::Group("g3".into())));
    drain(&mut inbox);

    h.gateway
        .handle_command(&second, WsEnvelope::new(ClientCommand::ReloadGroups))
        .await;
    let groups = drain(&mut inbox)
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::GroupsReloaded { groups } => Some(groups),
            _ => None,
        })
        .expect("groups_reloaded event");
    let ids: Vec<&str> = groups.iter().map(|g| g.id.as_str()).collect();
    assert_eq!(ids, vec!["g1", "g3"]);
}

#[tokio::test]
async fn reload_groups_leaves_rooms_of_departed_groups() {
    let h = harness().await;
    let (u1, _inbox) = connect(&h.gateway, "u1").await;

    h.store.remove_member("g1", "u1").await;
    h.gateway.reload_groups(&u1, None).await.unwrap();

    let rooms = h.gateway.registry().rooms_of(u1.handle).await;
    assert!(!rooms.contains(&Room::Group("g1".into())));
    assert!(rooms.contains(&Room::User("u1".into())));
}

#[tokio::test]
async fn stale_connection_close_does_not_announce_offline() {
    let h = harness().await;
    let (_u2, mut inbox2) = connect(&h.gateway, "u2").await;
    let (stale, _old) = connect(&h.gateway, "u1").await;
    let (active, _new) = connect(&h.gateway, "u1").await;
    drain(&mut inbox2);

    h.gateway.close_session(stale.handle).await;
    assert!(drain(&mut inbox2).is_empty());
    assert_eq!(h.gateway.registry().lookup_handle("u1").await, Some(active.handle));
}

#[tokio::test]
async fn send_command_ignores_claimed_sender() {
    let h = harness().await;
    let (u1, mut inbox1) = connect(&h.gateway, "u1").await;
    drain(&mut inbox1);

    let envelope = WsEnvelope::new(ClientCommand::SendMessage {
        content: "spoof".to_string(),
        receiver_id: Some("u2".to_string()),
        group_id: None,
        sender_id: Some("u3".to_string()),
        local_id: Some("l-9".to_string()),
    });
    let envelope_id = envelope.id.clone();
    h.gateway.handle_command(&u1, envelope).await;

    let stored = h.store.all_messages().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message.sender_id, "u1");

    let ack = inbox1.try_recv().expect("ack");
    assert_eq!(ack.correlation_id.as_deref(), Some(envelope_id.as_str()));
}

#[tokio::test]
async fn replaced_connection_still_hears_its_rejections() {
    let h = harness().await;
    let (stale, mut old) = connect(&h.gateway, "u1").await;
    let (_active, mut new) = connect(&h.gateway, "u1").await;
    drain(&mut old);
    drain(&mut new);

    let err = h
        .gateway
        .router()
        .route(&stale, to_user("u2", "from the old tab", "l-1"))
        .await
        .unwrap_err();
    assert_eq!(err, ChatError::Unauthenticated);
    h.gateway
        .handle_command(&stale, WsEnvelope::new(ClientCommand::ReloadGroups))
        .await;

    let codes: Vec<String> = drain(&mut old)
        .into_iter()
        .map(|event| match event {
            ServerEvent::Error { code, .. } => code,
            other => panic!("unexpected event {:?}", other),
        })
        .collect();
    assert_eq!(codes, vec!["UNAUTHENTICATED", "UNAUTHENTICATED"]);
    assert!(drain(&mut new).is_empty());
    assert_eq!(h.store.message_count().await, 0);
}
