//! Line-oriented chat client.
//!
//! `@user text` sends a private message, `#group text` a group message.

use std::sync::Arc;

use murmur_client::client_keys::{generate_keypair, load_keypair, save_keypair};
use murmur_client::{ChatClient, ClientConfig, FileStore, KeyValueStore};
use murmur_shared::{ChatTarget, ServerEvent, ServerEventKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn parse_line(line: &str) -> Option<(ChatTarget, &str)> {
    let (head, text) = line.trim().split_once(' ')?;
    let target = if let Some(user) = head.strip_prefix('@') {
        ChatTarget::user(user)
    } else if let Some(group) = head.strip_prefix('#') {
        ChatTarget::group(group)
    } else {
        return None;
    };
    if target.id().is_empty() || text.trim().is_empty() {
        return None;
    }
    Some((target, text.trim()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env();
    let user_id = std::env::var("MURMUR_USER").map_err(|_| anyhow::anyhow!("MURMUR_USER is not set"))?;
    let data_dir = config
        .data_dir
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no data directory; set MURMUR_DATA_DIR"))?;
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(data_dir));

    let keys = match load_keypair(store.as_ref()) {
        Some(keys) => keys,
        None => {
            let mut keys = generate_keypair();
            keys.key_id = Some(format!("device_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
            if !save_keypair(store.as_ref(), &keys) {
                anyhow::bail!("failed to save the new key pair");
            }
            tracing::info!("Generated a new device key");
            keys
        }
    };
    println!(
        "device key {} public key {}",
        keys.key_id.as_deref().unwrap_or("-"),
        keys.public_key
    );

    let client = ChatClient::new(config, user_id, Some(keys), store);
    client.events().on(ServerEventKind::ReceiveMessage, |envelope| {
        if let ServerEvent::ReceiveMessage { message, is_private } = &envelope.payload {
            let scope = if *is_private { "private" } else { "group" };
            let sender = message.sender_name.as_deref().unwrap_or(&message.message.sender_id);
            println!("[{}] {}: {}", scope, sender, message.message.content);
        }
    });
    client.events().on(ServerEventKind::FriendStatus, |envelope| {
        if let ServerEvent::FriendStatus { user_id, status } = &envelope.payload {
            println!("* {} is {:?}", user_id, status);
        }
    });
    client.events().on(ServerEventKind::GroupsReloaded, |envelope| {
        if let ServerEvent::GroupsReloaded { groups } = &envelope.payload {
            let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
            println!("* groups: {}", names.join(", "));
        }
    });
    client.events().on(ServerEventKind::Error, |envelope| {
        if let ServerEvent::Error { message, .. } = &envelope.payload {
            println!("! {}", message);
        }
    });

    client.start().await?;

    let mut in_flight = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Some((target, text)) => {
                if client.is_offline() {
                    println!("(offline, message will be delivered later)");
                }
                in_flight.push(client.send(text, &target).persist);
            }
            None if line.trim().is_empty() => {}
            None => println!("usage: @user text | #group text"),
        }
    }

    // Anything that failed to persist is in the retry queue by the time these finish.
    futures_util::future::join_all(in_flight).await;
    client.disconnect().await;
    Ok(())
}
