//! Murmur chat client.
//!
//! Keeps a local, optimistic view of conversations in sync with the server
//! over a reconnecting websocket, and persists outgoing messages over signed
//! HTTP with a durable retry queue behind it.

pub mod api_client;
pub mod client;
pub mod client_keys;
pub mod config;
pub mod conversations;
pub mod events;
pub mod pipeline;
pub mod presence;
pub mod retry_queue;
pub mod storage;
pub mod unread;
pub mod ws;

pub use api_client::{ApiClient, MessageApi};
pub use client::ChatClient;
pub use client_keys::KeyPair;
pub use config::ClientConfig;
pub use conversations::{ConversationState, ConversationStore, DeliveryStatus, LocalMessage};
pub use events::{EventBus, HandlerId};
pub use pipeline::{RetryReport, SendPipeline, SendReceipt};
pub use presence::PresenceStore;
pub use retry_queue::{PendingOutboundMessage, RetryQueue};
pub use storage::{FileStore, KeyValueStore, MemoryKvStore};
pub use unread::ReadReceipts;
