//! Websocket protocol definitions and request signature utilities.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ChatError;
use crate::models::{GroupSummary, PersistedMessage, PresenceStatus};

/// Signed HTTP header names
pub const HEADER_SIGNATURE: &str = "X-Murmur-Signature";
pub const HEADER_ACTOR: &str = "X-Murmur-Actor";
pub const HEADER_TIMESTAMP: &str = "X-Murmur-Timestamp";

/// Path of the websocket endpoint; part of the signed base string.
pub const WS_PATH: &str = "/api/ws";

// --- Credentials ---

/// Parsed signature header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureHeader {
    pub key_id: String,
    pub signature: String,
}

impl SignatureHeader {
    /// Parse a signature header value like:
    /// `keyId="device_abc123", signature="base64signature=="`
    pub fn parse(header: &str) -> Result<Self, String> {
        let mut key_id = None;
        let mut signature = None;

        for part in header.split(',') {
            let part = part.trim();
            if let Some(rest) = part.strip_prefix("keyId=\"") {
                key_id = Some(rest.trim_end_matches('"').to_string());
            } else if let Some(rest) = part.strip_prefix("signature=\"") {
                signature = Some(rest.trim_end_matches('"').to_string());
            }
        }

        Ok(Self {
            key_id: key_id.ok_or("Missing keyId in signature header")?,
            signature: signature.ok_or("Missing signature in signature header")?,
        })
    }

    /// Format the signature header value
    pub fn to_header_value(&self) -> String {
        format!("keyId=\"{}\", signature=\"{}\"", self.key_id, self.signature)
    }
}

/// The opaque credential a client presents to open a session.
///
/// Field names match the websocket query parameters (`actor`, `keyId`,
/// `timestamp`, `signature`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub actor: String,
    pub key_id: String,
    pub timestamp: String,
    pub signature: String,
}

/// Construct the signature base string for signed requests.
/// Format: `{METHOD}\n{PATH}\n{TIMESTAMP}\n{BODY_HASH}`
pub fn construct_signature_base(method: &str, path: &str, timestamp: &str, body: &[u8]) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    format!("{}\n{}\n{}\n{}", method, path, timestamp, body_hash)
}

/// Verify an Ed25519 signature against a message and public key.
pub fn verify_signature(
    public_key_base64: &str,
    signature_base64: &str,
    message: &[u8],
) -> Result<(), String> {
    let decoded_sig = BASE64
        .decode(signature_base64)
        .map_err(|_| "Invalid base64 signature")?;
    let decoded_pubkey = BASE64
        .decode(public_key_base64)
        .map_err(|_| "Invalid base64 public key")?;

    let public_key = ed25519_dalek::VerifyingKey::from_bytes(
        &decoded_pubkey
            .try_into()
            .map_err(|_| "Invalid public key length")?,
    )
    .map_err(|_| "Invalid public key")?;

    let signature = ed25519_dalek::Signature::from_bytes(
        &decoded_sig
            .try_into()
            .map_err(|_| "Invalid signature length")?,
    );

    use ed25519_dalek::Verifier;
    public_key
        .verify(message, &signature)
        .map_err(|e| format!("Signature verification failed: {}", e))
}

/// Create an Ed25519 signature of a message.
pub fn create_signature(signing_key: &ed25519_dalek::SigningKey, message: &[u8]) -> String {
    use ed25519_dalek::Signer;
    let signature = signing_key.sign(message);
    BASE64.encode(signature.to_bytes())
}

/// Normalize an actor ID to just the handle.
/// Strips `@handle@domain` format to just `handle`.
pub fn normalize_actor_id(actor: &str) -> String {
    if actor.starts_with('@') {
        let segments: Vec<&str> = actor.split('@').collect();
        if segments.len() >= 2 {
            return segments[1].to_string();
        }
    }
    actor.to_string()
}

// --- WebSocket ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> WsEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn correlated(payload: T, correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            ..Self::new(payload)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    SendMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
        /// Informational only; the server uses the bound session identity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        /// Provisional client id, echoed back in the `message_sent` ack.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_id: Option<String>,
    },
    ReloadGroups,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage {
        message: PersistedMessage,
        is_private: bool,
    },
    MessageSent {
        message: PersistedMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_id: Option<String>,
    },
    UserStatus {
        online_users: Vec<String>,
    },
    FriendStatus {
        user_id: String,
        status: PresenceStatus,
    },
    Error {
        code: String,
        message: String,
    },
    GroupsReloaded {
        groups: Vec<GroupSummary>,
    },
}

/// Discriminant of [`ServerEvent`], used to register event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    ReceiveMessage,
    MessageSent,
    UserStatus,
    FriendStatus,
    Error,
    GroupsReloaded,
}

impl ServerEvent {
    pub fn kind(&self) -> ServerEventKind {
        match self {
            ServerEvent::ReceiveMessage { .. } => ServerEventKind::ReceiveMessage,
            ServerEvent::MessageSent { .. } => ServerEventKind::MessageSent,
            ServerEvent::UserStatus { .. } => ServerEventKind::UserStatus,
            ServerEvent::FriendStatus { .. } => ServerEventKind::FriendStatus,
            ServerEvent::Error { .. } => ServerEventKind::Error,
            ServerEvent::GroupsReloaded { .. } => ServerEventKind::GroupsReloaded,
        }
    }
}

impl From<&ChatError> for ServerEvent {
    fn from(err: &ChatError) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.reason().to_string(),
        }
    }
}
