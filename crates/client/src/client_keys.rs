//! Client-side Ed25519 key generation and request signing.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use murmur_shared::{construct_signature_base, create_signature, Credential, SignatureHeader};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::storage::{self, KeyValueStore};

/// Ed25519 keypair stored as base64 strings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KeyPair {
    pub public_key: String,  // Base64
    pub private_key: String, // Base64
    pub key_id: Option<String>,
}

const STORAGE_KEY: &str = "murmur_client_keys";

/// Generate a new Ed25519 keypair
pub fn generate_keypair() -> KeyPair {
    let mut csprng = OsRng;
    let signing_key = SigningKey::generate(&mut csprng);
    let verifying_key = signing_key.verifying_key();

    KeyPair {
        public_key: BASE64.encode(verifying_key.as_bytes()),
        private_key: BASE64.encode(signing_key.to_bytes()),
        key_id: None,
    }
}

pub fn save_keypair(store: &dyn KeyValueStore, keys: &KeyPair) -> bool {
    storage::save(store, STORAGE_KEY, keys)
}

pub fn load_keypair(store: &dyn KeyValueStore) -> Option<KeyPair> {
    storage::load(store, STORAGE_KEY)
}

pub fn clear_keypair(store: &dyn KeyValueStore) {
    store.remove_raw(STORAGE_KEY);
}

fn signing_key(keys: &KeyPair) -> Option<SigningKey> {
    let priv_bytes = BASE64.decode(&keys.private_key).ok()?;
    let priv_arr: [u8; 32] = priv_bytes.try_into().ok()?;
    Some(SigningKey::from_bytes(&priv_arr))
}

/// Sign `method path body` for `actor`. `None` when the key pair has no
/// registered key id or the private key is unreadable.
pub fn sign(method: &str, path: &str, body: &[u8], keys: &KeyPair, actor: &str) -> Option<Credential> {
    let key_id = keys.key_id.as_ref()?;
    let signing_key = signing_key(keys)?;

    let timestamp = Utc::now().to_rfc3339();
    let base = construct_signature_base(method, path, &timestamp, body);

    Some(Credential {
        actor: actor.to_string(),
        key_id: key_id.clone(),
        timestamp,
        signature: create_signature(&signing_key, base.as_bytes()),
    })
}

/// Signature header value for an HTTP request.
pub fn signature_header(credential: &Credential) -> String {
    SignatureHeader {
        key_id: credential.key_id.clone(),
        signature: credential.signature.clone(),
    }
    .to_header_value()
}

/// Sign a WebSocket upgrade request (GET with empty body)
pub fn sign_ws_request(path: &str, keys: &KeyPair, actor: &str) -> Option<Credential> {
    sign("GET", path, &[], keys, actor)
}

/// Credential in URL query string format
pub fn to_query_string(credential: &Credential) -> String {
    format!(
        "actor={}&timestamp={}&keyId={}&signature={}",
        urlencoding::encode(&credential.actor),
        urlencoding::encode(&credential.timestamp),
        urlencoding::encode(&credential.key_id),
        urlencoding::encode(&credential.signature)
    )
}
