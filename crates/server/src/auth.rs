//! Signature verification and the signed-request extractors.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, FromRequestParts, Request},
    http::{request::Parts, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, TimeDelta, Utc};
use murmur_shared::{
    construct_signature_base, normalize_actor_id, verify_signature, ChatError, Credential, ProblemDetails,
    SignatureHeader, HEADER_ACTOR, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use serde::de::DeserializeOwned;

use crate::services::{IdentityVerifier, KeyDirectory};
use crate::state::AppState;

/// Verifies Ed25519 request signatures against registered device keys.
pub struct SignatureVerifier {
    keys: Arc<dyn KeyDirectory>,
    window: TimeDelta,
}

impl SignatureVerifier {
    pub fn new(keys: Arc<dyn KeyDirectory>, window_secs: i64) -> Self {
        Self {
            keys,
            window: TimeDelta::seconds(window_secs),
        }
    }

    fn check_timestamp(&self, timestamp: &str) -> Result<(), String> {
        let ts = DateTime::parse_from_rfc3339(timestamp).map_err(|_| "Invalid timestamp format")?;
        let diff = Utc::now().signed_duration_since(ts.with_timezone(&Utc));
        if diff.abs() > self.window {
            return Err("Timestamp outside acceptable window".to_string());
        }
        Ok(())
    }

    async fn check(&self, credential: &Credential, method: &str, path: &str, body: &[u8]) -> Result<String, String> {
        self.check_timestamp(&credential.timestamp)?;

        let handle = normalize_actor_id(&credential.actor);
        let public_key = self
            .keys
            .public_key(&handle, &credential.key_id)
            .await
            .map_err(|e| format!("Key lookup failed: {}", e))?
            .ok_or_else(|| format!("Key {} not found for actor {}", credential.key_id, credential.actor))?;

        let base = construct_signature_base(method, path, &credential.timestamp, body);
        verify_signature(&public_key, &credential.signature, base.as_bytes())?;

        Ok(handle)
    }
}

#[async_trait]
impl IdentityVerifier for SignatureVerifier {
    async fn verify(&self, credential: &Credential, method: &str, path: &str, body: &[u8]) -> Result<String, ChatError> {
        self.check(credential, method, path, body).await.map_err(|e| {
            tracing::warn!(actor = %credential.actor, "Signature verification failed: {}", e);
            ChatError::Unauthenticated
        })
    }
}

/// Build a credential from the signed-request headers.
pub fn credential_from_headers(headers: &HeaderMap) -> Result<Credential, String> {
    let header = |name: &str| {
        headers
            .get(name)
            .ok_or_else(|| format!("Missing {} header", name))?
            .to_str()
            .map(str::to_string)
            .map_err(|_| format!("Invalid {} header format", name))
    };

    let signature = SignatureHeader::parse(&header(HEADER_SIGNATURE)?)
        .map_err(|e| format!("Failed to parse signature header: {}", e))?;

    Ok(Credential {
        actor: header(HEADER_ACTOR)?,
        key_id: signature.key_id,
        timestamp: header(HEADER_TIMESTAMP)?,
        signature: signature.signature,
    })
}

/// Verified identity of an HTTP caller.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub user_id: String,
}

/// Rejection for requests whose signature or body is unusable.
pub struct AuthRejection(pub ProblemDetails);

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::UNAUTHORIZED);
        (status, Json(self.0)).into_response()
    }
}

async fn verify_request(
    state: &AppState,
    headers: &HeaderMap,
    method: &Method,
    path: &str,
    body: &[u8],
) -> Result<String, AuthRejection> {
    let credential = credential_from_headers(headers).map_err(|e| {
        tracing::debug!("Rejected unsigned request: {}", e);
        AuthRejection(ProblemDetails::unauthorized(e))
    })?;

    state
        .gateway
        .services()
        .verifier
        .verify(&credential, method.as_str(), path, body)
        .await
        .map_err(|e| AuthRejection(ProblemDetails::from(&e)))
}

impl<S> FromRequestParts<S> for SignedRequest
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let user_id = verify_request(&app_state, &parts.headers, &parts.method, parts.uri.path(), &[]).await?;
        Ok(SignedRequest { user_id })
    }
}

/// Signed request with a JSON body. The signature covers the raw body bytes,
/// which are buffered up to the router's `DefaultBodyLimit`.
pub struct SignedJson<T> {
    pub value: T,
    pub user_id: String,
}

impl<S, T> FromRequest<S> for SignedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
    AppState: FromRef<S>,
{
    type Rejection = AuthRejection;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let headers = req.headers().clone();

        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            tracing::debug!(status = %e.status(), "Rejected request body: {}", e.body_text());
            let problem = if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ProblemDetails::payload_too_large(e.body_text())
            } else {
                ProblemDetails::bad_request(format!("Failed to read body: {}", e.body_text()))
            };
            AuthRejection(problem)
        })?;

        let user_id = verify_request(&app_state, &headers, &method, &path, &bytes).await?;

        let value: T = serde_json::from_slice(&bytes)
            .map_err(|e| AuthRejection(ProblemDetails::bad_request(format!("Invalid JSON: {e}"))))?;

        Ok(SignedJson { value, user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use ed25519_dalek::SigningKey;
    use murmur_shared::create_signature;

    async fn verifier_with_key() -> (SignatureVerifier, SigningKey) {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let store = Arc::new(MemoryStore::new());
        store
            .add_device_key("alice", "k1", &BASE64.encode(signing_key.verifying_key().as_bytes()))
            .await;
        (SignatureVerifier::new(store, 300), signing_key)
    }

    fn sign(key: &SigningKey, actor: &str, timestamp: &str) -> Credential {
        let base = construct_signature_base("GET", "/api/ws", timestamp, &[]);
        Credential {
            actor: actor.to_string(),
            key_id: "k1".to_string(),
            timestamp: timestamp.to_string(),
            signature: create_signature(key, base.as_bytes()),
        }
    }

    #[tokio::test]
    async fn accepts_a_fresh_signature() {
        let (verifier, key) = verifier_with_key().await;
        let credential = sign(&key, "@alice@localhost", &Utc::now().to_rfc3339());
        let user = verifier.verify(&credential, "GET", "/api/ws", &[]).await.unwrap();
        assert_eq!(user, "alice");
    }

    #[tokio::test]
    async fn rejects_stale_or_tampered_credentials() {
        let (verifier, key) = verifier_with_key().await;

        let stale = (Utc::now() - TimeDelta::minutes(10)).to_rfc3339();
        let credential = sign(&key, "alice", &stale);
        assert_eq!(
            verifier.verify(&credential, "GET", "/api/ws", &[]).await,
            Err(ChatError::Unauthenticated)
        );

        let credential = sign(&key, "alice", &Utc::now().to_rfc3339());
        assert!(verifier.verify(&credential, "POST", "/api/ws", &[]).await.is_err());

        let credential = sign(&key, "mallory", &Utc::now().to_rfc3339());
        assert!(verifier.verify(&credential, "GET", "/api/ws", &[]).await.is_err());
    }

    #[tokio::test]
    async fn oversized_json_body_is_refused_before_verification() {
        let store = Arc::new(MemoryStore::new());
        let verifier = Arc::new(SignatureVerifier::new(store.clone(), 300));
        let state = AppState::new(
            crate::services::Services::from_store(store, verifier),
            crate::config::ServerConfig::memory(),
        );

        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/api/messages")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(vec![b' '; 3 * 1024 * 1024]))
            .unwrap();
        let rejection = match SignedJson::<serde_json::Value>::from_request(req, &state).await {
            Ok(_) => panic!("oversized body was accepted"),
            Err(rejection) => rejection,
        };
        assert_eq!(rejection.0.status, 413);
    }
}
