//! HTTP API client with request signing.

use async_trait::async_trait;
use murmur_shared::{
    ApiError, ChatTarget, CreateMessageRequest, HistoryPage, MarkReadResponse, PersistedMessage, UnreadCount,
    HEADER_ACTOR, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client_keys::{sign, signature_header, KeyPair};

/// The server-side operations the send pipeline and read tracker depend on.
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// Durably create a message. Replays with the same `client_id` return the
    /// stored message.
    async fn create_message(&self, request: &CreateMessageRequest) -> Result<PersistedMessage, ApiError>;

    async fn history(&self, chat: &ChatTarget, limit: usize, skip: usize) -> Result<HistoryPage, ApiError>;

    async fn mark_read(&self, message_id: &str) -> Result<MarkReadResponse, ApiError>;

    async fn mark_conversation_read(&self, chat: &ChatTarget) -> Result<MarkReadResponse, ApiError>;

    async fn unread_count(&self, chat: &ChatTarget) -> Result<UnreadCount, ApiError>;
}

/// HTTP client for making signed API requests to the chat server.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    keys: Option<KeyPair>,
    actor: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            keys: None,
            actor: None,
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Configure signing credentials
    pub fn with_signing(mut self, keys: Option<KeyPair>, actor: Option<String>) -> Self {
        self.keys = keys;
        self.actor = actor;
        self
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn signed(&self, mut rb: RequestBuilder, method: &str, url: &str, body: &[u8]) -> RequestBuilder {
        let (Some(keys), Some(actor)) = (&self.keys, &self.actor) else {
            return rb;
        };

        let path_only = match reqwest::Url::parse(url) {
            Ok(u) => u.path().to_string(),
            Err(_) => url.split('?').next().unwrap_or(url).to_string(),
        };

        if let Some(credential) = sign(method, &path_only, body, keys, actor) {
            rb = rb.header(HEADER_ACTOR, credential.actor.clone());
            rb = rb.header(HEADER_TIMESTAMP, credential.timestamp.clone());
            rb = rb.header(HEADER_SIGNATURE, signature_header(&credential));
        }
        rb
    }

    async fn finish<TRes: DeserializeOwned>(rb: RequestBuilder) -> Result<TRes, ApiError> {
        let resp = rb.send().await.map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();

        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }

        serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    /// Make a signed GET request
    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let url = self.url(path);
        let rb = self.signed(self.client.get(&url), "GET", &url, &[]);
        Self::finish(rb).await
    }

    /// Make a signed POST request with JSON body
    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let url = self.url(path);
        let body_bytes = serde_json::to_vec(body).map_err(|e| ApiError::Deserialize(e.to_string()))?;

        let rb = self
            .signed(self.client.post(&url), "POST", &url, &body_bytes)
            .header("Content-Type", "application/json")
            .body(body_bytes);
        Self::finish(rb).await
    }

    /// Signed POST without a payload; the signature covers an empty body.
    pub async fn post_empty<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let url = self.url(path);
        let rb = self.signed(self.client.post(&url), "POST", &url, &[]);
        Self::finish(rb).await
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageApi for ApiClient {
    async fn create_message(&self, request: &CreateMessageRequest) -> Result<PersistedMessage, ApiError> {
        self.post_json("/api/messages", request).await
    }

    async fn history(&self, chat: &ChatTarget, limit: usize, skip: usize) -> Result<HistoryPage, ApiError> {
        self.get_json(&format!(
            "/api/conversations/{}/messages?limit={}&skip={}",
            chat, limit, skip
        ))
        .await
    }

    async fn mark_read(&self, message_id: &str) -> Result<MarkReadResponse, ApiError> {
        self.post_empty(&format!("/api/messages/{}/read", urlencoding::encode(message_id)))
            .await
    }

    async fn mark_conversation_read(&self, chat: &ChatTarget) -> Result<MarkReadResponse, ApiError> {
        self.post_empty(&format!("/api/conversations/{}/read", chat)).await
    }

    async fn unread_count(&self, chat: &ChatTarget) -> Result<UnreadCount, ApiError> {
        self.get_json(&format!("/api/conversations/{}/unread", chat)).await
    }
}
