//! Murmur chat gateway.
//!
//! Accepts authenticated websocket sessions, persists and routes chat
//! messages to private and group rooms, and fans out friend presence.

pub mod auth;
pub mod config;
pub mod db;
pub mod gateway;
pub mod memory;
pub mod presence;
pub mod registry;
pub mod router;
pub mod routes;
pub mod services;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::SignatureVerifier;
use crate::config::{ServerConfig, StorageBackend};
use crate::db::AuroraStore;
use crate::memory::MemoryStore;
use crate::services::Services;
use crate::state::AppState;

/// Build the services for the configured storage backend.
pub fn build_services(config: &ServerConfig) -> anyhow::Result<Services> {
    let services = match &config.storage {
        StorageBackend::Aurora { path } => {
            let store = Arc::new(AuroraStore::new(db::init_database(path)?));
            let verifier = Arc::new(SignatureVerifier::new(store.clone(), config.signature_window_secs));
            Services::from_store(store, verifier)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; data is lost on restart");
            let store = Arc::new(MemoryStore::new());
            let verifier = Arc::new(SignatureVerifier::new(store.clone(), config.signature_window_secs));
            Services::from_store(store, verifier)
        }
    };
    Ok(services)
}

/// Build the HTTP and websocket router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = DefaultBodyLimit::max(state.config.max_body_bytes);

    Router::new()
        .route("/api/messages", post(routes::create_message))
        .route("/api/messages/{message_id}/read", post(routes::mark_message_read))
        .route("/api/conversations/{chat_id}/messages", get(routes::list_messages))
        .route("/api/conversations/{chat_id}/read", post(routes::mark_conversation_read))
        .route("/api/conversations/{chat_id}/unread", get(routes::unread_count))
        .route(murmur_shared::WS_PATH, get(ws::ws_handler))
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
