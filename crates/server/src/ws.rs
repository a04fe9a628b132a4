//! WebSocket handler for real-time messaging.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        rejection::QueryRejection,
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use murmur_shared::{ChatError, ClientCommand, Credential, ProblemDetails, ServerEvent, WsEnvelope, WS_PATH};
use tokio::sync::mpsc;

use crate::state::AppState;

/// WebSocket upgrade handler. The credential travels in the query string and
/// is verified before the upgrade; failures never create a session.
pub async fn ws_handler(
    State(state): State<AppState>,
    credential: Result<Query<Credential>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> Response {
    let credential = match credential {
        Ok(Query(credential)) => credential,
        Err(e) => {
            tracing::warn!("WebSocket connection without credential: {}", e);
            return unauthorized("Missing credential");
        }
    };

    let user_id = match state
        .gateway
        .services()
        .verifier
        .verify(&credential, "GET", WS_PATH, &[])
        .await
    {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::error!(actor = %credential.actor, "WebSocket auth failed: {}", e);
            return unauthorized(e.reason());
        }
    };

    tracing::info!("WebSocket connection authenticated for user: {}", user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

fn unauthorized(detail: &str) -> Response {
    let problem = ProblemDetails::unauthorized(detail);
    (axum::http::StatusCode::UNAUTHORIZED, axum::Json(problem)).into_response()
}

/// Handle an authenticated WebSocket connection
async fn handle_socket(socket: WebSocket, user_id: String, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<WsEnvelope<ServerEvent>>();

    let gateway = state.gateway.clone();
    let connection = gateway.open_session(&user_id, forward_tx).await;
    let handle = connection.handle;

    // Task to forward events to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(event) = forward_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to encode server event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Main receive loop
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<WsEnvelope<ClientCommand>>(&text) {
                Ok(envelope) => gateway.handle_command(&connection, envelope).await,
                Err(e) => {
                    tracing::warn!(%handle, "Malformed client command: {}", e);
                    connection.reply(WsEnvelope::new(ServerEvent::from(&ChatError::Malformed)));
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(%handle, "WebSocket receive error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    gateway.close_session(handle).await;
    send_task.abort();

    tracing::info!("WebSocket connection closed for user: {}", user_id);
}
