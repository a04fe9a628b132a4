//! HTTP routes for message creation, history and read receipts.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use murmur_shared::{
    ChatError, ChatMessage, ChatTarget, CreateMessageRequest, HistoryPage, MarkReadResponse, PersistedMessage,
    ProblemDetails, UnreadCount,
};
use serde::Deserialize;

use crate::auth::{SignedJson, SignedRequest};
use crate::services::StoreError;
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Error response rendered as `application/problem+json`.
pub struct ApiFailure(ProblemDetails);

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(self.0)).into_response();
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<ChatError> for ApiFailure {
    fn from(err: ChatError) -> Self {
        ApiFailure(ProblemDetails::from(&err))
    }
}

impl From<StoreError> for ApiFailure {
    fn from(err: StoreError) -> Self {
        tracing::error!("Store error: {}", err);
        ApiFailure::from(ChatError::from(err))
    }
}

type ApiResult<T> = Result<Json<T>, ApiFailure>;

fn parse_chat(chat_id: &str) -> Result<ChatTarget, ApiFailure> {
    chat_id
        .parse()
        .map_err(|_| ApiFailure(ProblemDetails::bad_request(format!("Invalid chat id: {}", chat_id))))
}

/// Group conversations are readable by members only.
async fn ensure_readable(state: &AppState, viewer: &str, chat: &ChatTarget) -> Result<(), ApiFailure> {
    if let ChatTarget::Group(group_id) = chat {
        let groups = &state.gateway.services().groups;
        if !groups.group_exists(group_id).await? {
            return Err(ChatError::GroupNotFound.into());
        }
        if !groups.is_member(viewer, group_id).await? {
            return Err(ChatError::NotGroupMember.into());
        }
    }
    Ok(())
}

/// Persist a message without routing it. Replays with the same `clientId`
/// return the stored message.
pub async fn create_message(
    State(state): State<AppState>,
    SignedJson { value: payload, user_id }: SignedJson<CreateMessageRequest>,
) -> ApiResult<PersistedMessage> {
    let message = ChatMessage {
        content: payload.content,
        sender_id: user_id,
        receiver_id: payload.receiver_id,
        group_id: payload.group_id,
        sent_at: chrono::Utc::now(),
        client_id: payload.client_id,
    };

    let persisted = state.gateway.router().persist(&message).await?;
    Ok(Json(persisted))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    signed: SignedRequest,
) -> ApiResult<HistoryPage> {
    let chat = parse_chat(&chat_id)?;
    ensure_readable(&state, &signed.user_id, &chat).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(state.config.history_limit_max);
    let skip = query.skip.unwrap_or(0);

    let items = state
        .gateway
        .services()
        .messages
        .query_by_conversation(&signed.user_id, &chat, limit, skip)
        .await?;

    Ok(Json(HistoryPage { chat_id: chat, items }))
}

pub async fn mark_message_read(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    signed: SignedRequest,
) -> ApiResult<MarkReadResponse> {
    let changed = state
        .gateway
        .services()
        .messages
        .mark_read(&signed.user_id, &message_id)
        .await?;
    Ok(Json(MarkReadResponse {
        updated: u64::from(changed),
    }))
}

pub async fn mark_conversation_read(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    signed: SignedRequest,
) -> ApiResult<MarkReadResponse> {
    let chat = parse_chat(&chat_id)?;
    ensure_readable(&state, &signed.user_id, &chat).await?;

    let updated = state
        .gateway
        .services()
        .messages
        .mark_conversation_read(&signed.user_id, &chat)
        .await?;
    tracing::debug!(user_id = %signed.user_id, chat = %chat, updated, "Conversation marked read");
    Ok(Json(MarkReadResponse { updated }))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    signed: SignedRequest,
) -> ApiResult<UnreadCount> {
    let chat = parse_chat(&chat_id)?;
    ensure_readable(&state, &signed.user_id, &chat).await?;

    let count = state
        .gateway
        .services()
        .messages
        .unread_count(&signed.user_id, &chat)
        .await?;
    Ok(Json(UnreadCount { count }))
}
