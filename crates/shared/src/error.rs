//! Shared error types: the chat error taxonomy and RFC7807 Problem Details.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while authenticating, validating, persisting or transporting
/// a chat message.
///
/// Server-side errors are reported to the originating connection only, as a
/// `ServerEvent::Error` built from [`ChatError::code`] and [`ChatError::reason`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("message must address exactly one of receiver or group")]
    Malformed,
    #[error("receiver not found")]
    ReceiverNotFound,
    #[error("group not found")]
    GroupNotFound,
    #[error("not a group member")]
    NotGroupMember,
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ChatError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthenticated => "UNAUTHENTICATED",
            ChatError::Malformed => "MALFORMED",
            ChatError::ReceiverNotFound | ChatError::GroupNotFound => "NOT_FOUND",
            ChatError::NotGroupMember => "FORBIDDEN",
            ChatError::Persistence(_) => "PERSISTENCE_ERROR",
            ChatError::Transport(_) => "TRANSPORT_ERROR",
        }
    }

    /// User-facing reason shown by the chat UI.
    pub fn reason(&self) -> &'static str {
        match self {
            ChatError::Unauthenticated => "未登录或登录已过期",
            ChatError::Malformed => "消息必须且只能指定接收者或群组之一",
            ChatError::ReceiverNotFound => "接收者不存在",
            ChatError::GroupNotFound => "群组不存在",
            ChatError::NotGroupMember => "您不是该群组成员",
            ChatError::Persistence(_) => "消息保存失败，请稍后重试",
            ChatError::Transport(_) => "网络连接已断开",
        }
    }

    /// Whether the client should keep the message and try again later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ChatError::Persistence(_) | ChatError::Transport(_))
    }
}

/// RFC7807 Problem Details (application/problem+json)
///
/// Canonical error envelope for `/api/*` endpoints so clients can surface
/// meaningful auth and validation errors instead of failing to decode a
/// success response type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    /// A URI reference that identifies the problem type.
    #[serde(rename = "type")]
    pub type_url: String,
    /// A short, human-readable summary of the problem type.
    pub title: String,
    /// HTTP status code.
    pub status: u16,
    /// Human-readable explanation specific to this occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Machine-readable chat error code, when the problem maps to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ProblemDetails {
    fn new(slug: &str, title: &str, status: u16, detail: impl Into<String>) -> Self {
        Self {
            type_url: format!("https://murmur.dev/problems/{}", slug),
            title: title.to_string(),
            status,
            detail: Some(detail.into()),
            code: None,
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new("bad-request", "Bad Request", 400, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new("unauthorized", "Unauthorized", 401, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new("forbidden", "Forbidden", 403, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new("not-found", "Not Found", 404, detail)
    }

    pub fn payload_too_large(detail: impl Into<String>) -> Self {
        Self::new("payload-too-large", "Payload Too Large", 413, detail)
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new("internal-error", "Internal Server Error", 500, detail)
    }

    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new("service-unavailable", "Service Unavailable", 503, detail)
    }
}

impl From<&ChatError> for ProblemDetails {
    fn from(err: &ChatError) -> Self {
        let mut problem = match err {
            ChatError::Unauthenticated => ProblemDetails::unauthorized(err.reason()),
            ChatError::Malformed => ProblemDetails::bad_request(err.reason()),
            ChatError::ReceiverNotFound | ChatError::GroupNotFound => {
                ProblemDetails::not_found(err.reason())
            }
            ChatError::NotGroupMember => ProblemDetails::forbidden(err.reason()),
            ChatError::Persistence(_) | ChatError::Transport(_) => {
                ProblemDetails::service_unavailable(err.reason())
            }
        };
        problem.code = Some(err.code().to_string());
        problem
    }
}

/// Attempt to parse an RFC7807 (or RFC7807-ish) JSON body into a user-facing message.
/// Prefers `detail`, falls back to `title`.
pub fn try_problem_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ProblemDetails>(body).ok()?;
    if let Some(detail) = parsed.detail {
        if !detail.trim().is_empty() {
            return Some(detail);
        }
    }
    if !parsed.title.trim().is_empty() {
        return Some(parsed.title);
    }
    None
}

/// API error type for client-side use
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl ApiError {
    /// Network failures and server-side (5xx) failures may succeed on retry;
    /// client errors will not.
    pub fn is_retriable(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Http { status, .. } => *status >= 500,
            ApiError::Deserialize(_) => false,
        }
    }
}

impl From<ApiError> for ChatError {
    fn from(err: ApiError) -> Self {
        match &err {
            ApiError::Network(msg) => ChatError::Transport(msg.clone()),
            ApiError::Http { status: 401, .. } => ChatError::Unauthenticated,
            ApiError::Http { body, .. } => {
                ChatError::Persistence(try_problem_detail(body).unwrap_or_else(|| err.to_string()))
            }
            ApiError::Deserialize(msg) => ChatError::Persistence(msg.clone()),
        }
    }
}
