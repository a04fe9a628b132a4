#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use murmur_client::ws::CommandSink;
use murmur_client::MessageApi;
use murmur_shared::{
    ApiError, ChatError, ChatMessage, ChatTarget, ClientCommand, CreateMessageRequest, HistoryPage, MarkReadResponse,
    PersistedMessage, UnreadCount,
};

/// Message API double that can be switched offline and told to reject
/// specific client ids.
pub struct ScriptedApi {
    pub user_id: String,
    pub online: AtomicBool,
    pub rejected_client_ids: Mutex<HashSet<String>>,
    pub stored: Mutex<Vec<PersistedMessage>>,
    pub unread: Mutex<Vec<(ChatTarget, u64)>>,
    pub mark_read_calls: AtomicUsize,
    /// Ids this user may mark read; anything else is reported unchanged.
    pub received_ids: Mutex<HashSet<String>>,
}

impl ScriptedApi {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            online: AtomicBool::new(true),
            rejected_client_ids: Mutex::new(HashSet::new()),
            stored: Mutex::new(Vec::new()),
            unread: Mutex::new(Vec::new()),
            mark_read_calls: AtomicUsize::new(0),
            received_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn reject(&self, client_id: &str) {
        self.rejected_client_ids.lock().unwrap().insert(client_id.to_string());
    }

    pub fn stored_count(&self) -> usize {
        self.stored.lock().unwrap().len()
    }

    fn check_online(&self) -> Result<(), ApiError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ApiError::Network("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl MessageApi for ScriptedApi {
    async fn create_message(&self, request: &CreateMessageRequest) -> Result<PersistedMessage, ApiError> {
        self.check_online()?;
        if let Some(client_id) = &request.client_id {
            if self.rejected_client_ids.lock().unwrap().contains(client_id) {
                return Err(ApiError::Http {
                    status: 503,
                    body: "store unavailable".to_string(),
                });
            }
        }

        let mut stored = self.stored.lock().unwrap();
        if let Some(existing) = stored
            .iter()
            .find(|m| request.client_id.is_some() && m.message.client_id == request.client_id)
        {
            return Ok(existing.clone());
        }
        let persisted = PersistedMessage {
            id: format!("m{}", stored.len() + 1),
            message: ChatMessage {
                content: request.content.clone(),
                sender_id: self.user_id.clone(),
                receiver_id: request.receiver_id.clone(),
                group_id: request.group_id.clone(),
                sent_at: Utc::now(),
                client_id: request.client_id.clone(),
            },
            sender_name: None,
            sender_avatar: None,
            read_status: false,
            is_deleted: false,
        };
        stored.push(persisted.clone());
        Ok(persisted)
    }

    async fn history(&self, chat: &ChatTarget, limit: usize, skip: usize) -> Result<HistoryPage, ApiError> {
        self.check_online()?;
        let stored = self.stored.lock().unwrap();
        let items: Vec<PersistedMessage> = stored
            .iter()
            .filter(|m| m.message.chat_for(&self.user_id).ok().as_ref() == Some(chat))
            .cloned()
            .collect();
        let end = items.len().saturating_sub(skip);
        let start = end.saturating_sub(limit);
        Ok(HistoryPage {
            chat_id: chat.clone(),
            items: items[start..end].to_vec(),
        })
    }

    async fn mark_read(&self, message_id: &str) -> Result<MarkReadResponse, ApiError> {
        self.check_online()?;
        let updated = u64::from(self.received_ids.lock().unwrap().remove(message_id));
        Ok(MarkReadResponse { updated })
    }

    async fn mark_conversation_read(&self, _chat: &ChatTarget) -> Result<MarkReadResponse, ApiError> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(MarkReadResponse { updated: 0 })
    }

    async fn unread_count(&self, chat: &ChatTarget) -> Result<UnreadCount, ApiError> {
        self.check_online()?;
        self.unread
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c == chat)
            .map(|(_, count)| UnreadCount { count: *count })
            .ok_or(ApiError::Http {
                status: 404,
                body: String::new(),
            })
    }
}

/// Command sink that records what it was asked to send.
#[derive(Default)]
pub struct RecordingSink {
    pub connected: AtomicBool,
    pub sent: Mutex<Vec<ClientCommand>>,
}

impl RecordingSink {
    pub fn connected() -> Self {
        let sink = Self::default();
        sink.connected.store(true, Ordering::SeqCst);
        sink
    }
}

impl CommandSink for RecordingSink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, command: ClientCommand) -> Result<(), ChatError> {
        if !self.is_connected() {
            return Err(ChatError::Transport("not connected".to_string()));
        }
        self.sent.lock().unwrap().push(command);
        Ok(())
    }
}
