//! Typed publish/subscribe for server events.
//!
//! Handlers registered for one event kind fire in registration order. Nothing
//! is promised about ordering across kinds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use murmur_shared::{ServerEvent, ServerEventKind, WsEnvelope};

/// Returned by [`EventBus::on`]; pass it to [`EventBus::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&WsEnvelope<ServerEvent>) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<ServerEventKind, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: ServerEventKind, handler: F) -> HandlerId
    where
        F: Fn(&WsEnvelope<ServerEvent>) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns `false` if `id` was not registered for `kind`.
    pub fn off(&self, kind: ServerEventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        before != list.len()
    }

    /// Call every handler registered for the event's kind. Returns how many
    /// ran.
    pub fn emit(&self, envelope: &WsEnvelope<ServerEvent>) -> usize {
        // Handlers run outside the lock so they may call on/off themselves.
        let handlers: Vec<Handler> = {
            let map = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            map.get(&envelope.payload.kind())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in &handlers {
            handler(envelope);
        }
        handlers.len()
    }
}
