//! Application state shared across request handlers.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::gateway::Gateway;
use crate::registry::SessionRegistry;
use crate::services::Services;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(services: Services, config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self {
            gateway: Arc::new(Gateway::new(registry, services)),
            config: Arc::new(config),
        }
    }
}
