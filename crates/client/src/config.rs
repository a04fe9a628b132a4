//! Client configuration from environment variables.

use std::path::PathBuf;

use murmur_shared::{Credential, WS_PATH};

use crate::client_keys::to_query_string;
use crate::ws::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL of the chat server, e.g. `http://localhost:8080`.
    pub server_url: String,
    pub reconnect: ReconnectConfig,
    /// Where the key pair and the retry queue are kept.
    pub data_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            reconnect: ReconnectConfig::default(),
            data_dir: dirs::config_dir().map(|dir| dir.join("murmur")),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

impl ClientConfig {
    /// Environment variables:
    /// - `MURMUR_SERVER_URL` (default: "http://localhost:8080")
    /// - `MURMUR_RECONNECT_BASE_MS` (default: 1000)
    /// - `MURMUR_RECONNECT_MAX_ATTEMPTS` (default: 10)
    /// - `MURMUR_DATA_DIR` (default: platform config dir + "/murmur")
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: std::env::var("MURMUR_SERVER_URL").unwrap_or(defaults.server_url),
            reconnect: ReconnectConfig {
                base_delay_ms: env_parse("MURMUR_RECONNECT_BASE_MS").unwrap_or(defaults.reconnect.base_delay_ms),
                max_attempts: env_parse("MURMUR_RECONNECT_MAX_ATTEMPTS")
                    .unwrap_or(defaults.reconnect.max_attempts),
            },
            data_dir: std::env::var("MURMUR_DATA_DIR").ok().map(PathBuf::from).or(defaults.data_dir),
        }
    }

    /// Websocket URL carrying `credential` in the query string.
    pub fn ws_url(&self, credential: &Credential) -> anyhow::Result<String> {
        let mut url = url::Url::parse(&self.server_url)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("cannot use {} as a websocket url", self.server_url))?;
        url.set_path(WS_PATH);
        url.set_query(Some(&to_query_string(credential)));
        Ok(url.to_string())
    }
}
