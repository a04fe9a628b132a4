//! Server configuration from environment variables.

use std::net::SocketAddr;

/// Which store backs the message and directory services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Persistent Aurora database at the given path.
    Aurora { path: String },
    /// Process-local store, lost on restart. Useful for development.
    Memory,
}

impl StorageBackend {
    /// Parse the storage backend from environment variables.
    ///
    /// Environment variables:
    /// - `MURMUR_STORAGE`: "aurora" | "memory" (default: "aurora")
    /// - `MURMUR_DB_PATH`: Database directory for aurora (default: "murmur_db_data")
    pub fn from_env() -> Self {
        let mode = std::env::var("MURMUR_STORAGE")
            .unwrap_or_else(|_| "aurora".to_string())
            .to_lowercase();

        match mode.as_str() {
            "memory" => StorageBackend::Memory,
            _ => {
                let path = std::env::var("MURMUR_DB_PATH").unwrap_or_else(|_| "murmur_db_data".to_string());
                StorageBackend::Aurora { path }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub storage: StorageBackend,
    /// Maximum clock skew accepted on signed requests.
    pub signature_window_secs: i64,
    /// Upper bound on the history page size a client may request.
    pub history_limit_max: usize,
    /// Largest request body accepted on `/api/*`.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            storage: StorageBackend::Aurora {
                path: "murmur_db_data".to_string(),
            },
            signature_window_secs: 300,
            history_limit_max: 200,
            max_body_bytes: 256 * 1024,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

impl ServerConfig {
    /// Environment variables:
    /// - `MURMUR_BIND_ADDR` (default: "0.0.0.0:8080")
    /// - `MURMUR_SIGNATURE_WINDOW_SECS` (default: 300)
    /// - `MURMUR_HISTORY_LIMIT_MAX` (default: 200)
    /// - `MURMUR_MAX_BODY_BYTES` (default: 262144)
    /// - plus those read by [`StorageBackend::from_env`]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("MURMUR_BIND_ADDR").unwrap_or(defaults.bind_addr),
            storage: StorageBackend::from_env(),
            signature_window_secs: env_parse("MURMUR_SIGNATURE_WINDOW_SECS")
                .unwrap_or(defaults.signature_window_secs),
            history_limit_max: env_parse("MURMUR_HISTORY_LIMIT_MAX").unwrap_or(defaults.history_limit_max),
            max_body_bytes: env_parse("MURMUR_MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
        }
    }

    pub fn memory() -> Self {
        Self {
            storage: StorageBackend::Memory,
            ..Self::default()
        }
    }
}
