//! Server configuration.
//!
//! Only the listening port and the collaboration path prefix are meant to
//! be set from outside (`PORT`, `WEBSOCKET_PATH`). Everything else has a
//! sane default and is adjusted programmatically, mostly by tests.

use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_PATH_PREFIX: &str = "/collab";
pub const DEFAULT_ROOM: &str = "default";

pub const ENV_PORT: &str = "PORT";
pub const ENV_PATH_PREFIX: &str = "WEBSOCKET_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid port")]
    InvalidPort { var: &'static str, value: String },
    #[error("path prefix {0:?} must start with '/'")]
    InvalidPrefix(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Upgrade requests must target `{path_prefix}/{room}`
    pub path_prefix: String,
    /// Longest accepted room name, in bytes
    pub max_room_name_len: usize,
    /// Maximum live rooms in the registry
    pub max_rooms: usize,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// How long an empty room survives before eviction
    pub eviction_grace_ms: u64,
    /// Deadline for the peer's state vector after connect
    pub handshake_timeout_ms: u64,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Deadline for the HTTP request line before upgrade
    pub request_head_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            max_room_name_len: 128,
            max_rooms: 1024,
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            eviction_grace_ms: 30_000,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_secs: 30,
            request_head_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PORT` and `WEBSOCKET_PATH`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_PORT) {
            let port: u16 = raw.trim().parse().map_err(|_| ConfigError::InvalidPort {
                var: ENV_PORT,
                value: raw.clone(),
            })?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }

        if let Some(prefix) = lookup(ENV_PATH_PREFIX) {
            config.path_prefix = prefix;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path_prefix.starts_with('/') {
            return Err(ConfigError::InvalidPrefix(self.path_prefix.clone()));
        }
        let limits = [
            ("max_room_name_len", self.max_room_name_len),
            ("max_rooms", self.max_rooms),
            ("max_peers_per_room", self.max_peers_per_room),
            ("broadcast_capacity", self.broadcast_capacity),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Zero("heartbeat_interval_secs"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Zero("handshake_timeout_ms"));
        }
        if self.request_head_timeout_ms == 0 {
            return Err(ConfigError::Zero("request_head_timeout_ms"));
        }
        Ok(())
    }

    /// Prefix without a trailing slash, as used for matching.
    pub fn normalized_prefix(&self) -> &str {
        let trimmed = self.path_prefix.trim_end_matches('/');
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn request_head_timeout(&self) -> Duration {
        Duration::from_millis(self.request_head_timeout_ms)
    }
}
