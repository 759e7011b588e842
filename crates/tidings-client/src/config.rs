//! Client configuration loaded from environment variables.
//!
//! All settings have defaults so the client can start against a local
//! backend with only a user id and token.

use std::time::Duration;

use tidings_net::{ConnectionConfig, ReconnectPolicy};
use tidings_shared::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_PAGE_SIZE, DEFAULT_RECONNECT_BASE_MS,
    DEFAULT_RECONNECT_MAX_MS, DEFAULT_SEND_TIMEOUT_MS, DEFAULT_TYPING_TTL_MS,
};
use tidings_shared::types::UserId;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the real-time session.
    /// Env: `TIDINGS_WS_URL`
    /// Default: `ws://127.0.0.1:8080/ws`
    pub ws_url: String,

    /// Base URL of the REST API.
    /// Env: `TIDINGS_API_URL`
    /// Default: `http://127.0.0.1:8080/api`
    pub api_url: String,

    /// Id of the signed-in user.
    /// Env: `TIDINGS_USER_ID`
    pub user_id: Option<UserId>,

    /// Bearer token presented on the handshake and REST calls.
    /// Env: `TIDINGS_TOKEN`
    pub token: Option<String>,

    /// Env: `TIDINGS_RECONNECT_BASE_MS`, `TIDINGS_RECONNECT_MAX_MS`,
    /// `TIDINGS_MAX_RECONNECT_ATTEMPTS`
    pub reconnect: ReconnectPolicy,

    /// How long a send may stay PENDING before it is failed.
    /// Env: `TIDINGS_SEND_TIMEOUT_MS`
    pub send_timeout: Duration,

    /// Lifetime of a received typing indicator.
    /// Env: `TIDINGS_TYPING_TTL_MS`
    pub typing_ttl: Duration,

    /// History page size.
    /// Env: `TIDINGS_PAGE_SIZE`
    pub page_size: u32,

    /// Env: `TIDINGS_HEARTBEAT_INTERVAL_MS`
    pub heartbeat_interval: Duration,

    /// Env: `TIDINGS_HEARTBEAT_TIMEOUT_MS`
    pub heartbeat_timeout: Duration,

    /// Env: `TIDINGS_HANDSHAKE_TIMEOUT_MS`
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8080/ws".to_string(),
            api_url: "http://127.0.0.1:8080/api".to_string(),
            user_id: None,
            token: None,
            reconnect: ReconnectPolicy {
                base_delay_ms: DEFAULT_RECONNECT_BASE_MS,
                max_delay_ms: DEFAULT_RECONNECT_MAX_MS,
                max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            },
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            typing_ttl: Duration::from_millis(DEFAULT_TYPING_TTL_MS),
            page_size: DEFAULT_PAGE_SIZE,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("TIDINGS_WS_URL") {
            config.ws_url = url;
        }

        if let Some(url) = lookup("TIDINGS_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }

        if let Some(id) = parse(&lookup, "TIDINGS_USER_ID") {
            config.user_id = Some(UserId(id));
        }

        if let Some(token) = lookup("TIDINGS_TOKEN") {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }

        // -- Reconnect policy --

        if let Some(ms) = parse(&lookup, "TIDINGS_RECONNECT_BASE_MS") {
            config.reconnect.base_delay_ms = ms;
        }
        if let Some(ms) = parse(&lookup, "TIDINGS_RECONNECT_MAX_MS") {
            config.reconnect.max_delay_ms = ms;
        }
        if let Some(n) = parse(&lookup, "TIDINGS_MAX_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts = n;
        }

        // -- Timers --

        if let Some(ms) = parse(&lookup, "TIDINGS_SEND_TIMEOUT_MS") {
            config.send_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "TIDINGS_TYPING_TTL_MS") {
            config.typing_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "TIDINGS_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "TIDINGS_HEARTBEAT_TIMEOUT_MS") {
            config.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "TIDINGS_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = Duration::from_millis(ms);
        }

        if let Some(size) = parse::<u32, _>(&lookup, "TIDINGS_PAGE_SIZE") {
            if size > 0 {
                config.page_size = size;
            } else {
                tracing::warn!("TIDINGS_PAGE_SIZE must be positive, using default");
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// Settings for the connection task.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect: self.reconnect,
            handshake_timeout: self.handshake_timeout,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
