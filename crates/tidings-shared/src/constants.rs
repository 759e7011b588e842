use crate::types::UserId;

/// Application name
pub const APP_NAME: &str = "Tidings";

/// Prefix of every outbound application destination
pub const DESTINATION_PREFIX: &str = "/app";

/// Sender id stamped on system messages
pub const SYSTEM_SENDER: UserId = UserId(0);

/// Body of a recalled message
pub const RECALL_TOMBSTONE: &str = "[message recalled]";

/// Reconnect backoff base delay in milliseconds
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;

/// Reconnect backoff ceiling in milliseconds
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Reconnect attempts before the connection is declared failed
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// How long a send may stay pending before it is failed
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 10_000;

/// Lifetime of a received typing indicator
pub const DEFAULT_TYPING_TTL_MS: u64 = 5_000;

/// History page size
pub const DEFAULT_PAGE_SIZE: u32 = 30;

/// Keep-alive ping interval
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// Silence on the socket longer than this counts as a close
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

/// Time allowed for the server to accept the handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Maximum inbound frame size in bytes (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1 << 20;
