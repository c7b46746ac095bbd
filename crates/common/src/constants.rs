/// Size of one streamed body chunk in either direction (4 KiB)
pub const BODY_CHUNK_SIZE: usize = 4 * 1024;

/// Default deadline for a tunneled request at the ingress (30 minutes)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30 * 60;

/// Capacity of the per-session outbound message channel
pub const SESSION_CHANNEL_CAPACITY: usize = 100;

/// Default bound on the number of entries kept in the in-memory request log
pub const DEFAULT_LOG_MAX_ENTRIES: usize = 1000;

/// Default bound on the estimated byte size of the in-memory request log (16 MiB)
pub const DEFAULT_LOG_MAX_SIZE: usize = 16 * 1024 * 1024;

/// Agent connect timeout when dialing the tunnel server (10 seconds)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Minimum delay for exponential backoff reconnection (1 second)
pub const RECONNECT_MIN_DELAY_MS: u64 = 1000;

/// Maximum delay for exponential backoff reconnection (60 seconds)
pub const RECONNECT_MAX_DELAY_MS: u64 = 60000;

/// Multiplier for exponential backoff reconnection
pub const RECONNECT_MULTIPLIER: f64 = 2.0;

/// Interval between WebSocket keepalive pings from the agent (5 minutes)
pub const HEARTBEAT_INTERVAL_SECS: u64 = 300;
