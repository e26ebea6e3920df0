//! Multiplexer configuration
//!
//! All tunables are collected in an immutable [`MultiplexerConfig`] value
//! threaded through constructors. The defaults match the limits the
//! production deployment runs with; tests override individual fields.

use std::time::Duration;

/// Interval between liveness pings on each upstream connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for the upstream WebSocket handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);

/// Maximum client message size (10 MiB). Larger frames drop the connection.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Sustained message rate allowed per client connection.
pub const MESSAGES_PER_SECOND: f64 = 50.0;

/// Burst allowance per client connection.
pub const BURST_SIZE: f64 = 100.0;

/// Sustained message rate allowed per client IP, across all of its
/// connections. Prevents bypassing the per-connection limit by opening
/// many sockets.
pub const IP_MESSAGES_PER_SECOND: f64 = 200.0;

/// Burst allowance per client IP.
pub const IP_BURST_SIZE: f64 = 400.0;

/// Consecutive rate-limit violations tolerated before the client
/// connection is closed.
pub const MAX_RATE_LIMIT_VIOLATIONS: u32 = 10;

/// Delay applied after the first rate-limit violation; doubles on each
/// further consecutive violation.
pub const INITIAL_BACKOFF_DELAY: Duration = Duration::from_millis(100);

/// Upper bound for the violation backoff delay.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(5);

/// How often the per-IP limiter registry is swept for stale entries.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Idle time after which a per-IP limiter entry is evicted.
pub const STALE_ENTRY_TTL: Duration = Duration::from_secs(10 * 60);

/// Configuration for a [`Multiplexer`](crate::mux::Multiplexer) instance.
#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    /// Allowed `Host` header values for DNS-rebinding protection.
    /// Loopback hosts are always allowed; an empty list allows any host
    /// that passes the origin checks.
    pub allowed_hosts: Vec<String>,
    /// Proxies (exact IP or CIDR) whose forwarded-IP headers are honored.
    /// Requests from other peers use the socket address as the client IP.
    pub trusted_proxies: Vec<String>,
    /// Interval between upstream liveness pings.
    pub heartbeat_interval: Duration,
    /// Upstream WebSocket handshake timeout.
    pub handshake_timeout: Duration,
    /// Maximum client frame size in bytes.
    pub max_message_size: usize,
    /// Sustained per-connection message rate.
    pub messages_per_second: f64,
    /// Per-connection burst allowance.
    pub burst_size: f64,
    /// Sustained per-IP message rate.
    pub ip_messages_per_second: f64,
    /// Per-IP burst allowance.
    pub ip_burst_size: f64,
    /// Consecutive violations before the connection is closed.
    pub max_rate_limit_violations: u32,
    /// Initial violation backoff delay.
    pub initial_backoff_delay: Duration,
    /// Violation backoff ceiling.
    pub max_backoff_delay: Duration,
    /// Per-IP limiter sweep interval.
    pub cleanup_interval: Duration,
    /// Per-IP limiter idle eviction threshold.
    pub stale_entry_ttl: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            trusted_proxies: Vec::new(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            max_message_size: MAX_MESSAGE_SIZE,
            messages_per_second: MESSAGES_PER_SECOND,
            burst_size: BURST_SIZE,
            ip_messages_per_second: IP_MESSAGES_PER_SECOND,
            ip_burst_size: IP_BURST_SIZE,
            max_rate_limit_violations: MAX_RATE_LIMIT_VIOLATIONS,
            initial_backoff_delay: INITIAL_BACKOFF_DELAY,
            max_backoff_delay: MAX_BACKOFF_DELAY,
            cleanup_interval: CLEANUP_INTERVAL,
            stale_entry_ttl: STALE_ENTRY_TTL,
        }
    }
}
