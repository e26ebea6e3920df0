//! Message rate limiting
//!
//! Two keyed registries of token buckets: one per client connection and one
//! per client IP. Every envelope read from a client consumes a token from
//! both; the IP registry stops a client from escaping the per-connection
//! limit by opening more sockets. Connection entries live exactly as long
//! as their connection; IP entries are evicted by a background sweep once
//! idle past the stale TTL.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::config::MultiplexerConfig;

/// A token bucket limiter.
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-IP limiter entry, tracking when the IP was last active.
struct IpEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Keyed registries of per-connection and per-IP token buckets.
pub struct RateLimiterRegistry {
    messages_per_second: f64,
    burst_size: f64,
    ip_messages_per_second: f64,
    ip_burst_size: f64,
    stale_entry_ttl: Duration,
    connections: DashMap<u64, Mutex<TokenBucket>>,
    ips: DashMap<String, Mutex<IpEntry>>,
}

impl RateLimiterRegistry {
    /// Build a registry with the limits from `config`.
    pub fn new(config: &MultiplexerConfig) -> Self {
        Self {
            messages_per_second: config.messages_per_second,
            burst_size: config.burst_size,
            ip_messages_per_second: config.ip_messages_per_second,
            ip_burst_size: config.ip_burst_size,
            stale_entry_ttl: config.stale_entry_ttl,
            connections: DashMap::new(),
            ips: DashMap::new(),
        }
    }

    /// Consume one token from the limiter for `connection_id`, creating the
    /// limiter on first use.
    pub fn allow_connection(&self, connection_id: u64) -> bool {
        let entry = self
            .connections
            .entry(connection_id)
            .or_insert_with(|| Mutex::new(TokenBucket::new(self.burst_size)));

        let allowed = entry
            .lock()
            .expect("rate limiter mutex poisoned")
            .try_acquire(self.burst_size, self.messages_per_second);
        allowed
    }

    /// Consume one token from the limiter for `ip`, creating the limiter on
    /// first use and refreshing its idle timestamp.
    pub fn allow_ip(&self, ip: &str) -> bool {
        let entry = self.ips.entry(ip.to_string()).or_insert_with(|| {
            Mutex::new(IpEntry {
                bucket: TokenBucket::new(self.ip_burst_size),
                last_seen: Instant::now(),
            })
        });

        let mut entry = entry.lock().expect("rate limiter mutex poisoned");
        entry.last_seen = Instant::now();
        entry
            .bucket
            .try_acquire(self.ip_burst_size, self.ip_messages_per_second)
    }

    /// Drop the limiter for a connection that has closed.
    pub fn release_connection(&self, connection_id: u64) {
        self.connections.remove(&connection_id);
    }

    /// Evict IP entries idle longer than the stale TTL.
    pub fn sweep_stale(&self, now: Instant) {
        let ttl = self.stale_entry_ttl;
        let before = self.ips.len();
        self.ips.retain(|_, entry| {
            let entry = entry.lock().expect("rate limiter mutex poisoned");
            now.duration_since(entry.last_seen) <= ttl
        });

        let evicted = before - self.ips.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.ips.len(), "Swept stale IP rate limiters");
        }
    }

    /// Number of live per-IP entries.
    pub fn ip_entry_count(&self) -> usize {
        self.ips.len()
    }

    /// Number of live per-connection entries.
    pub fn connection_entry_count(&self) -> usize {
        self.connections.len()
    }
}

/// Periodically sweep stale IP entries until the registry is dropped.
pub fn spawn_sweeper(
    registry: &Arc<RateLimiterRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let registry = Arc::downgrade(registry);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.sweep_stale(Instant::now());
        }
    })
}

/// Tracks consecutive rate-limit violations for one client connection and
/// derives the backoff to apply after each.
pub struct ViolationTracker {
    violations: u32,
    backoff: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    max_violations: u32,
}

/// Outcome of recording one violation.
pub struct Violation {
    /// Delay to apply before reading the next message.
    pub delay: Duration,
    /// The violation cap was reached; close the connection without delay.
    pub should_close: bool,
    /// Consecutive violation count, for logging.
    pub violations: u32,
}

impl ViolationTracker {
    /// Build a tracker with the backoff parameters from `config`.
    pub fn new(config: &MultiplexerConfig) -> Self {
        Self {
            violations: 0,
            backoff: config.initial_backoff_delay,
            initial_backoff: config.initial_backoff_delay,
            max_backoff: config.max_backoff_delay,
            max_violations: config.max_rate_limit_violations,
        }
    }

    /// Record one violation. The returned delay is the current backoff; the
    /// backoff for the next violation doubles, clamped to the maximum.
    pub fn record(&mut self) -> Violation {
        self.violations += 1;
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.max_backoff);

        Violation {
            delay,
            should_close: self.violations >= self.max_violations,
            violations: self.violations,
        }
    }

    /// Reset after a successful token acquisition.
    pub fn reset(&mut self) {
        self.violations = 0;
        self.backoff = self.initial_backoff;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_refill_config() -> MultiplexerConfig {
        MultiplexerConfig {
            messages_per_second: 0.0,
            burst_size: 3.0,
            ip_messages_per_second: 0.0,
            ip_burst_size: 5.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_bucket_burst_then_deny() {
        let mut bucket = TokenBucket::new(2.0);
        assert!(bucket.try_acquire(2.0, 0.0));
        assert!(bucket.try_acquire(2.0, 0.0));
        assert!(!bucket.try_acquire(2.0, 0.0));
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1.0);
        assert!(bucket.try_acquire(1.0, 1000.0));
        std::thread::sleep(Duration::from_millis(20));
        // 1000 tokens/s for 20ms is far more than one token
        assert!(bucket.try_acquire(1.0, 1000.0));
    }

    #[test]
    fn test_bucket_refill_clamped_to_capacity() {
        let mut bucket = TokenBucket::new(2.0);
        std::thread::sleep(Duration::from_millis(10));
        assert!(bucket.try_acquire(2.0, 100_000.0));
        assert!(bucket.try_acquire(2.0, 0.0));
        assert!(!bucket.try_acquire(2.0, 0.0));
    }

    #[test]
    fn test_connection_limiter_lifecycle() {
        let registry = RateLimiterRegistry::new(&no_refill_config());

        for _ in 0..3 {
            assert!(registry.allow_connection(7));
        }
        assert!(!registry.allow_connection(7));
        assert_eq!(registry.connection_entry_count(), 1);

        // A different connection has its own bucket
        assert!(registry.allow_connection(8));

        registry.release_connection(7);
        registry.release_connection(8);
        assert_eq!(registry.connection_entry_count(), 0);

        // Re-registering starts with a fresh burst
        assert!(registry.allow_connection(7));
    }

    #[test]
    fn test_ip_limiter_shared_across_connections() {
        let registry = RateLimiterRegistry::new(&no_refill_config());

        for _ in 0..5 {
            assert!(registry.allow_ip("192.168.1.100"));
        }
        assert!(!registry.allow_ip("192.168.1.100"));
        assert!(registry.allow_ip("192.168.1.101"));
    }

    #[test]
    fn test_sweep_evicts_only_stale_entries() {
        let config = MultiplexerConfig {
            stale_entry_ttl: Duration::from_secs(600),
            ..no_refill_config()
        };
        let registry = RateLimiterRegistry::new(&config);

        registry.allow_ip("10.0.0.1");
        registry.allow_ip("10.0.0.2");
        assert_eq!(registry.ip_entry_count(), 2);

        // Nothing is stale yet
        registry.sweep_stale(Instant::now());
        assert_eq!(registry.ip_entry_count(), 2);

        // Both entries fall out once idle past the TTL
        registry.sweep_stale(Instant::now() + Duration::from_secs(601));
        assert_eq!(registry.ip_entry_count(), 0);
    }

    #[test]
    fn test_access_refreshes_last_seen() {
        let config = MultiplexerConfig {
            stale_entry_ttl: Duration::from_secs(600),
            ..no_refill_config()
        };
        let registry = RateLimiterRegistry::new(&config);

        registry.allow_ip("10.0.0.1");
        std::thread::sleep(Duration::from_millis(5));
        registry.allow_ip("10.0.0.1");

        // A sweep anchored just before the TTL boundary of the *first*
        // access keeps the refreshed entry alive
        registry.sweep_stale(Instant::now() + Duration::from_secs(600) - Duration::from_millis(2));
        assert_eq!(registry.ip_entry_count(), 1);
    }

    #[test]
    fn test_violation_backoff_doubles_and_clamps() {
        let mut tracker = ViolationTracker::new(&MultiplexerConfig::default());

        let expected_ms = [100, 200, 400, 800, 1600, 3200, 5000, 5000, 5000];
        for (i, expected) in expected_ms.iter().enumerate() {
            let violation = tracker.record();
            assert_eq!(violation.delay, Duration::from_millis(*expected));
            assert_eq!(violation.violations as usize, i + 1);
            assert!(!violation.should_close);
        }

        let tenth = tracker.record();
        assert!(tenth.should_close);
        assert_eq!(tenth.violations, 10);
    }

    #[test]
    fn test_violation_reset() {
        let mut tracker = ViolationTracker::new(&MultiplexerConfig::default());
        tracker.record();
        tracker.record();
        tracker.reset();

        let violation = tracker.record();
        assert_eq!(violation.delay, Duration::from_millis(100));
        assert_eq!(violation.violations, 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_registry_dropped() {
        let registry = Arc::new(RateLimiterRegistry::new(&no_refill_config()));
        let handle = spawn_sweeper(&registry, Duration::from_millis(5));

        drop(registry);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should exit after registry drop")
            .unwrap();
    }
}
