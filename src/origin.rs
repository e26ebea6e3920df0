//! Upgrade request validation
//!
//! Browser-facing checks applied before the WebSocket upgrade is accepted:
//!
//! - `Origin` must be present and same-origin with the request `Host`
//!   (loopback-to-loopback is also accepted for desktop use).
//! - When an allowlist is configured, the request `Host` must be on it,
//!   defeating DNS rebinding: an attacker-controlled name that re-resolves
//!   to us still arrives with the attacker's `Host` header.
//! - The client IP used for rate limiting only honors forwarded-IP headers
//!   when the socket peer is a configured trusted proxy.

use std::net::{IpAddr, SocketAddr};

use axum::http::header::{HOST, ORIGIN};
use axum::http::HeaderMap;
use tracing::warn;
use url::Url;

/// Validates upgrade requests and extracts client IPs.
pub struct OriginGuard {
    allowed_hosts: Vec<String>,
    trusted_proxies: Vec<ProxyMatcher>,
}

/// One entry of the trusted-proxy set.
enum ProxyMatcher {
    Exact(IpAddr),
    Cidr { net: IpAddr, prefix: u8 },
}

impl ProxyMatcher {
    fn parse(entry: &str) -> Option<Self> {
        if let Some((addr, prefix)) = entry.split_once('/') {
            let net: IpAddr = addr.trim().parse().ok()?;
            let prefix: u8 = prefix.trim().parse().ok()?;
            let max = match net {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return None;
            }
            Some(ProxyMatcher::Cidr { net, prefix })
        } else {
            entry.trim().parse().ok().map(ProxyMatcher::Exact)
        }
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            ProxyMatcher::Exact(addr) => *addr == ip,
            ProxyMatcher::Cidr { net, prefix } => match (net, ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = if *prefix == 0 {
                        0
                    } else {
                        u32::MAX << (32 - prefix)
                    };
                    u32::from(*net) & mask == u32::from(ip) & mask
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = if *prefix == 0 {
                        0
                    } else {
                        u128::MAX << (128 - prefix)
                    };
                    u128::from(*net) & mask == u128::from(ip) & mask
                }
                _ => false,
            },
        }
    }
}

impl OriginGuard {
    /// Build a guard from the configured allowlist and trusted-proxy set.
    ///
    /// Unparseable trusted-proxy entries are logged and skipped.
    pub fn new(allowed_hosts: Vec<String>, trusted_proxies: &[String]) -> Self {
        let trusted_proxies = trusted_proxies
            .iter()
            .filter_map(|entry| {
                let matcher = ProxyMatcher::parse(entry);
                if matcher.is_none() {
                    warn!(entry = %entry, "Ignoring unparseable trusted proxy entry");
                }
                matcher
            })
            .collect();

        Self {
            allowed_hosts,
            trusted_proxies,
        }
    }

    /// Validate the `Origin` and `Host` headers of an upgrade request.
    ///
    /// Rules, in order: a missing or unparseable `Origin` rejects; a `Host`
    /// outside the allowlist rejects (loopback always allowed, empty
    /// allowlist is permissive); same-origin accepts; loopback-to-loopback
    /// accepts; anything else rejects.
    pub fn check_origin(&self, headers: &HeaderMap) -> bool {
        let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
        let Some(origin) = origin.filter(|o| !o.is_empty()) else {
            // Non-browser clients can omit Origin at will; allowing them
            // through would reduce the same-origin check to advisory.
            warn!("Rejected WebSocket connection: missing Origin header");
            return false;
        };

        let Ok(origin_url) = Url::parse(origin) else {
            warn!(origin = %origin, "Rejected WebSocket connection: unparseable Origin");
            return false;
        };
        // host_str keeps IPv6 brackets; strip_port also removes those
        let origin_host = origin_url.host_str().map(strip_port).unwrap_or("");

        let request_host = headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(strip_port)
            .unwrap_or("");

        if !self.is_allowed_host(request_host) {
            warn!(
                host = %request_host,
                "Rejected WebSocket connection: Host not in allowed hosts list"
            );
            return false;
        }

        if origin_host.eq_ignore_ascii_case(request_host) {
            return true;
        }

        if is_loopback_host(origin_host) && is_loopback_host(request_host) {
            return true;
        }

        warn!(origin = %origin, host = %request_host, "Rejected WebSocket origin");
        false
    }

    /// Check the request `Host` against the allowlist.
    ///
    /// Loopback hosts are always allowed. An empty allowlist allows any
    /// host, keeping deployments without explicit configuration working;
    /// the origin comparison still applies.
    fn is_allowed_host(&self, host: &str) -> bool {
        if is_loopback_host(host) {
            return true;
        }

        if self.allowed_hosts.is_empty() {
            return true;
        }

        self.allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host))
    }

    /// Extract the client IP for rate-limiting purposes.
    ///
    /// Forwarded headers (`X-Forwarded-For` first entry, then `X-Real-IP`)
    /// are only honored when the socket peer is a trusted proxy; otherwise
    /// the peer address is the client.
    pub fn client_ip(&self, headers: &HeaderMap, remote: SocketAddr) -> String {
        if !self.is_trusted_proxy(remote.ip()) {
            return remote.ip().to_string();
        }

        if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            let first = xff.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }

        if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            let trimmed = xri.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }

        remote.ip().to_string()
    }

    /// Whether `ip` belongs to the configured trusted-proxy set.
    pub fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        self.trusted_proxies
            .iter()
            .any(|matcher| matcher.matches(ip))
    }
}

/// Strip a port suffix from a `Host` header value.
///
/// Handles bracketed IPv6 (`[::1]:8080`), hostname/IPv4 with port, and
/// bare IPv6 (more than one colon, no brackets) which is returned as-is.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }

    if host.matches(':').count() > 1 {
        return host;
    }

    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

/// Whether a host string names a loopback address.
///
/// Accepts `localhost`, the IPv4 loopback range `127.0.0.0/8`, IPv6 `::1`,
/// and the IPv4-mapped form `::ffff:127.x.x.x`. `0.0.0.0` is not loopback,
/// and neither is `localhost.localdomain`.
pub fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    let Ok(ip) = host.parse::<IpAddr>() else {
        return false;
    };

    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                v4.is_loopback()
            } else {
                v6.is_loopback()
            }
        }
    }
}
