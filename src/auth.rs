//! Per-cluster bearer token extraction
//!
//! Cluster tokens are delivered in HTTP-only cookies named
//! `headlamp-auth-<cluster>`, one per cluster. The cluster portion of the
//! cookie name is sanitized so arbitrary cluster IDs cannot smuggle cookie
//! syntax. The multiplexer reads tokens through the [`AuthProvider`] trait
//! so tests can inject arbitrary token sequences.

use std::collections::HashMap;

use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Prefix for per-cluster authentication cookies.
pub const AUTH_COOKIE_PREFIX: &str = "headlamp-auth-";

/// Maximum length of the sanitized cluster portion of a cookie name.
const MAX_COOKIE_CLUSTER_LEN: usize = 50;

/// Make a cluster name safe for use in a cookie name.
///
/// Keeps only ASCII alphanumerics, hyphens, and underscores, and truncates
/// the result to 50 characters.
pub fn sanitize_cluster_name(cluster: &str) -> String {
    cluster
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_COOKIE_CLUSTER_LEN)
        .collect()
}

/// Source of per-cluster bearer tokens for one client session.
#[cfg_attr(test, mockall::automock)]
pub trait AuthProvider: Send + Sync {
    /// Look up the bearer token for a cluster.
    ///
    /// A missing or unreadable token is an error; the session is torn down
    /// by the caller.
    fn bearer_token(&self, cluster_id: &str) -> Result<Zeroizing<String>>;
}

/// [`AuthProvider`] backed by the cookies of the upgrade request.
///
/// The cookie jar is snapshotted once at upgrade time; cookies cannot
/// change for the lifetime of a WebSocket connection.
pub struct CookieAuth {
    cookies: HashMap<String, String>,
}

impl CookieAuth {
    /// Snapshot the cookies carried by the upgrade request headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut cookies = HashMap::new();

        for value in headers.get_all(COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.insert(name.to_string(), value.to_string());
                }
            }
        }

        Self { cookies }
    }
}

impl AuthProvider for CookieAuth {
    fn bearer_token(&self, cluster_id: &str) -> Result<Zeroizing<String>> {
        let sanitized = sanitize_cluster_name(cluster_id);
        if sanitized.is_empty() {
            return Err(Error::Auth(format!("invalid cluster name: {cluster_id}")));
        }

        let name = format!("{AUTH_COOKIE_PREFIX}{sanitized}");
        self.cookies
            .get(&name)
            .map(|token| Zeroizing::new(token.clone()))
            .ok_or_else(|| Error::Auth(format!("no auth cookie for cluster {sanitized}")))
    }
}
