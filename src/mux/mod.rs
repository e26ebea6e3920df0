//! WebSocket stream multiplexer
//!
//! One client WebSocket carries many upstream streams. The client wraps
//! each message in an [`Envelope`](envelope::Envelope) naming a
//! `(clusterId, path, userId)` tuple; the multiplexer lazily opens one
//! upstream connection per tuple, forwards `REQUEST` payloads to it, and
//! relays upstream frames back inside `DATA`/`COMPLETE` envelopes. Origin
//! validation, per-connection and per-IP rate limits, and cookie-based
//! cluster tokens guard the session.

pub mod envelope;

mod connection;
mod heartbeat;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::Response;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub use self::connection::{ClusterConnection, ConnectionState};

use self::connection::{connection_key, send_status_frame};
use self::envelope::{ConnectionError, Envelope, ErrorMessage, FrameType};

use crate::auth::{AuthProvider, CookieAuth};
use crate::config::MultiplexerConfig;
use crate::contexts::{ContextStore, RestConfig};
use crate::error::{Error, Result};
use crate::limiter::{self, RateLimiterRegistry, ViolationTracker};
use crate::origin::OriginGuard;
use crate::ws::{Dialer, SafeFrameConn, TlsDialer};

/// Multiplexes one client WebSocket onto many upstream cluster streams.
pub struct Multiplexer {
    pub(crate) config: MultiplexerConfig,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) connections: RwLock<HashMap<String, Arc<ClusterConnection>>>,
    contexts: Arc<dyn ContextStore>,
    origin: OriginGuard,
    limiters: Arc<RateLimiterRegistry>,
    next_session_id: AtomicU64,
}

impl Multiplexer {
    /// Create a multiplexer that dials upstreams over TLS.
    pub fn new(contexts: Arc<dyn ContextStore>, config: MultiplexerConfig) -> Arc<Self> {
        let dialer = Arc::new(TlsDialer::new(config.handshake_timeout));
        Self::with_dialer(contexts, dialer, config)
    }

    /// Create a multiplexer with a custom [`Dialer`].
    pub fn with_dialer(
        contexts: Arc<dyn ContextStore>,
        dialer: Arc<dyn Dialer>,
        config: MultiplexerConfig,
    ) -> Arc<Self> {
        let origin = OriginGuard::new(config.allowed_hosts.clone(), &config.trusted_proxies);
        let limiters = Arc::new(RateLimiterRegistry::new(&config));

        Arc::new(Self {
            config,
            contexts,
            dialer,
            origin,
            limiters,
            connections: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Start the background sweep of idle per-IP rate limiters.
    pub fn spawn_ip_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        limiter::spawn_sweeper(&self.limiters, self.config.cleanup_interval)
    }

    /// Validate and upgrade an incoming client WebSocket request.
    pub async fn handle_upgrade(
        self: Arc<Self>,
        ws: WebSocketUpgrade,
        headers: HeaderMap,
        remote: SocketAddr,
    ) -> Result<Response> {
        if !self.origin.check_origin(&headers) {
            return Err(Error::Forbidden("websocket origin rejected".into()));
        }

        let auth: Arc<dyn AuthProvider> = Arc::new(CookieAuth::from_headers(&headers));
        let client_ip = self.origin.client_ip(&headers, remote);

        Ok(ws
            .max_message_size(self.config.max_message_size)
            .on_upgrade(move |socket| {
                let client = Arc::new(SafeFrameConn::from_client(socket));
                self.run_session(client, auth, client_ip)
            }))
    }

    /// Drive one client session: read envelopes, route them to cluster
    /// connections, tear everything down when the client goes away.
    pub(crate) async fn run_session(
        self: Arc<Self>,
        client: Arc<SafeFrameConn>,
        auth: Arc<dyn AuthProvider>,
        client_ip: String,
    ) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let mut violations = ViolationTracker::new(&self.config);

        info!(session = session_id, client_ip = %client_ip, "Client WebSocket session established");

        loop {
            // Both limiters are charged per message; either may deny
            let conn_allowed = self.limiters.allow_connection(session_id);
            let ip_allowed = self.limiters.allow_ip(&client_ip);

            if !conn_allowed || !ip_allowed {
                let kind = if !ip_allowed { "ip" } else { "connection" };
                let violation = violations.record();

                warn!(
                    violations = violation.violations,
                    backoff_ms = violation.delay.as_millis() as u64,
                    kind,
                    client_ip = %client_ip,
                    "Rate limit exceeded for WebSocket session"
                );

                let _ = client.write_json(&ErrorMessage::rate_limit_exceeded()).await;

                if violation.should_close {
                    warn!(
                        violations = violation.violations,
                        client_ip = %client_ip,
                        "Closing WebSocket session after repeated rate limit violations"
                    );
                    break;
                }

                tokio::time::sleep(violation.delay).await;
                continue;
            }

            violations.reset();

            let msg: Envelope = match client.read_json().await {
                Ok(msg) => msg,
                Err(Error::Protocol(e)) => {
                    warn!(session = session_id, error = %e, "Malformed client envelope");
                    let _ = client.write_json(&ErrorMessage::invalid_message()).await;
                    break;
                }
                Err(e) => {
                    debug!(session = session_id, error = %e, "Client read loop ended");
                    break;
                }
            };

            if msg.frame_type == FrameType::Close {
                self.close_connection(&msg.cluster_id, &msg.path, &msg.user_id)
                    .await;
                continue;
            }

            let token = match auth.bearer_token(&msg.cluster_id) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(
                        session = session_id,
                        cluster = %msg.cluster_id,
                        error = %e,
                        "No usable cluster token; dropping session"
                    );
                    break;
                }
            };

            let conn = match self.get_or_create_connection(&msg, &client, token).await {
                Ok(conn) => conn,
                Err(e) => {
                    self.handle_connection_error(&client, &msg, &e).await;
                    continue;
                }
            };

            if msg.frame_type == FrameType::Request
                && conn.state().await == ConnectionState::Connected
            {
                // Errors transition the connection; the heartbeat recovers it
                let _ = conn.write_to_upstream(msg.data.as_bytes()).await;
            }
        }

        self.limiters.release_connection(session_id);
        self.teardown_session(&client).await;
        let _ = client.close().await;

        info!(session = session_id, "Client WebSocket session closed");
    }

    /// Fetch the connection for the message's tuple, dialing a new one if
    /// none exists. An existing connection gets its token refreshed.
    async fn get_or_create_connection(
        self: &Arc<Self>,
        msg: &Envelope,
        client: &Arc<SafeFrameConn>,
        token: Option<Zeroizing<String>>,
    ) -> Result<Arc<ClusterConnection>> {
        let key = connection_key(&msg.cluster_id, &msg.path, &msg.user_id);

        if let Some(existing) = self.connections.read().await.get(&key) {
            existing.update_token(token);
            return Ok(existing.clone());
        }

        self.establish_cluster_connection(msg, client, token).await
    }

    /// Dial the upstream for a new tuple and register the connection.
    async fn establish_cluster_connection(
        self: &Arc<Self>,
        msg: &Envelope,
        client: &Arc<SafeFrameConn>,
        token: Option<Zeroizing<String>>,
    ) -> Result<Arc<ClusterConnection>> {
        let config = self.cluster_config(&msg.cluster_id, &msg.user_id)?;

        let upstream = match self
            .dialer
            .dial(
                &config,
                &msg.path,
                &msg.query,
                token.as_deref().map(String::as_str),
            )
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                let _ = send_status_frame(
                    client,
                    &msg.cluster_id,
                    &msg.path,
                    ConnectionState::Error,
                    &e.to_string(),
                )
                .await;
                return Err(e);
            }
        };

        let conn = ClusterConnection::new(
            msg.cluster_id.clone(),
            msg.user_id.clone(),
            msg.path.clone(),
            msg.query.clone(),
            client.clone(),
            upstream,
            token,
        );

        let key = conn.key();
        {
            let mut registry = self.connections.write().await;
            if let Some(winner) = registry.get(&key) {
                // Another task created this tuple while we were dialing;
                // discard ours and use the winner
                let winner = winner.clone();
                drop(registry);
                conn.mark_closed().await;
                return Ok(winner);
            }
            registry.insert(key, conn.clone());
        }

        conn.update_status(ConnectionState::Connected, None).await;

        tokio::spawn(conn.clone().run_reader());
        tokio::spawn(self.clone().supervise(conn.clone()));

        Ok(conn)
    }

    /// Resolve the REST config for a cluster, falling back to the combined
    /// `clusterId + userId` key used by per-session dynamic clusters.
    pub(crate) fn cluster_config(&self, cluster_id: &str, user_id: &str) -> Result<RestConfig> {
        match self.contexts.rest_config(cluster_id) {
            Ok(config) => Ok(config),
            Err(_) => {
                let combined = format!("{cluster_id}{user_id}");
                self.contexts
                    .rest_config(&combined)
                    .map_err(|_| Error::UnknownCluster(cluster_id.to_string()))
            }
        }
    }

    /// Tear down the connection for one tuple. Unknown tuples and repeated
    /// closes are no-ops.
    pub async fn close_connection(&self, cluster_id: &str, path: &str, user_id: &str) {
        let key = connection_key(cluster_id, path, user_id);

        let conn = { self.connections.write().await.remove(&key) };
        let Some(conn) = conn else {
            return;
        };

        debug!(cluster = %cluster_id, path = %path, "Closing cluster connection");
        conn.mark_closed().await;
    }

    /// Report a failed connection attempt to the client.
    async fn handle_connection_error(
        &self,
        client: &SafeFrameConn,
        msg: &Envelope,
        error: &Error,
    ) {
        warn!(cluster = %msg.cluster_id, error = %error, "establishing cluster connection");

        let report = ConnectionError {
            cluster_id: msg.cluster_id.clone(),
            error: error.to_string(),
        };
        if let Err(e) = client.write_json(&report).await {
            warn!(cluster = %msg.cluster_id, error = %e, "writing error message to client");
        }
    }

    /// Close and deregister every connection belonging to this client.
    async fn teardown_session(&self, client: &Arc<SafeFrameConn>) {
        let removed: Vec<Arc<ClusterConnection>> = {
            let mut registry = self.connections.write().await;
            let keys: Vec<String> = registry
                .iter()
                .filter(|(_, conn)| conn.shares_client(client))
                .map(|(key, _)| key.clone())
                .collect();

            keys.iter().filter_map(|key| registry.remove(key)).collect()
        };

        for conn in removed {
            conn.update_status(ConnectionState::Closed, None).await;
            conn.mark_closed().await;
        }
    }

    /// Number of registered cluster connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

/// axum handler for the multiplexer endpoint.
pub async fn ws_handler(
    State(mux): State<Arc<Multiplexer>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    mux.handle_upgrade(ws, headers, remote).await
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
