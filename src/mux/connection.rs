//! Per-tuple upstream connection
//!
//! A [`ClusterConnection`] owns one WebSocket to one cluster, identified by
//! the `(clusterId, path, userId)` tuple. It moves through
//! `connecting → connected → error → closed`; every transition is surfaced
//! to the client as a `STATUS` frame until the connection is marked closed,
//! after which nothing attributable to it reaches the client again.
//!
//! Connections are immutable after creation: a reconnect builds a
//! replacement and swaps the registry entry, it never re-dials in place.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use super::envelope::{Envelope, FrameType};
use crate::error::{Error, Result};
use crate::ws::{Frame, SafeFrameConn};

/// Lifecycle state of a cluster connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Upstream dial in progress
    Connecting,
    /// Upstream socket established
    Connected,
    /// Upstream failed; a heartbeat-driven reconnect may follow
    Error,
    /// Terminal
    Closed,
}

/// Wire form of one status transition, nested inside a `STATUS` envelope.
#[derive(Debug, Serialize)]
struct StatusPayload<'a> {
    state: ConnectionState,
    error: &'a str,
}

struct StatusInner {
    state: ConnectionState,
    error: String,
    last_msg: Instant,
    closed: bool,
}

/// One upstream WebSocket connection and its state machine.
pub struct ClusterConnection {
    /// Cluster this connection reaches.
    pub cluster_id: String,
    /// Session identifier the tuple is scoped to.
    pub user_id: String,
    /// Upstream HTTP path.
    pub path: String,
    /// Upstream raw query.
    pub query: String,
    upstream: SafeFrameConn,
    client: Arc<SafeFrameConn>,
    status: Mutex<StatusInner>,
    token: StdMutex<Option<Zeroizing<String>>>,
    done: CancellationToken,
}

/// Registry key for a `(clusterId, path, userId)` tuple.
pub(crate) fn connection_key(cluster_id: &str, path: &str, user_id: &str) -> String {
    format!("{cluster_id}:{path}:{user_id}")
}

/// Write one `STATUS` frame for `cluster_id`/`path` to `client`.
///
/// Used by [`ClusterConnection::update_status`] and for dial failures that
/// happen before a connection object exists.
pub(crate) async fn send_status_frame(
    client: &SafeFrameConn,
    cluster_id: &str,
    path: &str,
    state: ConnectionState,
    error_text: &str,
) -> Result<()> {
    let payload = StatusPayload {
        state,
        error: error_text,
    };
    let data = serde_json::to_string(&payload)
        .map_err(|e| Error::Internal(format!("marshaling status message: {e}")))?;

    let status = Envelope {
        cluster_id: cluster_id.to_string(),
        path: path.to_string(),
        query: String::new(),
        user_id: String::new(),
        data,
        binary: false,
        frame_type: FrameType::Status,
    };

    client.write_json(&status).await
}

impl ClusterConnection {
    /// Build a connection around an already-dialed upstream socket.
    pub(crate) fn new(
        cluster_id: String,
        user_id: String,
        path: String,
        query: String,
        client: Arc<SafeFrameConn>,
        upstream: SafeFrameConn,
        token: Option<Zeroizing<String>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster_id,
            user_id,
            path,
            query,
            upstream,
            client,
            status: Mutex::new(StatusInner {
                state: ConnectionState::Connecting,
                error: String::new(),
                last_msg: Instant::now(),
                closed: false,
            }),
            token: StdMutex::new(token),
            done: CancellationToken::new(),
        })
    }

    /// Registry key of this connection.
    pub(crate) fn key(&self) -> String {
        connection_key(&self.cluster_id, &self.path, &self.user_id)
    }

    /// Clone of the shared client handle, for building a replacement.
    pub(crate) fn client_handle(&self) -> Arc<SafeFrameConn> {
        self.client.clone()
    }

    /// Whether this connection belongs to the given client session.
    pub(crate) fn shares_client(&self, client: &Arc<SafeFrameConn>) -> bool {
        Arc::ptr_eq(&self.client, client)
    }

    /// Cancellation signal observed by the reader and the heartbeat.
    pub(crate) fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Current lifecycle state.
    pub(crate) async fn state(&self) -> ConnectionState {
        self.status.lock().await.state
    }

    /// Whether the connection has been marked closed.
    pub(crate) async fn is_closed(&self) -> bool {
        self.status.lock().await.closed
    }

    /// Snapshot of the cached bearer token.
    pub(crate) fn cached_token(&self) -> Option<Zeroizing<String>> {
        self.token.lock().expect("token mutex poisoned").clone()
    }

    /// Cache a fresh bearer token for future reconnect dials.
    ///
    /// A token equal to the cached one is a no-op.
    pub(crate) fn update_token(&self, token: Option<Zeroizing<String>>) {
        let Some(token) = token else { return };

        let mut cached = self.token.lock().expect("token mutex poisoned");
        let changed = match cached.as_deref() {
            Some(current) => *current != *token,
            None => true,
        };
        if changed {
            debug!(cluster = %self.cluster_id, "Updating cached cluster token");
            *cached = Some(token);
        }
    }

    /// Transition the connection and notify the client with a `STATUS`
    /// frame. Suppressed once the connection is closed.
    pub(crate) async fn update_status(&self, state: ConnectionState, error_text: Option<&str>) {
        let mut status = self.status.lock().await;
        if status.closed {
            return;
        }

        status.state = state;
        status.last_msg = Instant::now();
        status.error = error_text.unwrap_or("").to_string();
        let error_text = status.error.clone();

        let result =
            send_status_frame(&self.client, &self.cluster_id, &self.path, state, &error_text).await;
        match result {
            Ok(()) => {}
            Err(Error::Internal(e)) => {
                // Marshal failure only; the state change itself stands
                error!(cluster = %self.cluster_id, error = %e, "building status message");
            }
            Err(e) => {
                debug!(cluster = %self.cluster_id, error = %e, "writing status message to client");
                status.closed = true;
            }
        }
    }

    /// Forward client payload bytes to the upstream socket.
    pub(crate) async fn write_to_upstream(&self, data: &[u8]) -> Result<()> {
        if let Err(e) = self.upstream.write_frame(Frame::Binary(data.to_vec())).await {
            self.update_status(ConnectionState::Error, Some(&e.to_string()))
                .await;
            error!(cluster = %self.cluster_id, error = %e, "writing message to cluster");
            return Err(e);
        }

        Ok(())
    }

    /// Send a liveness ping upstream.
    pub(crate) async fn ping_upstream(&self) -> Result<()> {
        self.upstream.write_frame(Frame::Ping(Vec::new())).await
    }

    /// Mark the connection closed and release its upstream socket.
    ///
    /// No `STATUS` frame is emitted, and none will be afterwards. Safe to
    /// call repeatedly.
    pub(crate) async fn mark_closed(&self) {
        {
            let mut status = self.status.lock().await;
            status.closed = true;
            status.state = ConnectionState::Closed;
        }

        self.done.cancel();
        let _ = self.upstream.close().await;
    }

    /// Relay upstream frames to the client until the upstream fails or the
    /// connection is cancelled.
    ///
    /// Watch payloads carry a resource version; whenever it advances, an
    /// advisory `COMPLETE` frame precedes the data frame. Payloads that are
    /// not JSON objects (exec byte streams) simply skip the marker.
    pub(crate) async fn run_reader(self: Arc<Self>) {
        let mut last_resource_version = String::new();

        loop {
            tokio::select! {
                _ = self.done.cancelled() => return,
                frame = self.upstream.read_frame() => {
                    let (payload, binary) = match frame {
                        Ok(Frame::Text(text)) => (text.into_bytes(), false),
                        Ok(Frame::Binary(data)) => (data, true),
                        Ok(Frame::Ping(_)) | Ok(Frame::Pong(_)) => continue,
                        Ok(Frame::Close) => {
                            self.update_status(
                                ConnectionState::Error,
                                Some("upstream closed the connection"),
                            )
                            .await;
                            return;
                        }
                        Err(e) => {
                            warn!(
                                cluster = %self.cluster_id,
                                user = %self.user_id,
                                error = %e,
                                "reading cluster message"
                            );
                            self.update_status(ConnectionState::Error, Some(&e.to_string())).await;
                            return;
                        }
                    };

                    if self.relay(payload, binary, &mut last_resource_version).await.is_err() {
                        // Client socket is dead; nothing more to emit
                        return;
                    }
                }
            }
        }
    }

    async fn relay(
        &self,
        payload: Vec<u8>,
        binary: bool,
        last_resource_version: &mut String,
    ) -> Result<()> {
        if let Some(version) = resource_version(&payload) {
            if version != *last_resource_version {
                *last_resource_version = version;
                self.emit_complete().await?;
            }
        }

        self.emit_data(payload, binary).await
    }

    /// Emit the advisory marker for an advanced resource version.
    async fn emit_complete(&self) -> Result<()> {
        let complete = Envelope {
            cluster_id: self.cluster_id.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            user_id: self.user_id.clone(),
            data: String::new(),
            binary: false,
            frame_type: FrameType::Complete,
        };

        self.emit(&complete).await
    }

    /// Wrap an upstream payload in a `DATA` envelope and emit it.
    async fn emit_data(&self, payload: Vec<u8>, binary: bool) -> Result<()> {
        let data = if binary {
            STANDARD.encode(&payload)
        } else {
            String::from_utf8_lossy(&payload).into_owned()
        };

        let envelope = Envelope {
            cluster_id: self.cluster_id.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            user_id: self.user_id.clone(),
            data,
            binary,
            frame_type: FrameType::Data,
        };

        self.emit(&envelope).await
    }

    /// Write one envelope to the client unless the connection is closed.
    async fn emit(&self, envelope: &Envelope) -> Result<()> {
        let mut status = self.status.lock().await;
        if status.closed {
            return Ok(());
        }

        self.client.write_json(envelope).await?;
        status.last_msg = Instant::now();
        Ok(())
    }
}

/// Extract `metadata.resourceVersion`, falling back to
/// `object.metadata.resourceVersion`, from a JSON payload.
fn resource_version(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;

    let metadata = match value.get("metadata").and_then(|m| m.as_object()) {
        Some(metadata) => metadata,
        None => value.get("object")?.get("metadata")?.as_object()?,
    };

    metadata
        .get("resourceVersion")?
        .as_str()
        .map(str::to_string)
}
