//! Heartbeat and reconnect supervision
//!
//! One supervisor task per cluster connection. Every heartbeat interval it
//! pings the upstream socket; a failed ping moves the connection to the
//! error state and triggers a reconnect. Reconnecting never mutates the
//! failed connection: a fresh one is dialed with the cached token, swapped
//! into the registry in its place, and the supervisor carries on with the
//! replacement. While the dial keeps failing the old entry stays in the
//! error state and the next tick retries.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::connection::{ClusterConnection, ConnectionState};
use super::Multiplexer;
use crate::error::{Error, Result};

impl Multiplexer {
    /// Supervise one connection until it is torn down.
    pub(crate) async fn supervise(self: Arc<Self>, mut conn: Arc<ClusterConnection>) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            let done = conn.done();
            tokio::select! {
                _ = done.cancelled() => {
                    conn.update_status(ConnectionState::Closed, None).await;
                    return;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = conn.ping_upstream().await {
                        conn.update_status(
                            ConnectionState::Error,
                            Some(&format!("heartbeat failed: {e}")),
                        )
                        .await;

                        match self.reconnect(&conn).await {
                            Ok(replacement) => {
                                info!(cluster = %conn.cluster_id, "Reconnected to cluster");
                                conn = replacement;
                            }
                            Err(Error::ConnectionClosed) => {
                                // Torn down while we were reconnecting
                                debug!(cluster = %conn.cluster_id, "Connection closed during reconnect");
                                return;
                            }
                            Err(e) => {
                                error!(cluster = %conn.cluster_id, error = %e, "reconnecting to cluster");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Replace a failed connection with a freshly dialed one.
    ///
    /// The registry entry is swapped only while it still points at `old`;
    /// if a `CLOSE` or session teardown won the race, the replacement is
    /// discarded and [`Error::ConnectionClosed`] is returned.
    pub(crate) async fn reconnect(
        self: &Arc<Self>,
        old: &Arc<ClusterConnection>,
    ) -> Result<Arc<ClusterConnection>> {
        if old.is_closed().await {
            return Err(Error::ConnectionClosed);
        }

        let token = old.cached_token();
        let config = self.cluster_config(&old.cluster_id, &old.user_id)?;
        let upstream = self
            .dialer
            .dial(
                &config,
                &old.path,
                &old.query,
                token.as_deref().map(String::as_str),
            )
            .await?;

        let replacement = ClusterConnection::new(
            old.cluster_id.clone(),
            old.user_id.clone(),
            old.path.clone(),
            old.query.clone(),
            old.client_handle(),
            upstream,
            token,
        );

        let key = replacement.key();
        {
            let mut registry = self.connections.write().await;
            match registry.get(&key) {
                Some(current) if Arc::ptr_eq(current, old) => {
                    registry.insert(key, replacement.clone());
                }
                _ => {
                    drop(registry);
                    replacement.mark_closed().await;
                    return Err(Error::ConnectionClosed);
                }
            }
        }

        old.mark_closed().await;

        replacement
            .update_status(ConnectionState::Connected, None)
            .await;
        tokio::spawn(replacement.clone().run_reader());

        Ok(replacement)
    }
}
