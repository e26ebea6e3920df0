//! Skylight: a cluster-aware WebSocket multiplexer
//!
//! One browser WebSocket in, many Kubernetes API-server WebSockets out.
//! The client wraps each message in a JSON envelope naming a
//! `(clusterId, path, userId)` tuple; the multiplexer lazily dials one
//! upstream connection per tuple and relays frames in both directions,
//! hiding transient upstream failures behind heartbeat-driven reconnects.
//!
//! # Architecture
//!
//! ```text
//! browser ──ws──► Multiplexer ──wss──► cluster A  (watch /api/v1/pods)
//!                     │
//!                     ├─────────wss──► cluster A  (exec)
//!                     └─────────wss──► cluster B  (logs)
//! ```
//!
//! Per-session guards: `Origin`/`Host` validation with a DNS-rebinding
//! allowlist, per-connection and per-IP token-bucket rate limits, and a
//! per-cluster bearer token read from an HTTP-only cookie.

#![deny(missing_docs)]

pub mod auth;
pub mod config;
pub mod contexts;
pub mod error;
pub mod limiter;
pub mod mux;
pub mod origin;
pub mod telemetry;
pub mod ws;

pub use auth::{AuthProvider, CookieAuth};
pub use config::MultiplexerConfig;
pub use contexts::{ContextStore, MemoryContextStore, RestConfig};
pub use error::{Error, Result};
pub use mux::{ws_handler, ConnectionState, Multiplexer};
pub use origin::OriginGuard;
pub use ws::{Dialer, SafeFrameConn, TlsDialer};
