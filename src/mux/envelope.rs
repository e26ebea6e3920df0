//! Envelope wire schema
//!
//! Every frame on the client WebSocket is a JSON-encoded [`Envelope`]. The
//! client sends `REQUEST` and `CLOSE`; the server answers with `DATA`,
//! `COMPLETE`, `STATUS`, and `error` frames. Upstream payloads travel in
//! `data`, base64-encoded when binary.

use serde::{Deserialize, Serialize};

/// Envelope frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Client-to-upstream payload, also creates the upstream connection
    #[serde(rename = "REQUEST")]
    Request,
    /// Tear down one upstream connection
    #[serde(rename = "CLOSE")]
    Close,
    /// Upstream-to-client payload
    #[serde(rename = "DATA")]
    Data,
    /// Advisory marker: the watched resource version advanced
    #[serde(rename = "COMPLETE")]
    Complete,
    /// Connection state change
    #[serde(rename = "STATUS")]
    Status,
    /// Terminal or advisory error report
    #[serde(rename = "error")]
    Error,
}

/// One multiplexed frame on the client socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical cluster identifier
    #[serde(rename = "clusterId", default)]
    pub cluster_id: String,
    /// Upstream HTTP path
    #[serde(default)]
    pub path: String,
    /// Upstream raw query
    #[serde(default)]
    pub query: String,
    /// Session identifier, disambiguating per-user dynamic clusters
    #[serde(rename = "userId", default)]
    pub user_id: String,
    /// Payload; base64 when `binary` is set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    /// Payload is binary
    #[serde(default, skip_serializing_if = "is_false")]
    pub binary: bool,
    /// Frame type
    #[serde(rename = "type")]
    pub frame_type: FrameType,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Error frame sent for session-level failures, e.g. rate limiting.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Always `"error"`
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Machine-readable error tag
    pub error: String,
}

impl ErrorMessage {
    /// The payload emitted when a rate limiter denies a message.
    pub fn rate_limit_exceeded() -> Self {
        Self {
            frame_type: "error".to_string(),
            error: "rate_limit_exceeded".to_string(),
        }
    }

    /// The payload emitted when an envelope cannot be decoded.
    pub fn invalid_message() -> Self {
        Self {
            frame_type: "error".to_string(),
            error: "invalid_message".to_string(),
        }
    }
}

/// Error frame tied to one cluster, sent when establishing its upstream
/// connection fails.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionError {
    /// Cluster the failure belongs to
    #[serde(rename = "clusterId")]
    pub cluster_id: String,
    /// Human-readable failure description
    pub error: String,
}
