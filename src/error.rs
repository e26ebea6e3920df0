//! Error types for the multiplexer

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for multiplexer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for multiplexer operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Authentication failed (missing or unreadable cluster cookie)
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Upgrade request failed origin or host validation
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No REST config known for the requested cluster
    #[error("cluster not found: {0}")]
    UnknownCluster(String),

    /// Upstream dial, TLS setup, or handshake failure
    #[error("dialing upstream: {0}")]
    Dial(String),

    /// Read or write failure on an established WebSocket
    #[error("websocket transport: {0}")]
    Transport(String),

    /// Malformed or unrecognized envelope from the client
    #[error("invalid message: {0}")]
    Protocol(String),

    /// Operation on a connection that has already been torn down
    #[error("connection closed")]
    ConnectionClosed,

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::UnknownCluster(_) => StatusCode::NOT_FOUND,
            Error::Dial(_) | Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Error::Protocol(_) => StatusCode::BAD_REQUEST,
            Error::ConnectionClosed => StatusCode::GONE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<axum::Error> for Error {
    fn from(e: axum::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Dial(e.to_string())
    }
}
