//! WebSocket transport layer
//!
//! The multiplexer sits between two kinds of sockets: the axum-upgraded
//! client connection and tungstenite connections dialed to upstream API
//! servers. Both are reduced to the same minimal frame transport
//! ([`FrameSink`]/[`FrameStream`]) and wrapped in [`SafeFrameConn`], which
//! serializes writes so frames from concurrent producers never interleave.

mod conn;
pub mod dial;
mod frame;

pub use self::conn::SafeFrameConn;
pub use self::dial::{websocket_url, Dialer, TlsDialer};
pub use self::frame::{Frame, FrameSink, FrameStream};

#[cfg(test)]
pub(crate) use self::frame::testing;
