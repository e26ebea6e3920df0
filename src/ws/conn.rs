//! Thread-safe connection wrapper
//!
//! [`SafeFrameConn`] serializes all writes to a WebSocket through one lock,
//! so frames produced by different tasks (several cluster connections plus
//! the session loop share the client socket) are emitted whole, never
//! interleaved. Reads take a separate lock; each direction has exactly one
//! reader task, so read locking is uncontended in practice.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::WebSocket;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;

use super::frame::{split_client, split_upstream, Frame, FrameSink, FrameStream};
use crate::error::{Error, Result};

/// A frame connection with serialized writes and idempotent close.
pub struct SafeFrameConn {
    writer: Mutex<Box<dyn FrameSink>>,
    reader: Mutex<Box<dyn FrameStream>>,
    closed: AtomicBool,
}

impl SafeFrameConn {
    /// Wrap a pair of transport halves.
    pub fn new(sink: Box<dyn FrameSink>, stream: Box<dyn FrameStream>) -> Self {
        Self {
            writer: Mutex::new(sink),
            reader: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap an upgraded client socket.
    pub fn from_client(socket: WebSocket) -> Self {
        let (sink, stream) = split_client(socket);
        Self::new(Box::new(sink), Box::new(stream))
    }

    /// Wrap a dialed upstream socket.
    pub fn from_upstream<S>(stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = split_upstream(stream);
        Self::new(Box::new(sink), Box::new(stream))
    }

    /// Serialize `value` as JSON and send it as a text frame.
    pub async fn write_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)
            .map_err(|e| Error::Internal(format!("marshaling message: {e}")))?;
        self.write_frame(Frame::Text(text)).await
    }

    /// Send one frame.
    pub async fn write_frame(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        writer.send(frame).await
    }

    /// Read the next frame. End of stream reads as a transport error.
    pub async fn read_frame(&self) -> Result<Frame> {
        let mut reader = self.reader.lock().await;
        match reader.next().await {
            Some(frame) => frame,
            None => Err(Error::Transport("connection closed by peer".into())),
        }
    }

    /// Read the next data frame and decode it as JSON.
    ///
    /// Control frames are skipped; a close frame is a transport error, a
    /// frame that fails to decode is a protocol error.
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T> {
        loop {
            match self.read_frame().await? {
                Frame::Text(text) => {
                    return serde_json::from_str(&text).map_err(|e| Error::Protocol(e.to_string()))
                }
                Frame::Binary(data) => {
                    return serde_json::from_slice(&data)
                        .map_err(|e| Error::Protocol(e.to_string()))
                }
                Frame::Ping(_) | Frame::Pong(_) => continue,
                Frame::Close => return Err(Error::Transport("close frame received".into())),
            }
        }
    }

    /// Close the connection. Holds the write lock, so no frame can be torn
    /// by a concurrent close. Subsequent calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        writer.close().await
    }
}
