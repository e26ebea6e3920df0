//! Frame transport abstraction
//!
//! A [`Frame`] is the lowest common denominator of the axum and tungstenite
//! message types. The [`FrameSink`]/[`FrameStream`] traits are the only
//! polymorphic seam in the crate: production code plugs in real WebSocket
//! halves, tests plug in channel-backed fakes.

use async_trait::async_trait;
use axum::extract::ws;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as TgMessage;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, Result};

/// One WebSocket frame, transport-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
    /// Ping control frame
    Ping(Vec<u8>),
    /// Pong control frame
    Pong(Vec<u8>),
    /// Close frame
    Close,
}

/// Write half of a frame transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Flush and close the transport.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a frame transport.
#[async_trait]
pub trait FrameStream: Send {
    /// Read the next frame. `None` means the peer ended the stream.
    async fn next(&mut self) -> Option<Result<Frame>>;
}

// ============================================================================
// Client transport (axum)
// ============================================================================

pub(crate) struct ClientFrameSink {
    inner: SplitSink<ws::WebSocket, ws::Message>,
}

pub(crate) struct ClientFrameStream {
    inner: SplitStream<ws::WebSocket>,
}

pub(crate) fn split_client(
    socket: ws::WebSocket,
) -> (ClientFrameSink, ClientFrameStream) {
    let (sink, stream) = socket.split();
    (
        ClientFrameSink { inner: sink },
        ClientFrameStream { inner: stream },
    )
}

#[async_trait]
impl FrameSink for ClientFrameSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => ws::Message::Text(text.into()),
            Frame::Binary(data) => ws::Message::Binary(data.into()),
            Frame::Ping(data) => ws::Message::Ping(data.into()),
            Frame::Pong(data) => ws::Message::Pong(data.into()),
            Frame::Close => ws::Message::Close(None),
        };

        self.inner.send(msg).await.map_err(Error::from)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await.map_err(Error::from)
    }
}

#[async_trait]
impl FrameStream for ClientFrameStream {
    async fn next(&mut self) -> Option<Result<Frame>> {
        let frame = match self.inner.next().await? {
            Ok(ws::Message::Text(text)) => Ok(Frame::Text(text.to_string())),
            Ok(ws::Message::Binary(data)) => Ok(Frame::Binary(data.to_vec())),
            Ok(ws::Message::Ping(data)) => Ok(Frame::Ping(data.to_vec())),
            Ok(ws::Message::Pong(data)) => Ok(Frame::Pong(data.to_vec())),
            Ok(ws::Message::Close(_)) => Ok(Frame::Close),
            Err(e) => Err(Error::from(e)),
        };

        Some(frame)
    }
}

// ============================================================================
// Upstream transport (tungstenite)
// ============================================================================

pub(crate) struct UpstreamFrameSink<S> {
    inner: SplitSink<WebSocketStream<S>, TgMessage>,
}

pub(crate) struct UpstreamFrameStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

pub(crate) fn split_upstream<S>(
    stream: WebSocketStream<S>,
) -> (UpstreamFrameSink<S>, UpstreamFrameStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (sink, stream) = stream.split();
    (
        UpstreamFrameSink { inner: sink },
        UpstreamFrameStream { inner: stream },
    )
}

#[async_trait]
impl<S> FrameSink for UpstreamFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => TgMessage::Text(text.into()),
            Frame::Binary(data) => TgMessage::Binary(data.into()),
            Frame::Ping(data) => TgMessage::Ping(data.into()),
            Frame::Pong(data) => TgMessage::Pong(data.into()),
            Frame::Close => TgMessage::Close(None),
        };

        self.inner.send(msg).await.map_err(Error::from)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await.map_err(Error::from)
    }
}

#[async_trait]
impl<S> FrameStream for UpstreamFrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next(&mut self) -> Option<Result<Frame>> {
        loop {
            let frame = match self.inner.next().await? {
                Ok(TgMessage::Text(text)) => Ok(Frame::Text(text.to_string())),
                Ok(TgMessage::Binary(data)) => Ok(Frame::Binary(data.to_vec())),
                Ok(TgMessage::Ping(data)) => Ok(Frame::Ping(data.to_vec())),
                Ok(TgMessage::Pong(data)) => Ok(Frame::Pong(data.to_vec())),
                Ok(TgMessage::Close(_)) => Ok(Frame::Close),
                // Raw frames only appear with manual frame assembly
                Ok(TgMessage::Frame(_)) => continue,
                Err(e) => Err(Error::from(e)),
            };

            return Some(frame);
        }
    }
}

// ============================================================================
// Channel-backed fakes for tests
// ============================================================================
