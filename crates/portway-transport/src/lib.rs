//! Transport abstraction for tunnel endpoints
//!
//! A transport is a reliable, ordered, framed duplex channel to the remote
//! tunnel peer. The proxy engine consumes the [`Transport`] trait; concrete
//! adapters live in [`pipe`] and [`websocket`].

pub mod pipe;
pub mod websocket;

pub use pipe::PipeTransport;
pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Duplex message channel to the remote tunnel peer.
///
/// Frames submitted by `send` in program order are delivered to the peer in
/// that order. The transport performs no retransmission; once it reports
/// closed it stays closed.
#[async_trait]
pub trait Transport: Send {
    /// Send one frame. Fails only when the transport is closed.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Receive the next inbound frame. `Ok(None)` signals transport close.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the transport is still usable
    fn is_connected(&self) -> bool;
}
