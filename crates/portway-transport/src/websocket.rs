//! WebSocket transport adapter

use crate::{Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

/// Tunnel transport over an established WebSocket connection.
///
/// Tunnel frames map to binary WebSocket messages. Ping/pong is answered by
/// tungstenite; text messages are not part of the protocol and are dropped.
/// Generic over the underlying IO so it serves both the client and server
/// sides, TLS or plain.
pub struct WebSocketTransport<S> {
    inner: WebSocketStream<S>,
    closed: bool,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            inner: stream,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.inner
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| {
                self.closed = true;
                TransportError::WebSocket(e.to_string())
            })
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        while let Some(result) = self.inner.next().await {
            match result {
                Ok(Message::Binary(data)) => return Ok(Some(Bytes::from(data))),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    trace!("websocket keepalive");
                }
                Ok(Message::Close(_)) => {
                    debug!("websocket close received");
                    self.closed = true;
                    return Ok(None);
                }
                Ok(other) => {
                    warn!("Ignoring non-binary websocket message: {:?}", other);
                }
                Err(e) => {
                    self.closed = true;
                    return Err(TransportError::WebSocket(e.to_string()));
                }
            }
        }
        self.closed = true;
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner
            .close(None)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        !self.closed
    }
}
