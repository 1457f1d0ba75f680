//! In-memory duplex transport

use crate::{Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Capacity of each direction of the pipe
const PIPE_CAPACITY: usize = 64;

/// In-process transport built from a crossed pair of bounded channels.
///
/// Used by the test suite and for same-process tunnels.
#[derive(Debug)]
pub struct PipeTransport {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
}

impl PipeTransport {
    /// Create both ends of a pipe
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(PIPE_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(PIPE_CAPACITY);
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        self.rx.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.tx.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (mut a, mut b) = PipeTransport::pair();

        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::from_static(b"two")).await.unwrap();
        b.send(Bytes::from_static(b"reply")).await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap().as_ref(), b"one");
        assert_eq!(b.recv().await.unwrap().unwrap().as_ref(), b"two");
        assert_eq!(a.recv().await.unwrap().unwrap().as_ref(), b"reply");
    }

    #[tokio::test]
    async fn test_close_signals_peer() {
        let (mut a, mut b) = PipeTransport::pair();
        assert!(a.is_connected());

        a.close().await.unwrap();
        assert!(!a.is_connected());

        // peer sees end-of-stream and can no longer send
        assert!(b.recv().await.unwrap().is_none());
        assert!(matches!(
            b.send(Bytes::from_static(b"late")).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
