//! Stream-backed duplex channel
//!
//! Adapts any `AsyncRead + AsyncWrite` stream (TCP socket, in-memory
//! duplex pipe) to [`DuplexChannel`].

use super::r#trait::{DuplexChannel, TransportType};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// A duplex channel over an async byte stream
pub struct StreamChannel<S> {
    stream: S,
    peer_id: String,
    transport_type: TransportType,
    closed: bool,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer_id: impl Into<String>, transport_type: TransportType) -> Self {
        Self {
            stream,
            peer_id: peer_id.into(),
            transport_type,
            closed: false,
        }
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }
}

impl<S> fmt::Debug for StreamChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("peer_id", &self.peer_id)
            .field("transport_type", &self.transport_type)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl<S> DuplexChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        if self.closed {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; max_bytes.max(1)];
        let n = self
            .stream
            .read(&mut buf)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "reading from channel"))?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(ProtocolError::Transport(format!(
                "channel to {} is closed",
                self.peer_id
            )));
        }
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "writing to channel"))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "flushing channel"))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("Closing {} channel to {}", self.transport_type, self.peer_id);
        // The peer may already be gone; a failed shutdown still leaves us closed
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of channel to {} failed: {}", self.peer_id, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_pipe_read_write() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = StreamChannel::new(a, "right", TransportType::Memory);
        let mut right = StreamChannel::new(b, "left", TransportType::Memory);

        left.write(b"hello").await.unwrap();
        let received = right.read(64).await.unwrap();
        assert_eq!(received, b"hello");
        assert_eq!(right.peer_id(), "left");
    }

    #[tokio::test]
    async fn test_close_signals_eof() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = StreamChannel::new(a, "right", TransportType::Memory);
        let mut right = StreamChannel::new(b, "left", TransportType::Memory);

        left.close().await.unwrap();
        assert!(right.read(64).await.unwrap().is_empty());
        assert!(left.write(b"late").await.is_err());
        // idempotent
        left.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_after_peer_dropped_fails() {
        let (a, b) = tokio::io::duplex(16);
        let mut left = StreamChannel::new(a, "right", TransportType::Memory);
        drop(b);
        assert!(left.write(b"orphan").await.is_err());
    }
}
