//! Transport trait for tunnel streams

use crate::duplex::{DuplexStream, StreamError};
use async_trait::async_trait;
use bytes::Bytes;

/// Byte transport handed to tunnel users
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send data through the transport
    async fn send(&mut self, data: Bytes) -> Result<(), StreamError>;

    /// Receive data from the transport, `None` once the remote side ended
    async fn recv(&mut self) -> Result<Option<Bytes>, StreamError>;

    /// Close the sending direction
    async fn close(&mut self) -> Result<(), StreamError>;

    /// Check if transport is connected
    fn is_connected(&self) -> bool;
}

#[async_trait]
impl Transport for DuplexStream {
    async fn send(&mut self, data: Bytes) -> Result<(), StreamError> {
        self.sink_mut().send(data).await
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, StreamError> {
        self.source_mut().recv().await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if let Some(err) = self.failure() {
            return Err(err.clone());
        }
        self.sink_mut().close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.failure().is_none() && self.sink().is_open()
    }
}
