//! Duplex byte streams
//!
//! A duplex stream is two independent unidirectional channels. Each direction
//! carries byte chunks and ends either cleanly (end-of-stream) or with a
//! `StreamError`. A stream can also be created already failed: every read and
//! write on it returns the stored error, which lets relay calls hand back a
//! stream in every case and report failure on first use.

use bytes::Bytes;
use peertunnel_proto::{ErrorCode, WireError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Chunks buffered per direction before `send` waits for the reader
pub const STREAM_BUFFER: usize = 64;

type Chunk = Result<Bytes, StreamError>;

/// Errors surfaced through a duplex stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    ConnectFailed(String),

    #[error("Stream closed")]
    Closed,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Remote error: {0}")]
    Remote(String),
}

impl StreamError {
    /// `connect` was called without options
    pub fn missing_opts() -> Self {
        StreamError::InvalidRequest("opts *must* be provided".to_string())
    }

    /// Target is neither registered nor local
    pub fn could_not_connect(target: impl std::fmt::Display) -> Self {
        StreamError::ConnectFailed(format!("could not connect to: {}", target))
    }
}

impl From<&StreamError> for WireError {
    fn from(err: &StreamError) -> Self {
        let (code, message) = match err {
            StreamError::InvalidRequest(m) => (ErrorCode::InvalidRequest, m.clone()),
            StreamError::ConnectFailed(m) => (ErrorCode::ConnectFailed, m.clone()),
            StreamError::Closed => (ErrorCode::Closed, err.to_string()),
            StreamError::PermissionDenied(m) => (ErrorCode::PermissionDenied, m.clone()),
            StreamError::Remote(m) => (ErrorCode::Remote, m.clone()),
        };
        WireError::new(code, message)
    }
}

impl From<WireError> for StreamError {
    fn from(err: WireError) -> Self {
        match err.code {
            ErrorCode::InvalidRequest => StreamError::InvalidRequest(err.message),
            ErrorCode::ConnectFailed => StreamError::ConnectFailed(err.message),
            ErrorCode::PermissionDenied => StreamError::PermissionDenied(err.message),
            ErrorCode::Closed => StreamError::Closed,
            ErrorCode::Remote => StreamError::Remote(err.message),
        }
    }
}

/// Writing half of a duplex stream
#[derive(Debug)]
pub struct StreamSink {
    sender: Option<mpsc::Sender<Chunk>>,
    failure: Option<StreamError>,
}

impl StreamSink {
    pub async fn send(&mut self, data: Bytes) -> Result<(), StreamError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let sender = self.sender.as_ref().ok_or(StreamError::Closed)?;
        sender.send(Ok(data)).await.map_err(|_| StreamError::Closed)
    }

    /// End this direction cleanly; the reader sees end-of-stream
    pub fn close(&mut self) {
        self.sender = None;
    }

    /// End this direction with an error delivered to the reader
    pub async fn abort(&mut self, err: StreamError) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(err)).await;
        }
    }

    pub fn is_open(&self) -> bool {
        self.failure.is_none()
            && self
                .sender
                .as_ref()
                .map(|s| !s.is_closed())
                .unwrap_or(false)
    }
}

/// Reading half of a duplex stream
#[derive(Debug)]
pub struct StreamSource {
    receiver: mpsc::Receiver<Chunk>,
    failure: Option<StreamError>,
}

impl StreamSource {
    /// Next chunk, `Ok(None)` at end-of-stream
    pub async fn recv(&mut self) -> Result<Option<Bytes>, StreamError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        match self.receiver.recv().await {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(err)) => {
                self.failure = Some(err.clone());
                Err(err)
            }
            None => Ok(None),
        }
    }
}

/// Bidirectional byte stream
#[derive(Debug)]
pub struct DuplexStream {
    sink: StreamSink,
    source: StreamSource,
}

impl DuplexStream {
    /// Two cross-connected streams: bytes sent on one are received on the other
    pub fn pair() -> (DuplexStream, DuplexStream) {
        let (a_tx, a_rx) = mpsc::channel(STREAM_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(STREAM_BUFFER);
        (Self::from_parts(a_tx, b_rx), Self::from_parts(b_tx, a_rx))
    }

    /// A stream whose reads and writes all fail with `err`
    pub fn failed(err: StreamError) -> Self {
        let (_, receiver) = mpsc::channel(1);
        Self {
            sink: StreamSink {
                sender: None,
                failure: Some(err.clone()),
            },
            source: StreamSource {
                receiver,
                failure: Some(err),
            },
        }
    }

    fn from_parts(sender: mpsc::Sender<Chunk>, receiver: mpsc::Receiver<Chunk>) -> Self {
        Self {
            sink: StreamSink {
                sender: Some(sender),
                failure: None,
            },
            source: StreamSource {
                receiver,
                failure: None,
            },
        }
    }

    /// Error this stream was created failed with, if any
    pub fn failure(&self) -> Option<&StreamError> {
        self.sink.failure.as_ref()
    }

    pub async fn abort(&mut self, err: StreamError) {
        self.sink.abort(err).await;
    }

    /// Split into halves that can be driven from separate tasks
    pub fn split(self) -> (StreamSink, StreamSource) {
        (self.sink, self.source)
    }

    pub fn sink(&self) -> &StreamSink {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut StreamSink {
        &mut self.sink
    }

    pub fn source_mut(&mut self) -> &mut StreamSource {
        &mut self.source
    }
}
