use peertunnel_connection::DialError;
use peertunnel_proto::{CodecError, PeerId};
use thiserror::Error;

/// Session layer errors
#[derive(Debug, Error)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Expected peer {expected}, got {actual}")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },

    #[error("Unsupported protocol version: {0}")]
    VersionMismatch(u32),

    #[error("Session closed")]
    Closed,
}

impl From<NetError> for DialError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Io(e) => DialError::Io(e),
            other => DialError::Handshake(other.to_string()),
        }
    }
}
