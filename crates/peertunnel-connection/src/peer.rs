//! Interfaces between the tunnel core and the peer session layer
//!
//! The tunnel core never opens sockets itself. It dials peers through a
//! [`PeerDialer`], talks to them through a [`PeerConnection`], and serves
//! incoming calls through an [`RpcHandler`] installed on the local node.

use crate::duplex::DuplexStream;
use crate::signal::CloseSignal;
use async_trait::async_trait;
use peertunnel_proto::{ConnectOpts, ErrorCode, PeerId, Permissions, RpcMethod, WireError};
use std::sync::Arc;
use thiserror::Error;

/// Errors from a sync RPC call
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Connection closed")]
    Closed,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Remote error: {0}")]
    Remote(String),
}

impl RpcError {
    pub fn denied(method: RpcMethod) -> Self {
        RpcError::PermissionDenied(format!("{} is not allowed", method.name()))
    }
}

impl From<WireError> for RpcError {
    fn from(err: WireError) -> Self {
        match err.code {
            ErrorCode::Closed => RpcError::Closed,
            ErrorCode::PermissionDenied => RpcError::PermissionDenied(err.message),
            ErrorCode::InvalidRequest => RpcError::InvalidRequest(err.message),
            ErrorCode::ConnectFailed | ErrorCode::Remote => RpcError::Remote(err.message),
        }
    }
}

impl From<&RpcError> for WireError {
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::Closed => WireError::new(ErrorCode::Closed, err.to_string()),
            RpcError::PermissionDenied(m) => WireError::new(ErrorCode::PermissionDenied, m),
            RpcError::InvalidRequest(m) => WireError::new(ErrorCode::InvalidRequest, m),
            RpcError::Remote(m) => WireError::new(ErrorCode::Remote, m),
        }
    }
}

/// Errors from dialing a peer
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Peer unreachable: {0}")]
    Unreachable(PeerId),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Live RPC-capable connection to a remote peer
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Identifier of the peer on the other end
    fn remote_id(&self) -> &PeerId;

    async fn announce(&self) -> Result<(), RpcError>;

    /// Open a tunnel through the remote peer. Failures arrive through the
    /// returned stream.
    async fn connect(&self, opts: Option<ConnectOpts>) -> DuplexStream;

    async fn ping(&self) -> Result<u64, RpcError>;

    async fn list(&self) -> Result<Vec<PeerId>, RpcError>;

    /// Notification that fires once this connection goes away
    fn close_signal(&self) -> CloseSignal;

    fn close(&self);
}

/// Dial-by-identifier
#[async_trait]
pub trait PeerDialer: Send + Sync {
    /// Identifier of the local node
    fn local_id(&self) -> &PeerId;

    async fn dial(&self, peer: &PeerId) -> Result<Arc<dyn PeerConnection>, DialError>;
}

/// Remote caller of an incoming RPC, with a handle back to it
#[derive(Clone)]
pub struct Caller {
    pub id: PeerId,
    pub connection: Arc<dyn PeerConnection>,
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller").field("id", &self.id).finish()
    }
}

/// Server side of the portal methods, invoked by the session layer
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn announce(&self, caller: Caller) -> Result<(), RpcError>;

    async fn connect(&self, caller: &PeerId, opts: Option<ConnectOpts>) -> DuplexStream;

    async fn ping(&self) -> Result<u64, RpcError>;

    async fn list(&self) -> Result<Vec<PeerId>, RpcError>;

    /// Methods `caller` may invoke
    fn permissions(&self, _caller: &PeerId) -> Permissions {
        Permissions::anonymous()
    }

    /// Permission check the session layer runs before dispatching
    fn authorize(&self, caller: &PeerId, method: RpcMethod) -> Result<(), RpcError> {
        if self.permissions(caller).allows(method) {
            Ok(())
        } else {
            Err(RpcError::denied(method))
        }
    }
}
