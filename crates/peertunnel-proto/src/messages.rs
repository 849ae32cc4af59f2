//! Protocol message types
//!
//! Frames exchanged by a session layer that carries the portal RPC methods
//! between two peers. Several calls share one session; each call is tagged with
//! a `CallId` chosen by the caller.

use crate::peer::PeerId;
use crate::rpc::{ConnectOpts, RpcMethod};
use serde::{Deserialize, Serialize};

/// Identifier of an in-flight call within one session
pub type CallId = u32;

/// Main tunnel protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TunnelMessage {
    /// First frame in each direction: who is on this end
    Hello { peer_id: PeerId, version: u32 },

    /// Invoke a method on the remote peer
    Request { call_id: CallId, call: RpcCall },
    /// Reply to a sync call
    Response { call_id: CallId, reply: RpcReply },

    /// Payload of a duplex call, in either direction
    StreamData {
        call_id: CallId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// End of one direction of a duplex call, with an optional failure
    StreamEnd {
        call_id: CallId,
        error: Option<WireError>,
    },

    /// Session is being closed by the sender
    Goodbye { reason: String },
}

/// A method invocation with its arguments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RpcCall {
    Announce,
    Connect { opts: Option<ConnectOpts> },
    Ping,
    List,
}

impl RpcCall {
    pub fn method(&self) -> RpcMethod {
        match self {
            RpcCall::Announce => RpcMethod::Announce,
            RpcCall::Connect { .. } => RpcMethod::Connect,
            RpcCall::Ping => RpcMethod::Ping,
            RpcCall::List => RpcMethod::List,
        }
    }
}

/// Result of a sync call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RpcReply {
    Ack,
    Timestamp(u64),
    Peers(Vec<PeerId>),
    Error(WireError),
}

/// Error codes carried on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Required call arguments were missing
    InvalidRequest = 1,
    /// Target neither forwardable nor local
    ConnectFailed = 2,
    /// Caller is not allowed to invoke the method
    PermissionDenied = 3,
    /// Session or stream closed underneath the call
    Closed = 4,
    /// Anything else raised by the remote side
    Remote = 5,
}

/// Serializable error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl TunnelMessage {
    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            TunnelMessage::Hello { .. } => "Hello",
            TunnelMessage::Request { .. } => "Request",
            TunnelMessage::Response { .. } => "Response",
            TunnelMessage::StreamData { .. } => "StreamData",
            TunnelMessage::StreamEnd { .. } => "StreamEnd",
            TunnelMessage::Goodbye { .. } => "Goodbye",
        }
    }

    /// Call this frame belongs to, if any
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            TunnelMessage::Request { call_id, .. }
            | TunnelMessage::Response { call_id, .. }
            | TunnelMessage::StreamData { call_id, .. }
            | TunnelMessage::StreamEnd { call_id, .. } => Some(*call_id),
            TunnelMessage::Hello { .. } | TunnelMessage::Goodbye { .. } => None,
        }
    }
}

// Byte payloads serialize as a single byte string instead of a sequence
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
