//! Tunnel Protocol Definitions
//!
//! This crate defines the core protocol types for relaying connections between
//! peers of a gossip network through a reachable "portal" peer: peer identifiers,
//! the `tunnel:` address format, RPC options and manifest, and the wire messages
//! used by session layers that carry the portal's RPC methods.

pub mod address;
pub mod codec;
pub mod messages;
pub mod peer;
pub mod rpc;

pub use address::{AddressError, AddressInput, AddressRecord, TunnelAddress};
pub use codec::{CodecError, TunnelCodec};
pub use messages::{CallId, ErrorCode, RpcCall, RpcReply, TunnelMessage, WireError};
pub use peer::{is_feed_id, InvalidPeerId, PeerId, PeerIdPredicate};
pub use rpc::{CallKind, ConnectOpts, Permissions, RpcMethod, MAX_FORWARD_HOPS};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Name under which the tunnel transport registers with a multi-transport host
pub const TRANSPORT_NAME: &str = "tunnel";

/// Visibility scope reported when the transport config does not set one
pub const DEFAULT_SCOPE: &str = "public";

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
