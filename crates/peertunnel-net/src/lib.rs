//! TCP session layer for tunnel nodes
//!
//! Peers exchange length-prefixed `bincode` frames over TCP. After a `Hello`
//! handshake each session multiplexes portal RPC calls by call id; `connect`
//! calls carry their stream as `StreamData`/`StreamEnd` frames.

pub mod error;
pub mod frame;
pub mod node;
pub mod session;

pub use error::NetError;
pub use frame::FrameCodec;
pub use node::NetNode;
pub use session::{handshake, Role, Session};

/// Time allowed for the `Hello` exchange
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
