//! Connection primitives for tunnel relaying
//!
//! Duplex streams, close notification, the traits a peer session layer must
//! implement, jittered reconnect backoff, and an in-process peer network.

pub mod backoff;
pub mod duplex;
pub mod memory;
pub mod peer;
pub mod signal;
pub mod transport;

pub use backoff::{JitterBackoff, ReconnectConfig, ReconnectError};
pub use duplex::{DuplexStream, StreamError, StreamSink, StreamSource, STREAM_BUFFER};
pub use memory::{MemoryDialer, MemoryNetwork};
pub use peer::{Caller, DialError, PeerConnection, PeerDialer, RpcError, RpcHandler};
pub use signal::{close_signal, CloseSignal, CloseTrigger};
pub use transport::Transport;
