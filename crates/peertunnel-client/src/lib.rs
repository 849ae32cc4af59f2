//! Tunnel client library - Public API
//!
//! Listener lifecycle with automatic portal re-registration, the transport
//! factory a multi-transport host registers, and the node that wires both to
//! a relay service.

pub mod config;
pub mod error;
pub mod events;
pub mod listener;
pub mod node;
pub mod transport;

pub use config::{TunnelConfig, TunnelConfigBuilder};
pub use error::TunnelError;
pub use events::{EventBus, TunnelEvent};
pub use listener::{EngineState, ListenerHandle, ReconnectEngine};
pub use node::TunnelNode;
pub use transport::{TransportInstance, TransportPlugin, TunnelTransport, TunnelTransportInstance};

pub use peertunnel_proto::{PeerId, TunnelAddress};
