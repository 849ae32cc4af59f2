//! Portal side of the tunnel protocol
//!
//! Tracks announced endpoints and local listeners, and serves the portal
//! methods that broker tunnels between peers.
pub mod endpoint_registry;
pub mod listener_table;
pub mod relay;

pub use endpoint_registry::{EndpointRegistry, RegisteredEndpoint};
pub use listener_table::{InboundCallback, ListenerTable};
pub use relay::RelayService;
