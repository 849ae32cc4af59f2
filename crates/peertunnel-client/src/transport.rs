//! Transport factory
//!
//! A multi-transport host registers [`TunnelTransport`] under its name and calls
//! `create` once per configured instance. Each instance can listen (announce to
//! the configured portal and accept tunnels for its instance number), dial
//! tunnel addresses, and parse or print them.

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::listener::{ListenerHandle, ReconnectEngine};
use crate::node::TunnelNode;
use async_trait::async_trait;
use peertunnel_connection::DuplexStream;
use peertunnel_control::InboundCallback;
use peertunnel_proto::{ConnectOpts, PeerId, TunnelAddress, TRANSPORT_NAME};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Transport registered with a multi-transport host
pub trait TransportPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, config: TunnelConfig, instance: u32) -> Box<dyn TransportInstance>;
}

/// One configured instance of a transport
#[async_trait]
pub trait TransportInstance: Send + Sync {
    fn name(&self) -> &'static str;

    /// Visibility classifier
    fn scope(&self) -> &str;

    /// Start listening. Returning `Ok` means the listener is recorded; portal
    /// registration continues in the background.
    async fn server(&self, on_connect: InboundCallback) -> Result<ListenerHandle, TunnelError>;

    /// Open a tunnel to `addr`
    async fn client(&self, addr: &str) -> Result<DuplexStream, TunnelError>;

    fn parse(&self, addr: &str) -> Option<TunnelAddress>;

    /// Address of this instance's listener, once it has a portal
    fn stringify(&self) -> Option<String>;
}

/// The tunnel transport factory
#[derive(Clone)]
pub struct TunnelTransport {
    node: TunnelNode,
}

impl TunnelTransport {
    pub fn new(node: TunnelNode) -> Self {
        Self { node }
    }

    /// Concrete instance, for callers that do not go through the host
    pub fn instance(&self, config: TunnelConfig, instance: u32) -> TunnelTransportInstance {
        TunnelTransportInstance {
            node: self.node.clone(),
            config,
            instance,
            bound_portal: OnceLock::new(),
        }
    }
}

impl TransportPlugin for TunnelTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn create(&self, config: TunnelConfig, instance: u32) -> Box<dyn TransportInstance> {
        Box::new(self.instance(config, instance))
    }
}

pub struct TunnelTransportInstance {
    node: TunnelNode,
    config: TunnelConfig,
    instance: u32,
    bound_portal: OnceLock<PeerId>,
}

impl TunnelTransportInstance {
    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }
}

#[async_trait]
impl TransportInstance for TunnelTransportInstance {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn scope(&self) -> &str {
        self.config.scope()
    }

    async fn server(&self, on_connect: InboundCallback) -> Result<ListenerHandle, TunnelError> {
        if self.node.is_closed() {
            return Err(TunnelError::Shutdown);
        }
        let portal = self
            .config
            .portal
            .clone()
            .ok_or_else(|| TunnelError::ConfigError("no portal configured".into()))?;

        self.node
            .relay()
            .listeners()
            .register(self.instance, on_connect)
            .await;
        if self.bound_portal.set(portal.clone()).is_err() {
            debug!(port = self.instance, "Listener restarted on the same instance");
        }

        let cancel = self.node.shutdown_token().child_token();
        let engine = ReconnectEngine::new(
            self.node.dialer(),
            portal.clone(),
            self.config.reconnect(),
            self.node.events().clone(),
            cancel.clone(),
        );
        let state = engine.state();
        engine.spawn();

        info!(portal = %portal, port = self.instance, "Tunnel listener started");
        Ok(ListenerHandle::new(
            self.instance,
            portal,
            cancel,
            state,
            self.node.events().clone(),
        ))
    }

    async fn client(&self, addr: &str) -> Result<DuplexStream, TunnelError> {
        if self.node.is_closed() {
            return Err(TunnelError::Shutdown);
        }
        let addr = self
            .parse(addr)
            .ok_or_else(|| TunnelError::InvalidAddress(addr.to_string()))?;

        debug!(portal = %addr.portal, "Connecting to portal");
        let portal = match self.node.dialer().dial(&addr.portal).await {
            Ok(portal) => portal,
            Err(e) => {
                warn!(portal = %addr.portal, error = %e, "Failed to connect to portal");
                return Err(e.into());
            }
        };

        debug!(target_id = %addr.target, port = addr.port, "Portal connected, opening tunnel to target");
        let stream = portal.connect(Some(ConnectOpts::from(&addr))).await;
        if let Some(e) = stream.failure() {
            warn!(target_id = %addr.target, error = %e, "Failed to connect to target");
        }
        Ok(stream)
    }

    fn parse(&self, addr: &str) -> Option<TunnelAddress> {
        TunnelAddress::parse_with(addr, self.node.predicate())
    }

    fn stringify(&self) -> Option<String> {
        TunnelAddress::stringify(self.bound_portal.get(), self.node.id(), self.instance)
    }
}
