//! A running tunnel node: one relay service, one dialer, shared events and a
//! node-wide shutdown that halts every listener.

use crate::error::TunnelError;
use crate::events::{EventBus, TunnelEvent};
use crate::transport::TunnelTransport;
use peertunnel_connection::{PeerDialer, RpcHandler};
use peertunnel_control::RelayService;
use peertunnel_proto::{is_feed_id, PeerId, PeerIdPredicate};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct NodeInner {
    dialer: Arc<dyn PeerDialer>,
    relay: Arc<RelayService>,
    events: EventBus,
    shutdown: CancellationToken,
    predicate: PeerIdPredicate,
}

/// Handle to a running tunnel node
#[derive(Clone)]
pub struct TunnelNode {
    inner: Arc<NodeInner>,
}

impl TunnelNode {
    /// The relay service must belong to the same peer the dialer dials from
    pub fn new(dialer: Arc<dyn PeerDialer>, relay: Arc<RelayService>) -> Result<Self, TunnelError> {
        Self::with_predicate(dialer, relay, is_feed_id)
    }

    pub fn with_predicate(
        dialer: Arc<dyn PeerDialer>,
        relay: Arc<RelayService>,
        predicate: PeerIdPredicate,
    ) -> Result<Self, TunnelError> {
        if dialer.local_id() != relay.local_id() {
            return Err(TunnelError::ConfigError(format!(
                "relay service belongs to {} but dialer to {}",
                relay.local_id(),
                dialer.local_id()
            )));
        }
        Ok(Self {
            inner: Arc::new(NodeInner {
                dialer,
                relay,
                events: EventBus::new(),
                shutdown: CancellationToken::new(),
                predicate,
            }),
        })
    }

    pub fn id(&self) -> &PeerId {
        self.inner.dialer.local_id()
    }

    pub fn dialer(&self) -> Arc<dyn PeerDialer> {
        self.inner.dialer.clone()
    }

    pub fn relay(&self) -> &Arc<RelayService> {
        &self.inner.relay
    }

    /// The node's relay service as a session layer handler
    pub fn handler(&self) -> Arc<dyn RpcHandler> {
        self.inner.relay.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    pub fn predicate(&self) -> PeerIdPredicate {
        self.inner.predicate
    }

    /// Transport factory bound to this node
    pub fn transport(&self) -> TunnelTransport {
        TunnelTransport::new(self.clone())
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Halt every listener started from this node
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!(node = %self.id(), "Shutting down tunnel node");
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
