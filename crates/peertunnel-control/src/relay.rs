//! Portal methods: announce, connect, ping and list
//!
//! `connect` resolves in this order:
//! 1. the target is another peer that announced itself here: forward the
//!    request over its connection and hand back whatever it returns
//! 2. the target is this node and a listener owns the port: create a stream
//!    pair, give one end to the listener and return the other
//! 3. otherwise: a stream that fails with "could not connect to"
//!
//! Failures are always delivered through the returned stream.

use crate::endpoint_registry::EndpointRegistry;
use crate::listener_table::ListenerTable;
use async_trait::async_trait;
use peertunnel_connection::{Caller, DuplexStream, RpcError, RpcHandler, StreamError};
use peertunnel_proto::{ConnectOpts, PeerId};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Relay service owned by one running node
pub struct RelayService {
    local_id: PeerId,
    endpoints: EndpointRegistry,
    listeners: ListenerTable,
    last_ping: AtomicU64,
}

impl RelayService {
    /// Service with fresh, empty tables
    pub fn new(local_id: PeerId) -> Self {
        Self::with_tables(local_id, EndpointRegistry::new(), ListenerTable::new())
    }

    pub fn with_tables(
        local_id: PeerId,
        endpoints: EndpointRegistry,
        listeners: ListenerTable,
    ) -> Self {
        Self {
            local_id,
            endpoints,
            listeners,
            last_ping: AtomicU64::new(0),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn listeners(&self) -> &ListenerTable {
        &self.listeners
    }

    async fn forward(&self, opts: &ConnectOpts) -> Option<DuplexStream> {
        // A node that announced to itself would only bounce the request back
        if opts.target == self.local_id {
            return None;
        }
        let endpoint = self.endpoints.get(&opts.target).await?;

        let Some(next) = opts.forwarded() else {
            warn!(
                target_id = %opts.target,
                hops = opts.hops,
                "Refusing to forward tunnel request: hop limit reached"
            );
            return Some(DuplexStream::failed(StreamError::ConnectFailed(format!(
                "hop limit reached forwarding to: {}",
                opts.target
            ))));
        };

        debug!(target_id = %opts.target, port = opts.port, hops = next.hops, "Forwarding tunnel request");
        Some(endpoint.connect(Some(next)).await)
    }

    async fn satisfy_locally(&self, opts: &ConnectOpts) -> Option<DuplexStream> {
        if opts.target != self.local_id {
            return None;
        }
        let callback = self.listeners.get(opts.port).await?;

        let (inbound, outbound) = DuplexStream::pair();
        debug!(port = opts.port, "Tunnel request satisfied by local listener");
        callback(inbound);
        Some(outbound)
    }
}

#[async_trait]
impl RpcHandler for RelayService {
    async fn announce(&self, caller: Caller) -> Result<(), RpcError> {
        info!(endpoint = %caller.id, "Received endpoint announcement");
        self.endpoints.announce(caller.id, caller.connection).await;
        Ok(())
    }

    async fn connect(&self, caller: &PeerId, opts: Option<ConnectOpts>) -> DuplexStream {
        let Some(opts) = opts else {
            warn!(caller = %caller, "Tunnel request without options");
            return DuplexStream::failed(StreamError::missing_opts());
        };

        debug!(caller = %caller, target_id = %opts.target, port = opts.port, "Received tunnel request");

        if let Some(stream) = self.forward(&opts).await {
            return stream;
        }
        if let Some(stream) = self.satisfy_locally(&opts).await {
            return stream;
        }

        debug!(target_id = %opts.target, port = opts.port, "No route for tunnel request");
        DuplexStream::failed(StreamError::could_not_connect(&opts.target))
    }

    /// Milliseconds since the epoch, never lower than a previous reply
    async fn ping(&self) -> Result<u64, RpcError> {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let previous = self.last_ping.fetch_max(now, Ordering::SeqCst);
        Ok(previous.max(now))
    }

    async fn list(&self) -> Result<Vec<PeerId>, RpcError> {
        Ok(self.endpoints.ids().await)
    }
}
