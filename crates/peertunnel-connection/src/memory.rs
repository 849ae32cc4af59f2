//! In-process peer network
//!
//! Peers join a shared [`MemoryNetwork`] with the handler that serves their
//! portal methods. Dialing a peer yields a link that invokes the remote
//! handler directly. Peers can be made unreachable and their links severed,
//! which fires the close signal on both ends.

use crate::duplex::{DuplexStream, StreamError};
use crate::peer::{Caller, DialError, PeerConnection, PeerDialer, RpcError, RpcHandler};
use crate::signal::{close_signal, CloseSignal, CloseTrigger};
use async_trait::async_trait;
use peertunnel_proto::{ConnectOpts, PeerId, RpcMethod};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

struct MemoryPeer {
    handler: Arc<dyn RpcHandler>,
    reachable: bool,
    links: Vec<CloseTrigger>,
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<PeerId, MemoryPeer>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer serving `handler` and return its dialer.
    /// Rejoining with the same id replaces the handler.
    pub async fn join(&self, id: PeerId, handler: Arc<dyn RpcHandler>) -> MemoryDialer {
        let mut peers = self.peers.lock().await;
        debug!(peer = %id, "Peer joined memory network");
        peers.insert(
            id.clone(),
            MemoryPeer {
                handler,
                reachable: true,
                links: Vec::new(),
            },
        );
        MemoryDialer {
            local_id: id,
            network: self.clone(),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Unreachable peers refuse new dials; existing links stay up
    pub async fn set_reachable(&self, id: &PeerId, reachable: bool) {
        if let Some(peer) = self.peers.lock().await.get_mut(id) {
            peer.reachable = reachable;
        }
    }

    /// Close every link to or from `id`
    pub async fn sever(&self, id: &PeerId) {
        let links = match self.peers.lock().await.get_mut(id) {
            Some(peer) => std::mem::take(&mut peer.links),
            None => return,
        };
        debug!(peer = %id, links = links.len(), "Severing links");
        for link in links {
            link.close();
        }
    }

    /// Number of open links involving `id`
    pub async fn link_count(&self, id: &PeerId) -> usize {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(id) {
            Some(peer) => {
                peer.links.retain(|l| !l.is_closed());
                peer.links.len()
            }
            None => 0,
        }
    }

    async fn open_link(&self, from: &PeerId, to: &PeerId) -> Result<MemoryLink, DialError> {
        let mut peers = self.peers.lock().await;

        let remote = peers
            .get(to)
            .ok_or_else(|| DialError::UnknownPeer(to.clone()))?;
        if !remote.reachable {
            return Err(DialError::Unreachable(to.clone()));
        }
        let remote_handler = remote.handler.clone();

        let local_handler = peers
            .get(from)
            .map(|p| p.handler.clone())
            .ok_or_else(|| DialError::Handshake(format!("{} has not joined", from)))?;

        let (trigger, _) = close_signal();
        for id in [from, to] {
            if let Some(peer) = peers.get_mut(id) {
                peer.links.retain(|l| !l.is_closed());
                peer.links.push(trigger.clone());
            }
        }

        Ok(MemoryLink {
            local_id: from.clone(),
            remote_id: to.clone(),
            local_handler,
            remote_handler,
            trigger,
        })
    }
}

/// Dialer bound to one member of a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryDialer {
    local_id: PeerId,
    network: MemoryNetwork,
    attempts: Arc<AtomicUsize>,
}

impl MemoryDialer {
    /// Dial attempts made so far, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl PeerDialer for MemoryDialer {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn dial(&self, peer: &PeerId) -> Result<Arc<dyn PeerConnection>, DialError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let link = self.network.open_link(&self.local_id, peer).await?;
        Ok(Arc::new(link))
    }
}

/// One direction of a link between two members
struct MemoryLink {
    local_id: PeerId,
    remote_id: PeerId,
    local_handler: Arc<dyn RpcHandler>,
    remote_handler: Arc<dyn RpcHandler>,
    trigger: CloseTrigger,
}

impl MemoryLink {
    /// Same link seen from the other end
    fn reverse(&self) -> MemoryLink {
        MemoryLink {
            local_id: self.remote_id.clone(),
            remote_id: self.local_id.clone(),
            local_handler: self.remote_handler.clone(),
            remote_handler: self.local_handler.clone(),
            trigger: self.trigger.clone(),
        }
    }

    fn check(&self, method: RpcMethod) -> Result<(), RpcError> {
        if self.trigger.is_closed() {
            return Err(RpcError::Closed);
        }
        self.remote_handler.authorize(&self.local_id, method)
    }
}

#[async_trait]
impl PeerConnection for MemoryLink {
    fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    async fn announce(&self) -> Result<(), RpcError> {
        self.check(RpcMethod::Announce)?;
        let caller = Caller {
            id: self.local_id.clone(),
            connection: Arc::new(self.reverse()),
        };
        self.remote_handler.announce(caller).await
    }

    async fn connect(&self, opts: Option<ConnectOpts>) -> DuplexStream {
        match self.check(RpcMethod::Connect) {
            Ok(()) => self.remote_handler.connect(&self.local_id, opts).await,
            Err(RpcError::Closed) => DuplexStream::failed(StreamError::Closed),
            Err(err) => DuplexStream::failed(StreamError::PermissionDenied(err.to_string())),
        }
    }

    async fn ping(&self) -> Result<u64, RpcError> {
        self.check(RpcMethod::Ping)?;
        self.remote_handler.ping().await
    }

    async fn list(&self) -> Result<Vec<PeerId>, RpcError> {
        self.check(RpcMethod::List)?;
        self.remote_handler.list().await
    }

    fn close_signal(&self) -> CloseSignal {
        self.trigger.signal()
    }

    fn close(&self) {
        self.trigger.close();
    }
}
