//! TCP node: accepts sessions on a socket and dials known peers
//!
//! Peers are dialed by identifier through an address book filled from
//! configuration. An already open session to a peer is reused, whichever side
//! opened it.

use crate::error::NetError;
use crate::frame::FrameCodec;
use crate::session::{handshake, Role, Session};
use async_trait::async_trait;
use peertunnel_connection::{DialError, PeerConnection, PeerDialer, RpcHandler};
use peertunnel_proto::PeerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct NodeInner {
    local_id: PeerId,
    handler: Arc<dyn RpcHandler>,
    address_book: RwLock<HashMap<PeerId, SocketAddr>>,
    sessions: Mutex<HashMap<PeerId, Session>>,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
}

/// A peer reachable over TCP
#[derive(Clone)]
pub struct NetNode {
    inner: Arc<NodeInner>,
}

impl NetNode {
    /// Node that only dials out
    pub fn new(local_id: PeerId, handler: Arc<dyn RpcHandler>) -> Self {
        Self::with_addr(local_id, handler, None)
    }

    fn with_addr(
        local_id: PeerId,
        handler: Arc<dyn RpcHandler>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                local_id,
                handler,
                address_book: RwLock::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                local_addr,
            }),
        }
    }

    /// Bind `addr` and serve incoming sessions until [`NetNode::shutdown`]
    pub async fn bind(
        local_id: PeerId,
        handler: Arc<dyn RpcHandler>,
        addr: SocketAddr,
    ) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr).await?;
        let node = Self::with_addr(local_id, handler, Some(listener.local_addr()?));
        info!(
            peer = %node.inner.local_id.short(),
            addr = ?node.inner.local_addr,
            "Listening for peers"
        );

        tokio::spawn(node.clone().accept_loop(listener));
        Ok(node)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.accept(stream).await {
                            warn!("Session setup with {} failed: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
        info!(peer = %self.inner.local_id.short(), "Stopped accepting peers");
    }

    async fn accept(&self, stream: TcpStream) -> Result<(), NetError> {
        let session = self.establish(stream, Role::Acceptor, None).await?;
        debug!(peer = %session.remote_id().short(), "Inbound session ready");
        Ok(())
    }

    async fn establish(
        &self,
        stream: TcpStream,
        role: Role,
        expected: Option<&PeerId>,
    ) -> Result<Session, NetError> {
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, FrameCodec);
        let mut writer = FramedWrite::new(write, FrameCodec);

        let remote = handshake(&mut reader, &mut writer, &self.inner.local_id).await?;
        if let Some(expected) = expected {
            if *expected != remote {
                return Err(NetError::UnexpectedPeer {
                    expected: expected.clone(),
                    actual: remote,
                });
            }
        }
        if remote == self.inner.local_id {
            return Err(NetError::Handshake("connected to self".into()));
        }

        let session = Session::start(
            self.inner.local_id.clone(),
            remote.clone(),
            role,
            reader,
            writer,
            self.inner.handler.clone(),
        );
        self.inner
            .sessions
            .lock()
            .await
            .insert(remote, session.clone());
        Ok(session)
    }

    /// Record where `peer` can be reached
    pub async fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.inner.address_book.write().await.insert(peer, addr);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Number of open sessions
    pub async fn session_count(&self) -> usize {
        let mut sessions = self.inner.sessions.lock().await;
        sessions.retain(|_, s| !s.is_closed());
        sessions.len()
    }

    /// Stop accepting and close every open session
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let sessions: Vec<Session> = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close();
        }
    }
}

#[async_trait]
impl PeerDialer for NetNode {
    fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    async fn dial(&self, peer: &PeerId) -> Result<Arc<dyn PeerConnection>, DialError> {
        if *peer == self.inner.local_id {
            return Err(DialError::Handshake("refusing to dial self".into()));
        }
        if let Some(session) = self.inner.sessions.lock().await.get(peer) {
            if !session.is_closed() {
                return Ok(Arc::new(session.clone()));
            }
        }

        let addr = self
            .inner
            .address_book
            .read()
            .await
            .get(peer)
            .copied()
            .ok_or_else(|| DialError::UnknownPeer(peer.clone()))?;

        debug!(peer = %peer.short(), %addr, "Dialing peer");
        let stream = TcpStream::connect(addr).await?;
        let session = self.establish(stream, Role::Dialer, Some(peer)).await?;
        Ok(Arc::new(session))
    }
}
