//! Portal RPC surface: method manifest, permissions and connect options

use crate::address::TunnelAddress;
use crate::peer::PeerId;
use serde::{Deserialize, Serialize};

/// Forwarding stops once a connect request has been relayed this many times
pub const MAX_FORWARD_HOPS: u8 = 8;

/// Options of a `connect` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOpts {
    pub target: PeerId,
    pub port: u32,
    /// Number of portals that already forwarded this request
    #[serde(default)]
    pub hops: u8,
}

impl ConnectOpts {
    pub fn new(target: PeerId, port: u32) -> Self {
        Self {
            target,
            port,
            hops: 0,
        }
    }

    /// Options to hand to the next portal, or `None` when the hop budget is spent
    pub fn forwarded(&self) -> Option<Self> {
        if self.hops >= MAX_FORWARD_HOPS {
            return None;
        }
        Some(Self {
            target: self.target.clone(),
            port: self.port,
            hops: self.hops + 1,
        })
    }
}

impl From<&TunnelAddress> for ConnectOpts {
    fn from(addr: &TunnelAddress) -> Self {
        Self::new(addr.target.clone(), addr.port)
    }
}

/// Call style of an RPC method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    /// Single request, single reply
    Sync,
    /// Request answered by a bidirectional stream
    Duplex,
}

/// Methods exposed by a portal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcMethod {
    Announce,
    Connect,
    Ping,
    List,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 4] = [
        RpcMethod::Announce,
        RpcMethod::Connect,
        RpcMethod::Ping,
        RpcMethod::List,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RpcMethod::Announce => "announce",
            RpcMethod::Connect => "connect",
            RpcMethod::Ping => "ping",
            RpcMethod::List => "list",
        }
    }

    pub fn kind(&self) -> CallKind {
        match self {
            RpcMethod::Connect => CallKind::Duplex,
            RpcMethod::Announce | RpcMethod::Ping | RpcMethod::List => CallKind::Sync,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Method manifest as `(name, kind)` pairs
    pub fn manifest() -> impl Iterator<Item = (&'static str, CallKind)> {
        Self::ALL.into_iter().map(|m| (m.name(), m.kind()))
    }
}

/// Set of methods a class of callers may invoke
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permissions {
    allowed: Vec<RpcMethod>,
}

impl Permissions {
    /// Permissions granted to callers the host does not know.
    /// The portal is open to anyone, so every method is allowed.
    pub fn anonymous() -> Self {
        Self {
            allowed: RpcMethod::ALL.to_vec(),
        }
    }

    pub fn none() -> Self {
        Self {
            allowed: Vec::new(),
        }
    }

    pub fn allow(mut self, method: RpcMethod) -> Self {
        if !self.allowed.contains(&method) {
            self.allowed.push(method);
        }
        self
    }

    pub fn allows(&self, method: RpcMethod) -> bool {
        self.allowed.contains(&method)
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::anonymous()
    }
}
