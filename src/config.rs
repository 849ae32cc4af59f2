//! Node configuration file
//!
//! ```yaml
//! identity: "@...=.ed25519"
//! listen: 0.0.0.0:8008
//! portal: "@...=.ed25519"
//! logging: true
//! peers:
//!   "@...=.ed25519": 203.0.113.7:8008
//! ```

use anyhow::{Context, Result};
use peertunnel_proto::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFile {
    /// This node's peer id; generated on each start when absent
    pub identity: Option<PeerId>,

    pub listen: Option<SocketAddr>,

    /// Portal used by `expose`, `ping` and `list`
    pub portal: Option<PeerId>,

    pub logging: bool,

    /// Address book of known peers
    pub peers: HashMap<PeerId, SocketAddr>,
}

impl NodeFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file: NodeFile = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        file.validate()?;
        Ok(file)
    }

    /// Peer ids deserialize unchecked
    fn validate(&self) -> Result<()> {
        let ids = self
            .identity
            .iter()
            .chain(self.portal.iter())
            .chain(self.peers.keys());
        for id in ids {
            id.as_str()
                .parse::<PeerId>()
                .with_context(|| format!("Invalid peer id in config: {}", id))?;
        }
        Ok(())
    }
}

/// Parse a `<peer id>=<socket address>` pair
pub fn parse_peer(s: &str) -> Result<(PeerId, SocketAddr), String> {
    let (id, addr) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected <peer id>=<address>, got {}", s))?;
    let id = id.parse::<PeerId>().map_err(|e| e.to_string())?;
    let addr = addr
        .parse::<SocketAddr>()
        .map_err(|e| format!("invalid address {}: {}", addr, e))?;
    Ok((id, addr))
}
