//! Peer identifiers
//!
//! Peers are named by their public key: `@` followed by the base64 encoding of a
//! 32 byte ed25519 key and the `.ed25519` suffix. The validity check is exposed as
//! a plain predicate so that hosts using another identifier format can supply
//! their own when parsing addresses.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Leading character of a peer identifier
pub const PEER_ID_SIGIL: char = '@';

/// Key type suffix of a peer identifier
pub const PEER_ID_SUFFIX: &str = ".ed25519";

const PUBLIC_KEY_LEN: usize = 32;

/// Validity predicate for peer identifiers
pub type PeerIdPredicate = fn(&str) -> bool;

/// Returned when a string does not satisfy the peer-id predicate
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid peer id: {0}")]
pub struct InvalidPeerId(pub String);

/// Default peer-id predicate: `@<base64 32 bytes>.ed25519`
pub fn is_feed_id(candidate: &str) -> bool {
    let Some(key) = candidate
        .strip_prefix(PEER_ID_SIGIL)
        .and_then(|rest| rest.strip_suffix(PEER_ID_SUFFIX))
    else {
        return false;
    };

    matches!(STANDARD.decode(key), Ok(bytes) if bytes.len() == PUBLIC_KEY_LEN)
}

/// Identifier of a peer in the gossip network
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Parse with a host-supplied validity predicate
    pub fn parse_with(candidate: &str, is_valid: PeerIdPredicate) -> Result<Self, InvalidPeerId> {
        if is_valid(candidate) {
            Ok(Self(candidate.to_string()))
        } else {
            Err(InvalidPeerId(candidate.to_string()))
        }
    }

    /// Build an identifier from raw public key bytes
    pub fn from_public_key(key: &[u8; PUBLIC_KEY_LEN]) -> Self {
        Self(format!(
            "{}{}{}",
            PEER_ID_SIGIL,
            STANDARD.encode(key),
            PEER_ID_SUFFIX
        ))
    }

    /// Random identifier, used for ephemeral nodes and tests
    pub fn generate() -> Self {
        let mut key = [0u8; PUBLIC_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self::from_public_key(&key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        let end = self.0.len().min(9);
        &self.0[..end]
    }
}

impl FromStr for PeerId {
    type Err = InvalidPeerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with(s, is_feed_id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
