//! Tunnel address codec
//!
//! A tunnel address names a listening channel on a target peer together with the
//! portal that relays to it: `tunnel:<portal>:<target>:<port>`.
//!
//! Parsing never fails loudly. Anything that is not a well formed tunnel address
//! yields `None` so that a multi-transport host can fall through to its other
//! transports.

use crate::peer::{is_feed_id, PeerId, PeerIdPredicate};
use crate::TRANSPORT_NAME;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Address errors, only produced by the `FromStr` convenience impl
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Not a tunnel address: {0}")]
    Invalid(String),
}

/// A parsed tunnel address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelAddress {
    pub portal: PeerId,
    pub target: PeerId,
    pub port: u32,
}

/// Structured form of an address, as handed over by hosts that keep addresses
/// as records rather than strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub name: String,
    pub portal: String,
    pub target: String,
    pub port: i64,
}

/// Input accepted by [`TunnelAddress::parse`]
#[derive(Debug, Clone, Copy)]
pub enum AddressInput<'a> {
    Text(&'a str),
    Record(&'a AddressRecord),
}

impl<'a> From<&'a str> for AddressInput<'a> {
    fn from(value: &'a str) -> Self {
        AddressInput::Text(value)
    }
}

impl<'a> From<&'a String> for AddressInput<'a> {
    fn from(value: &'a String) -> Self {
        AddressInput::Text(value.as_str())
    }
}

impl<'a> From<&'a AddressRecord> for AddressInput<'a> {
    fn from(value: &'a AddressRecord) -> Self {
        AddressInput::Record(value)
    }
}

impl TunnelAddress {
    pub fn new(portal: PeerId, target: PeerId, port: u32) -> Self {
        Self {
            portal,
            target,
            port,
        }
    }

    /// Parse using the default peer-id predicate
    pub fn parse<'a>(input: impl Into<AddressInput<'a>>) -> Option<Self> {
        Self::parse_with(input, is_feed_id)
    }

    /// Parse using a host-supplied peer-id predicate
    ///
    /// The port field is permissive: a missing or non-numeric port becomes 0.
    /// A number that is not a valid `u32` (negative, fractional, too large)
    /// is rejected, as is every other malformed field.
    pub fn parse_with<'a>(
        input: impl Into<AddressInput<'a>>,
        is_valid: PeerIdPredicate,
    ) -> Option<Self> {
        match input.into() {
            AddressInput::Text(text) => {
                let mut parts = text.split(':');
                if parts.next()? != TRANSPORT_NAME {
                    return None;
                }
                let portal = PeerId::parse_with(parts.next()?, is_valid).ok()?;
                let target = PeerId::parse_with(parts.next()?, is_valid).ok()?;
                let port = parse_port(parts.next())?;

                Some(Self::new(portal, target, port))
            }
            AddressInput::Record(record) => {
                if record.name != TRANSPORT_NAME {
                    return None;
                }
                let portal = PeerId::parse_with(&record.portal, is_valid).ok()?;
                let target = PeerId::parse_with(&record.target, is_valid).ok()?;
                let port = u32::try_from(record.port).ok()?;

                Some(Self::new(portal, target, port))
            }
        }
    }

    /// Address advertised by a listener, or `None` while it has no portal bound
    pub fn stringify(portal: Option<&PeerId>, local: &PeerId, port: u32) -> Option<String> {
        portal.map(|portal| Self::new(portal.clone(), local.clone(), port).to_string())
    }

    pub fn to_record(&self) -> AddressRecord {
        AddressRecord {
            name: TRANSPORT_NAME.to_string(),
            portal: self.portal.to_string(),
            target: self.target.to_string(),
            port: i64::from(self.port),
        }
    }
}

fn parse_port(field: Option<&str>) -> Option<u32> {
    let field = match field {
        Some(field) => field.trim(),
        None => return Some(0),
    };
    match field.parse::<u32>() {
        Ok(port) => Some(port),
        Err(_) if field.parse::<f64>().map_or(false, f64::is_finite) => None,
        Err(_) => Some(0),
    }
}

impl fmt::Display for TunnelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            TRANSPORT_NAME, self.portal, self.target, self.port
        )
    }
}

impl FromStr for TunnelAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| AddressError::Invalid(s.to_string()))
    }
}
