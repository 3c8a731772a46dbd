//! Node addressing.
//!
//! A node is known to the consensus layer by its `host:port` string. The raft
//! engine wants a numeric id, so the address is hashed with FNV-1a. The hash
//! is stable across processes and toolchains, so every node derives the same
//! id for the same address without coordination.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Invalid consensus address {0:?}: expected host:port")]
    InvalidFormat(String),
    #[error("Invalid port in {0:?}")]
    InvalidPort(String),
}

/// Numeric id used by the consensus engine.
pub type NodeId = u64;

/// `host:port` of a node's consensus transport. Doubles as its identity in the
/// cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsensusAddress(String);

impl ConsensusAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable numeric id for this address.
    pub fn node_id(&self) -> NodeId {
        fnv1a_hash(&self.0)
    }

    pub fn port(&self) -> Option<u16> {
        split_host_port(&self.0).and_then(|(_, port)| port.parse().ok())
    }

    /// Host part (without brackets for IPv6).
    pub fn host(&self) -> &str {
        let (host, _) = split_host_port(&self.0).unwrap_or((&self.0, ""));
        host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl Display for ConsensusAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConsensusAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) =
            split_host_port(s).ok_or_else(|| AddressError::InvalidFormat(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressError::InvalidFormat(s.to_string()));
        }
        port.parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
        Ok(Self(s.to_string()))
    }
}

impl From<SocketAddr> for ConsensusAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl Serialize for ConsensusAddress {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ConsensusAddress {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn split_host_port(s: &str) -> Option<(&str, &str)> {
    s.rsplit_once(':')
}

/// FNV-1a, 64 bit.
/// Stable across Rust versions (unlike DefaultHasher).
fn fnv1a_hash(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Who this process is on the network. Resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub hostname: String,
    pub ip: IpAddr,
}

impl NodeIdentity {
    pub fn new(hostname: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            hostname: hostname.into(),
            ip,
        }
    }

    /// Consensus address of this node for the given raft port.
    pub fn consensus_address(&self, raft_port: u16) -> ConsensusAddress {
        ConsensusAddress::new(self.ip, raft_port)
    }
}
