//! Gossip wire messages.
//!
//! Sent as JSON datagrams. Membership updates ride along on ping/ack traffic.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A gossip participant: unique name plus the UDP address it gossips on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub name: String,
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

/// Gossip protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GossipMessage {
    /// Ask a seed to let us in.
    Join { node: NodeInfo, incarnation: u64 },

    /// Seed's answer to `Join`: the current live membership.
    JoinAck { members: Vec<GossipUpdate> },

    /// Periodic probe with piggybacked gossip.
    Ping {
        seq: u64,
        from: String,
        gossip: Vec<GossipUpdate>,
    },

    /// Probe answer with piggybacked gossip.
    Ack {
        seq: u64,
        from: String,
        gossip: Vec<GossipUpdate>,
    },

    /// Ask the recipient to probe `target` on our behalf.
    PingReq { seq: u64, target: NodeInfo },

    /// Result of an indirect probe.
    PingReqAck {
        seq: u64,
        target: String,
        alive: bool,
    },

    /// Graceful departure.
    Leave { name: String, incarnation: u64 },
}

impl GossipMessage {
    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Try to parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    /// Gossip updates this message carries, if any.
    pub fn gossip(&self) -> &[GossipUpdate] {
        match self {
            Self::Ping { gossip, .. } | Self::Ack { gossip, .. } => gossip,
            Self::JoinAck { members } => members,
            _ => &[],
        }
    }
}

/// Membership state change, spread epidemically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GossipUpdate {
    /// Node is alive (join or refute suspicion).
    Alive { node: NodeInfo, incarnation: u64 },

    /// Node stopped answering probes.
    Suspect { name: String, incarnation: u64 },

    /// Node failed to refute suspicion.
    Dead { name: String, incarnation: u64 },

    /// Node left on purpose.
    Left { name: String, incarnation: u64 },
}

impl GossipUpdate {
    pub fn alive(node: NodeInfo, incarnation: u64) -> Self {
        Self::Alive { node, incarnation }
    }

    pub fn suspect(name: impl Into<String>, incarnation: u64) -> Self {
        Self::Suspect {
            name: name.into(),
            incarnation,
        }
    }

    pub fn dead(name: impl Into<String>, incarnation: u64) -> Self {
        Self::Dead {
            name: name.into(),
            incarnation,
        }
    }

    pub fn left(name: impl Into<String>, incarnation: u64) -> Self {
        Self::Left {
            name: name.into(),
            incarnation,
        }
    }

    /// Name of the node this update is about.
    pub fn name(&self) -> &str {
        match self {
            Self::Alive { node, .. } => &node.name,
            Self::Suspect { name, .. } | Self::Dead { name, .. } | Self::Left { name, .. } => name,
        }
    }
}
