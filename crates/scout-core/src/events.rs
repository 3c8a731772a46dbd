//! Membership events emitted by the gossip layer.
//!
//! Each event is consumed exactly once by the reconciler and never persisted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// What happened to the members of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    /// Member appeared (or came back after failing).
    Join,
    /// Member left gracefully.
    Leave,
    /// Member stopped answering probes.
    Failed,
    /// Failed or departed member forgotten after the reap window.
    Reap,
}

impl EventType {
    /// Whether this event should shrink the voter set.
    pub fn is_departure(self) -> bool {
        !matches!(self, Self::Join)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Failed => "failed",
            Self::Reap => "reap",
        };
        f.write_str(s)
    }
}

/// A member as reported by gossip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GossipMember {
    pub name: String,
    pub addr: IpAddr,
    /// Gossip port of the member.
    pub port: u16,
}

impl GossipMember {
    pub fn new(name: impl Into<String>, gossip_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr: gossip_addr.ip(),
            port: gossip_addr.port(),
        }
    }
}

/// One membership change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub kind: EventType,
    pub members: Vec<GossipMember>,
}

impl MembershipEvent {
    pub fn new(kind: EventType, members: Vec<GossipMember>) -> Self {
        Self { kind, members }
    }

    pub fn join(members: Vec<GossipMember>) -> Self {
        Self::new(EventType::Join, members)
    }
}
