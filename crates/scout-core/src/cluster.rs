//! Capabilities the cluster control plane is built from.
//!
//! Implementations:
//! - `ConsensusStore` (in scout-daemon) - openraft on a redb log
//! - `Gossip` (in scout-daemon) - UDP SWIM overlay
//! - `ConsulDirectory`, `CouchbaseAdmin` (in scout-daemon) - HTTP adapters
//! - `memory::*` - in-process versions for tests

use crate::address::{ConsensusAddress, NodeIdentity};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Voting rights of a server in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Suffrage {
    Voter,
    Nonvoter,
}

/// One entry of the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub address: ConsensusAddress,
    pub suffrage: Suffrage,
}

impl Server {
    pub fn voter(address: ConsensusAddress) -> Self {
        Self {
            address,
            suffrage: Suffrage::Voter,
        }
    }
}

/// Snapshot of the consensus membership, ordered by address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub servers: Vec<Server>,
}

impl ClusterConfiguration {
    pub fn new(mut servers: Vec<Server>) -> Self {
        servers.sort_by(|a, b| a.address.cmp(&b.address));
        servers.dedup_by(|a, b| a.address == b.address);
        Self { servers }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn contains(&self, address: &ConsensusAddress) -> bool {
        self.servers.iter().any(|s| &s.address == address)
    }

    pub fn is_voter(&self, address: &ConsensusAddress) -> bool {
        self.servers
            .iter()
            .any(|s| &s.address == address && s.suffrage == Suffrage::Voter)
    }

    pub fn voters(&self) -> impl Iterator<Item = &ConsensusAddress> {
        self.servers
            .iter()
            .filter(|s| s.suffrage == Suffrage::Voter)
            .map(|s| &s.address)
    }
}

/// The replicated consensus engine, seen from the control plane.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// This node's address in the configuration.
    fn local_address(&self) -> &ConsensusAddress;

    /// True iff a leadership verification round succeeds. Never errors.
    async fn is_leader(&self) -> bool;

    /// Time since a leader last replicated to this node. Counted from engine
    /// construction while no leader has been heard.
    async fn last_leader_contact(&self) -> Duration;

    /// Current membership snapshot.
    async fn configuration(&self) -> ClusterConfiguration;

    /// Whether durable state already holds a configuration.
    async fn is_initialized(&self) -> bool;

    /// Seed a single-member configuration naming only this node.
    ///
    /// Errors when durable state already exists.
    async fn bootstrap(&self) -> Result<()>;

    /// Add `address` as voter. No-op if it already is one.
    async fn add_voter(&self, address: &ConsensusAddress) -> Result<()>;

    /// Remove `address`. No-op if absent.
    async fn remove_server(&self, address: &ConsensusAddress) -> Result<()>;

    /// Tear the engine down and recover as a single-member cluster.
    async fn reset(&self) -> Result<()>;
}

/// The gossip overlay.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Join through the given seeds. Returns how many seeds answered.
    async fn join(&self, seeds: &[SocketAddr]) -> Result<usize>;
}

/// Admin surface of the external data service.
#[async_trait]
pub trait DataService: Send + Sync {
    /// Ask the node at `address` (`host:port`) to add us to its cluster.
    async fn add_node(&self, address: &str) -> Result<()>;
}

/// Service directory used for discovery.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Publish this node, with a health check, under the configured service name.
    async fn register_self(&self, identity: &NodeIdentity) -> Result<()>;

    /// Addresses of instances currently passing their health checks.
    async fn list_healthy_peers(&self) -> Result<Vec<IpAddr>>;
}
