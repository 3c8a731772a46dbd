//! How a freshly started node finds an existing cluster.
//!
//! Exactly one strategy runs per process, picked from configuration:
//! - `broadcast`: UDP HELLO on the local subnet, answered by the leader
//! - `directory`: query a service directory for healthy peers, with retry
//!
//! Either way the result is a `DiscoveryOutcome`. `Promoted` means nobody was
//! found and this node should seed a new single-member cluster.

pub mod broadcast;
pub mod directory;

pub use broadcast::BroadcastDiscovery;
pub use directory::DirectoryDiscovery;

use scout_core::ClusterError;
use std::net::IpAddr;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What discovery decided.
#[derive(Debug)]
pub enum DiscoveryOutcome {
    /// Joined the cluster through this peer.
    Joined(IpAddr),
    /// A peer was found but joining it failed. The node stays on its own and
    /// does not bootstrap.
    JoinFailed { remote: IpAddr, error: ClusterError },
    /// Nobody answered; this node seeds a new cluster.
    Promoted,
}

impl DiscoveryOutcome {
    pub fn is_promoted(&self) -> bool {
        matches!(self, Self::Promoted)
    }
}

/// Result of a discovery run, plus any listener left running for later nodes.
pub struct DiscoveryRun {
    pub outcome: DiscoveryOutcome,
    pub listener: Option<JoinHandle<()>>,
}

pub enum Discovery {
    Broadcast(BroadcastDiscovery),
    Directory(DirectoryDiscovery),
}

impl Discovery {
    /// Run the configured strategy to completion.
    ///
    /// Only fails when the broadcast socket cannot be bound.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> scout_core::Result<DiscoveryRun> {
        match self {
            Self::Broadcast(broadcast) => broadcast.run(shutdown).await,
            Self::Directory(directory) => Ok(DiscoveryRun {
                outcome: directory.run().await,
                listener: None,
            }),
        }
    }
}
