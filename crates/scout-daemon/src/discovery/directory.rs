//! Directory lookup with bounded retry.
//!
//! Each attempt asks the directory for healthy peers and picks one at random,
//! never ourselves. The first pick is joined. A node that runs out of attempts
//! registers itself so later nodes can find it, then promotes itself.

use super::DiscoveryOutcome;
use crate::coordinator::ClusterJoiner;
use rand::seq::IndexedRandom;
use scout_core::{NodeIdentity, PeerDirectory};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct DirectoryDiscovery {
    directory: Arc<dyn PeerDirectory>,
    joiner: Arc<ClusterJoiner>,
    identity: NodeIdentity,
    attempts: u32,
    backoff: Duration,
}

impl DirectoryDiscovery {
    pub fn new(
        directory: Arc<dyn PeerDirectory>,
        joiner: Arc<ClusterJoiner>,
        identity: NodeIdentity,
        attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            directory,
            joiner,
            identity,
            attempts,
            backoff,
        }
    }

    pub async fn run(&self) -> DiscoveryOutcome {
        let Some(remote) = self.find_peer().await else {
            info!(
                "No peer found after {} attempt(s), registering and promoting self",
                self.attempts
            );
            self.register().await;
            return DiscoveryOutcome::Promoted;
        };

        match self.joiner.join_cluster(remote).await {
            Ok(()) => {
                info!("Joined cluster through {}", remote);
                // Listed for the nodes that come after us
                self.register().await;
                DiscoveryOutcome::Joined(remote)
            }
            Err(error) => {
                error!("Found cluster at {} but could not join: {}", remote, error);
                DiscoveryOutcome::JoinFailed { remote, error }
            }
        }
    }

    async fn find_peer(&self) -> Option<IpAddr> {
        for attempt in 1..=self.attempts {
            match self.directory.list_healthy_peers().await {
                Ok(peers) => {
                    if let Some(peer) = pick_peer(&peers, self.identity.ip) {
                        info!(
                            "Directory attempt {}/{}: picked {} of {} peer(s)",
                            attempt,
                            self.attempts,
                            peer,
                            peers.len()
                        );
                        return Some(peer);
                    }
                    info!(
                        "Directory attempt {}/{}: no other healthy peers",
                        attempt, self.attempts
                    );
                }
                Err(e) => warn!(
                    "Directory attempt {}/{} failed: {}",
                    attempt, self.attempts, e
                ),
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.backoff).await;
            }
        }
        None
    }

    async fn register(&self) {
        if let Err(e) = self.directory.register_self(&self.identity).await {
            warn!("Failed to register with directory: {}", e);
        }
    }
}

/// Uniform random choice among `peers`, excluding `local`.
fn pick_peer(peers: &[IpAddr], local: IpAddr) -> Option<IpAddr> {
    let others: Vec<IpAddr> = peers.iter().copied().filter(|p| *p != local).collect();
    others.choose(&mut rand::rng()).copied()
}
