//! Node lifecycle: wires the components together and runs startup in order.
//!
//! Startup is identity, consensus, gossip, health, discovery, an optional
//! bootstrap, then the reconciler. `Node::shutdown` undoes it: leave gossip,
//! stop the background tasks, stop consensus.

use crate::config::{Config, DiscoveryMode};
use crate::consensus::ConsensusStore;
use crate::data_service::{CouchbaseAdmin, NoopDataService};
use crate::directory::ConsulDirectory;
use crate::discovery::{BroadcastDiscovery, DirectoryDiscovery, Discovery, DiscoveryOutcome};
use crate::gossip::{Gossip, GossipError};
use crate::health;
use crate::identity::{self, IdentityError};
use crate::reconciler::Reconciler;
use scout_core::{
    ClusterError, Consensus, DataService, NodeIdentity, NoopStateMachine, Overlay, PeerDirectory,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Identity: {0}")]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Gossip(#[from] GossipError),

    #[error("Failed to bind health endpoint {addr}: {source}")]
    Health {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Joins this node to the cluster reachable at a given IP.
pub struct ClusterJoiner {
    overlay: Arc<dyn Overlay>,
    data_service: Arc<dyn DataService>,
    gossip_port: u16,
    data_port: u16,
}

impl ClusterJoiner {
    pub fn new(
        overlay: Arc<dyn Overlay>,
        data_service: Arc<dyn DataService>,
        gossip_port: u16,
        data_port: u16,
    ) -> Self {
        Self {
            overlay,
            data_service,
            gossip_port,
            data_port,
        }
    }

    /// Gossip join through `remote`, then ask its data service to add us.
    ///
    /// Only the gossip step can fail the join; a data-service error is
    /// logged and the node stays in the overlay.
    pub async fn join_cluster(&self, remote: IpAddr) -> scout_core::Result<()> {
        self.join_overlay(remote).await?;
        self.add_to_data_service(remote).await;
        Ok(())
    }

    /// The gossip half of `join_cluster`. Its result alone decides whether
    /// the node joined.
    pub async fn join_overlay(&self, remote: IpAddr) -> scout_core::Result<()> {
        let seed = SocketAddr::new(remote, self.gossip_port);
        let answered = self.overlay.join(&[seed]).await?;
        info!("Gossip join through {} ({} seed(s) answered)", seed, answered);
        Ok(())
    }

    /// The data-service half of `join_cluster`. Failures are only logged.
    pub async fn add_to_data_service(&self, remote: IpAddr) {
        let data_addr = SocketAddr::new(remote, self.data_port).to_string();
        if let Err(e) = self.data_service.add_node(&data_addr).await {
            warn!("Joined gossip but data service at {} refused us: {}", data_addr, e);
        }
    }
}

/// A running node.
pub struct Node {
    identity: NodeIdentity,
    consensus: Arc<ConsensusStore>,
    gossip: Arc<Gossip>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Resolve identity and build the directory from configuration, then start.
    pub async fn start(config: Config) -> Result<Self, NodeError> {
        let identity = identity::resolve(config.node_name.as_deref(), config.advertise_ip).await?;
        info!("Node identity: {} at {}", identity.hostname, identity.ip);

        let directory: Option<Arc<dyn PeerDirectory>> = match config.discovery.mode {
            DiscoveryMode::Broadcast => None,
            DiscoveryMode::Directory => {
                let join = config.discovery.join.clone().ok_or_else(|| {
                    ClusterError::Directory("discovery.join is not configured".into())
                })?;
                let consul: Arc<dyn PeerDirectory> = Arc::new(ConsulDirectory::new(
                    join,
                    config.discovery.service_name.clone(),
                    config.health_port,
                )?);
                Some(consul)
            }
        };

        Self::start_with(config, identity, directory).await
    }

    /// Start with a known identity. A `directory` selects directory discovery,
    /// otherwise the node broadcasts.
    pub async fn start_with(
        config: Config,
        identity: NodeIdentity,
        directory: Option<Arc<dyn PeerDirectory>>,
    ) -> Result<Self, NodeError> {
        let local = identity.consensus_address(config.raft_port);
        let consensus = Arc::new(
            ConsensusStore::init(
                &config.data_dir,
                local,
                config.consensus.clone(),
                Arc::new(NoopStateMachine),
            )
            .await?,
        );

        let (events_tx, events_rx) = mpsc::channel(config.reconciler.event_buffer);
        let gossip = Arc::new(
            Gossip::start(
                identity.hostname.clone(),
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.gossip_port)),
                identity.ip,
                config.gossip.clone(),
                events_tx,
            )
            .await?,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let health_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.health_port));
        let health_listener = TcpListener::bind(health_addr)
            .await
            .map_err(|source| NodeError::Health {
                addr: health_addr,
                source,
            })?;
        tasks.push(health::serve(health_listener, shutdown_rx.clone()));

        let data_service: Arc<dyn DataService> = if config.data_service.enabled {
            let settings = &config.data_service;
            Arc::new(CouchbaseAdmin::new(
                identity.ip,
                settings.username.clone(),
                settings.password.clone(),
                settings.services.clone(),
            )?)
        } else {
            Arc::new(NoopDataService)
        };
        let joiner = Arc::new(ClusterJoiner::new(
            gossip.clone(),
            data_service,
            config.gossip_port,
            config.data_service.port,
        ));

        let discovery = match directory {
            Some(directory) => Discovery::Directory(DirectoryDiscovery::new(
                directory,
                joiner,
                identity.clone(),
                config.discovery.attempts,
                config.discovery.backoff(),
            )),
            None => Discovery::Broadcast(BroadcastDiscovery::new(
                identity.ip,
                config.broadcast_port,
                config.network,
                config.discovery.reply_window(),
                consensus.clone(),
                joiner,
            )),
        };

        let run = discovery.run(shutdown_rx.clone()).await?;
        if let Some(listener) = run.listener {
            tasks.push(listener);
        }

        match run.outcome {
            DiscoveryOutcome::Promoted => {
                if consensus.is_initialized().await {
                    info!("Existing consensus state found, not bootstrapping");
                } else {
                    consensus.bootstrap().await?;
                }
            }
            DiscoveryOutcome::Joined(remote) => {
                info!("Waiting for the leader at {} to add us as a voter", remote);
            }
            DiscoveryOutcome::JoinFailed { remote, error } => {
                warn!(
                    "Running unjoined after failing to join {}: {}",
                    remote, error
                );
            }
        }

        let reconciler =
            Reconciler::from_config(consensus.clone(), config.raft_port, &config.reconciler);
        tasks.push(tokio::spawn(reconciler.run(events_rx, shutdown_rx)));

        info!("Node {} started", identity.hostname);
        Ok(Self {
            identity,
            consensus,
            gossip,
            shutdown_tx,
            tasks,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn consensus(&self) -> &Arc<ConsensusStore> {
        &self.consensus
    }

    pub fn gossip(&self) -> &Arc<Gossip> {
        &self.gossip
    }

    /// Leave gossip, stop the background tasks, stop consensus.
    pub async fn shutdown(self) {
        info!("Shutting down {}", self.identity.hostname);
        self.gossip.leave().await;

        let _ = self.shutdown_tx.send(true);
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.consensus.shutdown().await;
        self.gossip.shutdown().await;
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_core::{InMemoryDataService, InMemoryOverlay};

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn joiner(overlay: &InMemoryOverlay, data: &InMemoryDataService) -> ClusterJoiner {
        ClusterJoiner::new(
            Arc::new(overlay.clone()),
            Arc::new(data.clone()),
            7946,
            8091,
        )
    }

    #[tokio::test]
    async fn test_join_uses_gossip_then_data_ports() {
        let overlay = InMemoryOverlay::new();
        let data = InMemoryDataService::new();

        joiner(&overlay, &data).join_cluster(ip(5)).await.unwrap();

        assert_eq!(overlay.seeds(), vec![SocketAddr::new(ip(5), 7946)]);
        assert_eq!(data.added(), vec!["10.0.0.5:8091"]);
    }

    #[tokio::test]
    async fn test_gossip_failure_aborts_join() {
        let overlay = InMemoryOverlay::new();
        overlay.fail_joins(true);
        let data = InMemoryDataService::new();

        let result = joiner(&overlay, &data).join_cluster(ip(5)).await;

        assert!(matches!(result, Err(ClusterError::Join(_))));
        assert!(data.added().is_empty());
    }

    #[tokio::test]
    async fn test_data_service_failure_keeps_join() {
        let overlay = InMemoryOverlay::new();
        let data = InMemoryDataService::new();
        data.fail_adds(true);

        joiner(&overlay, &data).join_cluster(ip(5)).await.unwrap();
        assert_eq!(overlay.seeds().len(), 1);
    }
}
