//! Consensus engine: openraft over a redb log, HTTP transport.
//!
//! `ConsensusStore` owns the running engine and its RPC listener. The durable
//! stores are opened once and outlive the engine, so `reset` can shut the
//! engine down, force a single-member configuration into the log, and start a
//! fresh engine over the same data.

pub mod log_store;
pub mod network;
pub mod server;
pub mod state_machine;
pub mod storage;
pub mod typ;

use crate::config::ConsensusConfig;
use async_trait::async_trait;
use log_store::LogStore;
use network::HttpNetwork;
use openraft::error::{ClientWriteError, RaftError};
use openraft::{BasicNode, ChangeMembers};
use scout_core::{
    ClusterConfiguration, ClusterError, Consensus, ConsensusAddress, Server, StateMachine,
    Suffrage,
};
use server::{LeaderContact, RaftServer};
use state_machine::StateMachineStore;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use typ::{NodeId, ScoutRaft};

struct Engine {
    raft: ScoutRaft,
    /// None only between teardown and restart inside a reset.
    server: Option<RaftServer>,
}

/// The node's consensus participant.
pub struct ConsensusStore {
    local: ConsensusAddress,
    node_id: NodeId,
    bind_addr: SocketAddr,
    raft_config: Arc<openraft::Config>,
    timing: ConsensusConfig,
    log_store: LogStore,
    state_machine: StateMachineStore,
    contact: LeaderContact,
    engine: RwLock<Engine>,
}

impl ConsensusStore {
    /// Open durable state under `data_dir`, bind the RPC port, start the engine.
    ///
    /// `local` is the advertised address; the listener binds the same port on
    /// all interfaces. Fails with `Storage` when the data directory is unusable
    /// and with `Bind` when the port is taken.
    pub async fn init(
        data_dir: &Path,
        local: ConsensusAddress,
        timing: ConsensusConfig,
        app: Arc<dyn StateMachine>,
    ) -> scout_core::Result<Self> {
        let port = local
            .port()
            .ok_or_else(|| ClusterError::Bind(format!("no port in {}", local)))?;
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
        Self::init_with_bind(data_dir, local, bind_addr, timing, app).await
    }

    /// Like `init`, with an explicit listen address.
    pub async fn init_with_bind(
        data_dir: &Path,
        local: ConsensusAddress,
        bind_addr: SocketAddr,
        timing: ConsensusConfig,
        app: Arc<dyn StateMachine>,
    ) -> scout_core::Result<Self> {
        let db = storage::open_database(data_dir).map_err(storage_err)?;
        let db = Arc::new(db);
        let log_store = LogStore::open(db.clone()).map_err(storage_err)?;
        let state_machine = StateMachineStore::open(db, app).map_err(storage_err)?;

        let raft_config = openraft::Config {
            cluster_name: "scout".to_string(),
            heartbeat_interval: timing.heartbeat_interval_ms,
            election_timeout_min: timing.election_timeout_min_ms,
            election_timeout_max: timing.election_timeout_max_ms,
            ..Default::default()
        }
        .validate()
        .map_err(|e| ClusterError::Storage(format!("invalid raft config: {}", e)))?;

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ClusterError::Bind(format!("{}: {}", bind_addr, e)))?;

        let node_id = local.node_id();
        let contact = LeaderContact::new();
        let raft_config = Arc::new(raft_config);
        let engine = start_engine(
            node_id,
            raft_config.clone(),
            &log_store,
            &state_machine,
            listener,
            &contact,
        )
        .await
        .map_err(ClusterError::Storage)?;

        info!(
            "Consensus started for {} (node id {}), initialized: {}",
            local,
            node_id,
            !log_store.is_pristine()
        );

        Ok(Self {
            local,
            node_id,
            bind_addr,
            raft_config,
            timing,
            log_store,
            state_machine,
            contact,
            engine: RwLock::new(engine),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Where the RPC listener actually bound.
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.engine
            .read()
            .await
            .server
            .as_ref()
            .map(RaftServer::local_addr)
    }

    async fn raft(&self) -> ScoutRaft {
        self.engine.read().await.raft.clone()
    }

    fn local_node(&self) -> BasicNode {
        BasicNode::new(self.local.as_str())
    }

    /// Stop the engine and the RPC listener.
    pub async fn shutdown(&self) {
        let mut engine = self.engine.write().await;
        if let Some(server) = engine.server.take() {
            server.shutdown().await;
        }
        if let Err(e) = engine.raft.shutdown().await {
            warn!("Raft shutdown error: {}", e);
        }
        info!("Consensus stopped");
    }

    async fn recover(&self, engine: &mut Engine) -> Result<(), String> {
        if let Some(server) = engine.server.take() {
            server.shutdown().await;
        }
        if let Err(e) = engine.raft.shutdown().await {
            warn!("Raft shutdown error during reset: {}", e);
        }

        let recovered = self
            .log_store
            .recover_single_member(self.node_id, self.local_node())
            .map_err(|e| e.to_string())?;

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| format!("rebind {}: {}", self.bind_addr, e))?;
        let fresh = start_engine(
            self.node_id,
            self.raft_config.clone(),
            &self.log_store,
            &self.state_machine,
            listener,
            &self.contact,
        )
        .await?;

        if !recovered {
            let members = BTreeMap::from([(self.node_id, self.local_node())]);
            fresh
                .raft
                .initialize(members)
                .await
                .map_err(|e| format!("initialize: {}", e))?;
        }

        *engine = fresh;
        Ok(())
    }

    async fn change(&self, change: ChangeMembers<NodeId, BasicNode>) -> scout_core::Result<()> {
        let raft = self.raft().await;
        let fut = raft.change_membership(change, false);
        match tokio::time::timeout(self.timing.change_timeout(), fut).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(write_err(e)),
            Err(_) => Err(ClusterError::Membership("membership change timed out".into())),
        }
    }
}

async fn start_engine(
    node_id: NodeId,
    config: Arc<openraft::Config>,
    log_store: &LogStore,
    state_machine: &StateMachineStore,
    listener: TcpListener,
    contact: &LeaderContact,
) -> Result<Engine, String> {
    let raft = ScoutRaft::new(
        node_id,
        config,
        HttpNetwork::new(),
        log_store.clone(),
        state_machine.clone(),
    )
    .await
    .map_err(|e| format!("raft start: {}", e))?;
    contact.touch();
    let server = RaftServer::serve(listener, raft.clone(), contact.clone())
        .map_err(|e| format!("rpc server: {}", e))?;
    Ok(Engine {
        raft,
        server: Some(server),
    })
}

fn storage_err(e: impl Display) -> ClusterError {
    ClusterError::Storage(e.to_string())
}

fn write_err(e: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>) -> ClusterError {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(_)) => ClusterError::NotLeader,
        other => ClusterError::Membership(other.to_string()),
    }
}

#[async_trait]
impl Consensus for ConsensusStore {
    fn local_address(&self) -> &ConsensusAddress {
        &self.local
    }

    async fn is_leader(&self) -> bool {
        let raft = self.raft().await;
        if raft.metrics().borrow().current_leader != Some(self.node_id) {
            return false;
        }
        match tokio::time::timeout(self.timing.leader_check_timeout(), raft.ensure_linearizable())
            .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Leadership check failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Leadership check timed out");
                false
            }
        }
    }

    async fn last_leader_contact(&self) -> Duration {
        self.contact.elapsed()
    }

    async fn configuration(&self) -> ClusterConfiguration {
        let raft = self.raft().await;
        let metrics = raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership();
        let voters: BTreeSet<NodeId> = membership.voter_ids().collect();

        let servers = membership
            .nodes()
            .filter_map(|(id, node)| match node.addr.parse::<ConsensusAddress>() {
                Ok(address) => Some(Server {
                    address,
                    suffrage: if voters.contains(id) {
                        Suffrage::Voter
                    } else {
                        Suffrage::Nonvoter
                    },
                }),
                Err(e) => {
                    warn!("Skipping member {} with bad address: {}", id, e);
                    None
                }
            })
            .collect();
        ClusterConfiguration::new(servers)
    }

    async fn is_initialized(&self) -> bool {
        !self.log_store.is_pristine()
    }

    async fn bootstrap(&self) -> scout_core::Result<()> {
        if !self.log_store.is_pristine() {
            return Err(ClusterError::Bootstrap("durable state already exists".into()));
        }
        let members = BTreeMap::from([(self.node_id, self.local_node())]);
        self.raft()
            .await
            .initialize(members)
            .await
            .map_err(|e| ClusterError::Bootstrap(e.to_string()))?;
        info!("Bootstrapped single-member cluster at {}", self.local);
        Ok(())
    }

    async fn add_voter(&self, address: &ConsensusAddress) -> scout_core::Result<()> {
        let config = self.configuration().await;
        if config.is_voter(address) {
            debug!("{} is already a voter", address);
            return Ok(());
        }

        let id = address.node_id();
        let raft = self.raft().await;
        let learner = raft.add_learner(id, BasicNode::new(address.as_str()), true);
        match tokio::time::timeout(self.timing.change_timeout(), learner).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(write_err(e)),
            Err(_) => {
                return Err(ClusterError::Membership(format!(
                    "{} did not catch up in time",
                    address
                )));
            }
        }

        self.change(ChangeMembers::AddVoterIds(BTreeSet::from([id])))
            .await?;
        info!("Added voter {}", address);
        Ok(())
    }

    async fn remove_server(&self, address: &ConsensusAddress) -> scout_core::Result<()> {
        let config = self.configuration().await;
        if !config.contains(address) {
            debug!("{} is not in the configuration", address);
            return Ok(());
        }

        let ids = BTreeSet::from([address.node_id()]);
        let change = if config.is_voter(address) {
            ChangeMembers::RemoveVoters(ids)
        } else {
            ChangeMembers::RemoveNodes(ids)
        };
        self.change(change).await?;
        info!("Removed server {}", address);
        Ok(())
    }

    async fn reset(&self) -> scout_core::Result<()> {
        warn!("Resetting consensus to a single-member configuration");
        let mut engine = self.engine.write().await;
        self.recover(&mut engine).await.map_err(|e| {
            error!("Consensus reset failed: {}", e);
            ClusterError::Recovery(e)
        })?;
        self.contact.touch();
        info!("Consensus reset complete, {} is sole voter", self.local);
        Ok(())
    }
}
