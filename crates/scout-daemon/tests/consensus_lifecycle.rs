//! Real consensus engine on a temp directory: bootstrap, idempotent
//! membership changes, reset, and restart from durable state. Two-node cases
//! run over the HTTP transport on loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use scout_core::{
    ClusterError, Consensus, ConsensusAddress, InMemoryDirectory, NodeIdentity, NoopStateMachine,
    PeerDirectory, Server,
};
use scout_daemon::config::ConsensusConfig;
use scout_daemon::{Config, ConsensusStore, DiscoveryMode, Node};
use tempfile::TempDir;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

async fn open(dir: &Path, port: u16) -> scout_core::Result<ConsensusStore> {
    ConsensusStore::init_with_bind(
        dir,
        ConsensusAddress::new(LOCALHOST, port),
        SocketAddr::new(LOCALHOST, port),
        ConsensusConfig::default(),
        Arc::new(NoopStateMachine),
    )
    .await
}

/// Reopen once the previous engine has let go of the database.
async fn reopen(dir: &Path, port: u16) -> ConsensusStore {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match open(dir, port).await {
            Ok(store) => return store,
            Err(e) if tokio::time::Instant::now() < deadline => {
                eprintln!("reopen pending: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => panic!("reopen failed: {}", e),
        }
    }
}

async fn wait_for_leader(consensus: &dyn Consensus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !consensus.is_leader().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} never became leader",
            consensus.local_address()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_bootstrap_changes_reset_and_restart() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let local = ConsensusAddress::new(LOCALHOST, port);

    let store = open(dir.path(), port).await.unwrap();
    assert!(!store.is_initialized().await);
    assert!(store.configuration().await.is_empty());
    assert!(!store.is_leader().await);
    assert_eq!(store.listen_addr().await, Some(SocketAddr::new(LOCALHOST, port)));

    store.bootstrap().await.unwrap();
    wait_for_leader(&store).await;
    assert!(store.is_initialized().await);
    assert_eq!(
        store.configuration().await.servers,
        vec![Server::voter(local.clone())]
    );

    // A second bootstrap is refused
    let again = store.bootstrap().await;
    assert!(matches!(again, Err(ClusterError::Bootstrap(_))));

    // Adding a present voter and removing an absent server are no-ops
    store.add_voter(&local).await.unwrap();
    let absent = ConsensusAddress::new(LOCALHOST, port.wrapping_add(1));
    store.remove_server(&absent).await.unwrap();
    assert_eq!(store.configuration().await.len(), 1);

    // Reset leaves a usable single-member engine
    store.reset().await.unwrap();
    wait_for_leader(&store).await;
    assert_eq!(
        store.configuration().await.servers,
        vec![Server::voter(local.clone())]
    );
    assert!(store.last_leader_contact().await < Duration::from_secs(10));

    store.shutdown().await;
    drop(store);

    // Durable state survives the restart; no second bootstrap needed
    let store = reopen(dir.path(), port).await;
    assert!(store.is_initialized().await);
    wait_for_leader(&store).await;
    assert!(store.configuration().await.is_voter(&local));
    store.shutdown().await;
}

async fn wait_for_voters(consensus: &dyn Consensus, expected: &[ConsensusAddress]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let voters: Vec<ConsensusAddress> =
            consensus.configuration().await.voters().cloned().collect();
        if expected.iter().all(|a| voters.contains(a)) && voters.len() == expected.len() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} sees voters {:?}",
            consensus.local_address(),
            voters
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_follower_resets_after_leader_disappears() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let (port_a, port_b) = (free_port(), free_port());
    let addr_a = ConsensusAddress::new(LOCALHOST, port_a);
    let addr_b = ConsensusAddress::new(LOCALHOST, port_b);

    let a = open(dir_a.path(), port_a).await.unwrap();
    a.bootstrap().await.unwrap();
    wait_for_leader(&a).await;

    let b = open(dir_b.path(), port_b).await.unwrap();
    assert!(!b.is_initialized().await);

    a.add_voter(&addr_b).await.unwrap();
    // Already a voter now
    a.add_voter(&addr_b).await.unwrap();

    let both = [addr_a.clone(), addr_b.clone()];
    wait_for_voters(&a, &both).await;
    wait_for_voters(&b, &both).await;
    assert!(b.is_initialized().await);
    assert!(!b.is_leader().await);
    // Replication from a keeps b's contact fresh
    assert!(b.last_leader_contact().await < Duration::from_secs(2));

    a.shutdown().await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(b.last_leader_contact().await >= Duration::from_secs(1));
    assert!(!b.is_leader().await);

    b.reset().await.unwrap();
    wait_for_leader(&b).await;
    assert_eq!(
        b.configuration().await.servers,
        vec![Server::voter(addr_b.clone())]
    );

    // The rebuilt engine still takes membership changes
    b.remove_server(&addr_a).await.unwrap();
    assert_eq!(b.configuration().await.len(), 1);
    b.shutdown().await;
}

#[tokio::test]
async fn test_unusable_data_dir_is_storage_error() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").unwrap();

    let result = open(&file, free_port()).await;
    assert!(matches!(result, Err(ClusterError::Storage(_))));
}

#[tokio::test]
async fn test_port_in_use_is_bind_error() {
    let dir = TempDir::new().unwrap();
    let taken = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    let port = taken.local_addr().unwrap().port();

    let result = open(dir.path(), port).await;
    assert!(matches!(result, Err(ClusterError::Bind(_))));
}

fn solo_config(data_dir: &Path) -> Config {
    let mut config = Config {
        data_dir: data_dir.to_path_buf(),
        raft_port: free_port(),
        gossip_port: 0,
        health_port: 0,
        ..Config::default()
    };
    config.discovery.mode = DiscoveryMode::Directory;
    config.discovery.attempts = 1;
    config.data_service.enabled = false;
    config
}

#[tokio::test]
async fn test_lone_node_promotes_and_restarts() {
    let dir = TempDir::new().unwrap();
    let directory = InMemoryDirectory::new();
    let identity = NodeIdentity::new("solo", LOCALHOST);
    let config = solo_config(dir.path());

    let node = Node::start_with(
        config.clone(),
        identity.clone(),
        Some(Arc::new(directory.clone()) as Arc<dyn PeerDirectory>),
    )
    .await
    .unwrap();
    wait_for_leader(node.consensus().as_ref()).await;
    assert_eq!(directory.registered(), vec![identity.clone()]);
    node.shutdown().await;

    // Existing state: promoted again, but bootstrap is skipped
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let node = loop {
        match Node::start_with(
            config.clone(),
            identity.clone(),
            Some(Arc::new(directory.clone()) as Arc<dyn PeerDirectory>),
        )
        .await
        {
            Ok(node) => break node,
            Err(e) if tokio::time::Instant::now() < deadline => {
                eprintln!("restart pending: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => panic!("restart failed: {}", e),
        }
    };
    assert!(node.consensus().is_initialized().await);
    wait_for_leader(node.consensus().as_ref()).await;
    node.shutdown().await;
}
