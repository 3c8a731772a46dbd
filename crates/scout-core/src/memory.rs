//! In-process implementations of the cluster capabilities, for testing.
//!
//! `InMemoryConsensus` models the rules the control plane relies on (leader
//! only mutation, idempotent changes, single-member bootstrap and reset)
//! without any replication. `InMemoryDirectory` is a shared registry several
//! nodes can point at. `InMemoryOverlay` and `InMemoryDataService` record the
//! calls made to them and can be told to fail.

use crate::address::{ConsensusAddress, NodeIdentity};
use crate::cluster::{ClusterConfiguration, Consensus, DataService, Overlay, PeerDirectory, Server};
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct ConsensusState {
    leader: bool,
    initialized: bool,
    servers: Vec<Server>,
    last_contact: Duration,
    resets: usize,
    /// Mutations that actually reached the engine (accepted or rejected).
    proposals: usize,
    fail_reset: bool,
}

/// Consensus engine stand-in.
pub struct InMemoryConsensus {
    local: ConsensusAddress,
    state: Mutex<ConsensusState>,
}

impl InMemoryConsensus {
    /// A node with empty state that is not leader.
    pub fn new(local: ConsensusAddress) -> Self {
        Self {
            local,
            state: Mutex::new(ConsensusState::default()),
        }
    }

    /// Force the leadership verification result.
    pub fn set_leader(&self, leader: bool) {
        lock(&self.state).leader = leader;
    }

    /// Pretend the last leader contact was `ago` ago.
    pub fn set_last_contact(&self, ago: Duration) {
        lock(&self.state).last_contact = ago;
    }

    /// Replace the configuration wholesale (simulates replication from a leader).
    pub fn set_servers(&self, servers: Vec<Server>) {
        let mut state = lock(&self.state);
        state.initialized = state.initialized || !servers.is_empty();
        state.servers = servers;
    }

    /// Make the next resets fail.
    pub fn fail_resets(&self, fail: bool) {
        lock(&self.state).fail_reset = fail;
    }

    pub fn reset_count(&self) -> usize {
        lock(&self.state).resets
    }

    pub fn proposal_count(&self) -> usize {
        lock(&self.state).proposals
    }

    /// Synchronous configuration snapshot.
    pub fn snapshot(&self) -> ClusterConfiguration {
        ClusterConfiguration::new(lock(&self.state).servers.clone())
    }
}

#[async_trait]
impl Consensus for InMemoryConsensus {
    fn local_address(&self) -> &ConsensusAddress {
        &self.local
    }

    async fn is_leader(&self) -> bool {
        lock(&self.state).leader
    }

    async fn last_leader_contact(&self) -> Duration {
        lock(&self.state).last_contact
    }

    async fn configuration(&self) -> ClusterConfiguration {
        self.snapshot()
    }

    async fn is_initialized(&self) -> bool {
        lock(&self.state).initialized
    }

    async fn bootstrap(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.initialized {
            return Err(ClusterError::Bootstrap("durable state already exists".into()));
        }
        state.initialized = true;
        state.servers = vec![Server::voter(self.local.clone())];
        state.leader = true;
        Ok(())
    }

    async fn add_voter(&self, address: &ConsensusAddress) -> Result<()> {
        let mut state = lock(&self.state);
        state.proposals += 1;
        if !state.leader {
            return Err(ClusterError::NotLeader);
        }
        if let Some(existing) = state.servers.iter_mut().find(|s| &s.address == address) {
            *existing = Server::voter(address.clone());
        } else {
            state.servers.push(Server::voter(address.clone()));
        }
        Ok(())
    }

    async fn remove_server(&self, address: &ConsensusAddress) -> Result<()> {
        let mut state = lock(&self.state);
        state.proposals += 1;
        if !state.leader {
            return Err(ClusterError::NotLeader);
        }
        state.servers.retain(|s| &s.address != address);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.resets += 1;
        if state.fail_reset {
            return Err(ClusterError::Recovery("injected failure".into()));
        }
        state.initialized = true;
        state.servers = vec![Server::voter(self.local.clone())];
        state.leader = true;
        state.last_contact = Duration::ZERO;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    registered: Vec<NodeIdentity>,
    failures_remaining: usize,
    queries: usize,
}

/// Shared service registry. Clones see the same registrations.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` queries with a directory error.
    pub fn fail_next_queries(&self, n: usize) {
        lock(&self.state).failures_remaining = n;
    }

    pub fn registered(&self) -> Vec<NodeIdentity> {
        lock(&self.state).registered.clone()
    }

    pub fn query_count(&self) -> usize {
        lock(&self.state).queries
    }
}

#[async_trait]
impl PeerDirectory for InMemoryDirectory {
    async fn register_self(&self, identity: &NodeIdentity) -> Result<()> {
        let mut state = lock(&self.state);
        state.registered.retain(|r| r.hostname != identity.hostname);
        state.registered.push(identity.clone());
        Ok(())
    }

    async fn list_healthy_peers(&self) -> Result<Vec<IpAddr>> {
        let mut state = lock(&self.state);
        state.queries += 1;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(ClusterError::Directory("directory unavailable".into()));
        }
        Ok(state.registered.iter().map(|r| r.ip).collect())
    }
}

#[derive(Debug)]
struct CallLog<T> {
    calls: Vec<T>,
    fail: bool,
}

// Derived Default would demand `T: Default`, which `SocketAddr` is not
impl<T> Default for CallLog<T> {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            fail: false,
        }
    }
}

/// Overlay that answers every join from every seed, unless told to fail.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOverlay {
    state: Arc<Mutex<CallLog<SocketAddr>>>,
}

impl InMemoryOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_joins(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }

    /// Every seed passed to `join`, in order.
    pub fn seeds(&self) -> Vec<SocketAddr> {
        lock(&self.state).calls.clone()
    }
}

#[async_trait]
impl Overlay for InMemoryOverlay {
    async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        let mut state = lock(&self.state);
        state.calls.extend_from_slice(seeds);
        if state.fail {
            return Err(ClusterError::Join("injected failure".into()));
        }
        Ok(seeds.len())
    }
}

/// Data service admin stand-in.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataService {
    state: Arc<Mutex<CallLog<String>>>,
}

impl InMemoryDataService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_adds(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }

    /// Every address passed to `add_node`, in order.
    pub fn added(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }
}

#[async_trait]
impl DataService for InMemoryDataService {
    async fn add_node(&self, address: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(address.to_string());
        if state.fail {
            return Err(ClusterError::DataService("injected failure".into()));
        }
        Ok(())
    }
}
