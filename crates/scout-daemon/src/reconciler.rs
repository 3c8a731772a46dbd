//! Membership reconciler: keeps the voter set in line with gossip membership.
//!
//! One task merges a periodic tick with the gossip event stream. The leader
//! turns join events into `add_voter` and departures into `remove_server`.
//! Followers watch for a leader that has gone quiet and, once contact is
//! stale, force themselves back into a single-member cluster.

use crate::config::ReconcilerConfig;
use scout_core::{Consensus, ConsensusAddress, EventType, MembershipEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Leader,
    Follower,
    ResetPerformed,
    ResetFailed,
}

pub struct Reconciler {
    consensus: Arc<dyn Consensus>,
    raft_port: u16,
    tick: Duration,
    stale_after: Duration,
}

impl Reconciler {
    pub fn new(
        consensus: Arc<dyn Consensus>,
        raft_port: u16,
        tick: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            consensus,
            raft_port,
            tick,
            stale_after,
        }
    }

    pub fn from_config(consensus: Arc<dyn Consensus>, raft_port: u16, config: &ReconcilerConfig) -> Self {
        Self::new(
            consensus,
            raft_port,
            config.tick_interval(),
            config.stale_after(),
        )
    }

    /// Process events and ticks until `shutdown` flips or the event channel
    /// closes.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<MembershipEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Reconciler started (tick {:?}, stale after {:?})", self.tick, self.stale_after);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.on_event(event).await,
                        None => {
                            info!("Membership event channel closed");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Reconciler stopped");
    }

    pub async fn on_tick(&self) -> TickOutcome {
        let leader = self.consensus.is_leader().await;
        let contact = self.consensus.last_leader_contact().await;
        let configuration = self.consensus.configuration().await;
        let local = self.consensus.local_address();

        info!(
            "Tick: {} with {} server(s), last leader contact {:?} ago",
            if leader { "leader" } else { "follower" },
            configuration.len(),
            contact
        );
        for server in &configuration.servers {
            debug!("  server {} ({:?})", server.address, server.suffrage);
        }

        if leader {
            return TickOutcome::Leader;
        }

        if configuration.is_empty() || !configuration.contains(local) || contact <= self.stale_after {
            return TickOutcome::Follower;
        }

        warn!(
            "No leader contact for {:?} (limit {:?}), resetting to a single-member cluster",
            contact, self.stale_after
        );
        match self.consensus.reset().await {
            Ok(()) => {
                info!("Reset complete, {} now leads its own cluster", local);
                TickOutcome::ResetPerformed
            }
            Err(e) => {
                error!("Reset failed: {}", e);
                TickOutcome::ResetFailed
            }
        }
    }

    pub async fn on_event(&self, event: MembershipEvent) {
        if !self.consensus.is_leader().await {
            debug!(
                "Ignoring {} event for {} member(s), not leader",
                event.kind,
                event.members.len()
            );
            return;
        }

        let local = self.consensus.local_address();
        for member in &event.members {
            let address = ConsensusAddress::new(member.addr, self.raft_port);
            if &address == local {
                continue;
            }

            let result = match event.kind {
                EventType::Join => self.consensus.add_voter(&address).await,
                EventType::Leave | EventType::Failed | EventType::Reap => {
                    self.consensus.remove_server(&address).await
                }
            };
            match result {
                Ok(()) => info!("{} {}: {} applied", event.kind, member.name, address),
                Err(e) => error!("{} {}: {} failed: {}", event.kind, member.name, address, e),
            }
        }
    }
}
