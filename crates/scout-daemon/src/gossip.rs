//! UDP runtime for the SWIM membership state machines in `scout_core::gossip`.
//!
//! Two tasks: one receives datagrams, one ticks the prober. Both
//! mutate shared state under a short synchronous lock and collect the
//! resulting effects (datagrams to send, membership changes to report), which
//! are carried out after the lock is released.
//!
//! Membership changes are turned into `MembershipEvent`s and handed to a
//! third task, the forwarder, which pushes them into the bounded consumer
//! channel. The protocol tasks never wait on the consumer. If the consumer is
//! too slow for longer than the send timeout the event is dropped with a
//! warning.

use crate::config::GossipConfig;
use async_trait::async_trait;
use scout_core::gossip::{
    GossipMessage, GossipUpdate, MemberState, MembershipChange, MembershipList, NodeInfo,
    ProbeConfig, Prober, Verdict,
};
use scout_core::{ClusterError, MembershipEvent, Overlay};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Resolution of the protocol clock.
const TICK: Duration = Duration::from_millis(100);

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("Failed to bind gossip socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// An indirect probe we are running on behalf of another member.
#[derive(Debug)]
struct Relay {
    requester: SocketAddr,
    /// Sequence number the requester is waiting on
    origin_seq: u64,
    target: String,
    started_at: u64,
}

struct State {
    members: MembershipList,
    prober: Prober,
    /// Keyed by the sequence number of the ping we sent to the target
    relays: HashMap<u64, Relay>,
}

#[derive(Default)]
struct Effects {
    outgoing: Vec<(SocketAddr, GossipMessage)>,
    changes: Vec<MembershipChange>,
    join_ack_from: Option<SocketAddr>,
}

impl Effects {
    fn send(&mut self, to: SocketAddr, msg: GossipMessage) {
        self.outgoing.push((to, msg));
    }
}

struct Inner {
    socket: UdpSocket,
    state: Mutex<State>,
    /// Unbounded hand-off to the forwarder
    events: mpsc::UnboundedSender<MembershipEvent>,
    config: GossipConfig,
    epoch: Instant,
    /// Receives the source of every JoinAck while a join is in progress
    join_acks: Mutex<Option<mpsc::UnboundedSender<SocketAddr>>>,
}

/// A running gossip member.
pub struct Gossip {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gossip {
    /// Bind `bind`, advertise `name` at `advertise_ip` and the bound port,
    /// and start the receive and probe tasks.
    pub async fn start(
        name: impl Into<String>,
        bind: SocketAddr,
        advertise_ip: IpAddr,
        config: GossipConfig,
        events: mpsc::Sender<MembershipEvent>,
    ) -> Result<Self, GossipError> {
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|source| GossipError::Bind { addr: bind, source })?;
        let port = socket
            .local_addr()
            .map_err(|source| GossipError::Bind { addr: bind, source })?
            .port();

        let local = NodeInfo::new(name, SocketAddr::new(advertise_ip, port));
        info!("Gossip listening on {} as {}", local.addr, local.name);

        let prober = Prober::new(ProbeConfig {
            interval_ms: config.probe_interval_ms,
            timeout_ms: config.probe_timeout_ms,
            helpers: config.indirect_probes,
            suspicion_ms: config.suspicion_timeout_ms,
        });
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let send_timeout = config.event_send_timeout();
        let inner = Arc::new(Inner {
            socket,
            state: Mutex::new(State {
                members: MembershipList::new(local),
                prober,
                relays: HashMap::new(),
            }),
            events: queue_tx,
            config,
            epoch: Instant::now(),
            join_acks: Mutex::new(None),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(receive_loop(inner.clone(), shutdown_rx.clone())),
            tokio::spawn(probe_loop(inner.clone(), shutdown_rx.clone())),
            tokio::spawn(forward_events(queue_rx, events, send_timeout, shutdown_rx)),
        ];

        Ok(Self {
            inner,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Address other members reach us at.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.state().members.local_info().addr
    }

    /// Number of live members, not counting ourselves.
    pub fn alive_count(&self) -> usize {
        self.inner.state().members.alive_members().count()
    }

    /// Announce a graceful departure to every live member.
    pub async fn leave(&self) {
        let (msg, targets) = {
            let mut state = self.inner.state();
            let update = state.members.leave_local();
            let GossipUpdate::Left { name, incarnation } = update else {
                return;
            };
            let targets: Vec<SocketAddr> = state
                .members
                .probe_targets()
                .map(|m| m.info.addr)
                .collect();
            (GossipMessage::Leave { name, incarnation }, targets)
        };

        info!("Leaving gossip, notifying {} member(s)", targets.len());
        for target in targets {
            self.inner.send(target, &msg).await;
        }
    }

    /// Stop the background tasks.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            let _ = task.await;
        }
        debug!("Gossip stopped");
    }
}

#[async_trait]
impl Overlay for Gossip {
    async fn join(&self, seeds: &[SocketAddr]) -> scout_core::Result<usize> {
        if seeds.is_empty() {
            return Err(ClusterError::Join("no seeds given".into()));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        *lock(&self.inner.join_acks) = Some(tx);

        let msg = {
            let state = self.inner.state();
            GossipMessage::Join {
                node: state.members.local_info().clone(),
                incarnation: state.members.local_incarnation(),
            }
        };
        for seed in seeds {
            debug!("Sending gossip join to {}", seed);
            self.inner.send(*seed, &msg).await;
        }

        let mut answered = HashSet::new();
        let deadline = tokio::time::Instant::now() + self.inner.config.join_timeout();
        while answered.len() < seeds.len() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(from)) => {
                    answered.insert(from);
                }
                Ok(None) | Err(_) => break,
            }
        }
        *lock(&self.inner.join_acks) = None;

        if answered.is_empty() {
            return Err(ClusterError::Join(format!(
                "no answer from {} seed(s)",
                seeds.len()
            )));
        }
        info!("Joined gossip through {} seed(s)", answered.len());
        Ok(answered.len())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn send(&self, to: SocketAddr, msg: &GossipMessage) {
        let bytes = match msg.to_json() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode gossip message: {}", e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, to).await {
            debug!("Gossip send to {} failed: {}", to, e);
        }
    }

    async fn apply(&self, effects: Effects) {
        for (to, msg) in &effects.outgoing {
            self.send(*to, msg).await;
        }
        if let Some(from) = effects.join_ack_from {
            if let Some(tx) = lock(&self.join_acks).as_ref() {
                let _ = tx.send(from);
            }
        }
        for change in effects.changes {
            self.emit(change);
        }
    }

    fn emit(&self, change: MembershipChange) {
        info!(
            "Member {} at {}: {}",
            change.node.name, change.node.addr, change.kind
        );
        let event = MembershipEvent::new(change.kind, vec![change.member()]);
        if self.events.send(event).is_err() {
            debug!("Event forwarder stopped, dropping {} event", change.kind);
        }
    }

    fn on_message(&self, msg: GossipMessage, from: SocketAddr) -> Effects {
        let now = self.now_ms();
        let mut fx = Effects::default();
        let mut state = self.state();
        let st = &mut *state;

        match msg {
            GossipMessage::Join { node, incarnation } => {
                debug!("Join request from {} at {}", node.name, node.addr);
                let reply_to = node.addr;
                st.prober.refuted(&node.name);
                let (_, change) = st.members.join(node, incarnation, now);
                fx.changes.extend(change);
                fx.send(
                    reply_to,
                    GossipMessage::JoinAck {
                        members: st.members.live_updates(),
                    },
                );
            }
            GossipMessage::JoinAck { members } => {
                fx.changes.extend(absorb(st, &members, now));
                fx.join_ack_from = Some(from);
            }
            GossipMessage::Ping { seq, gossip, .. } => {
                fx.changes.extend(absorb(st, &gossip, now));
                fx.send(
                    from,
                    GossipMessage::Ack {
                        seq,
                        from: st.members.local_name().to_string(),
                        gossip: st.members.drain_gossip(),
                    },
                );
            }
            GossipMessage::Ack { seq, gossip, .. } => {
                fx.changes.extend(absorb(st, &gossip, now));
                if let Some(relay) = st.relays.remove(&seq) {
                    fx.send(
                        relay.requester,
                        GossipMessage::PingReqAck {
                            seq: relay.origin_seq,
                            target: relay.target,
                            alive: true,
                        },
                    );
                } else if let Some(target) = st.prober.acked(seq) {
                    debug!("Ack from {}", target);
                }
            }
            GossipMessage::PingReq { seq, target } => {
                let relay_seq = st.prober.fresh_seq();
                st.relays.insert(
                    relay_seq,
                    Relay {
                        requester: from,
                        origin_seq: seq,
                        target: target.name.clone(),
                        started_at: now,
                    },
                );
                fx.send(
                    target.addr,
                    GossipMessage::Ping {
                        seq: relay_seq,
                        from: st.members.local_name().to_string(),
                        gossip: Vec::new(),
                    },
                );
            }
            GossipMessage::PingReqAck { seq, target, alive } => {
                let verdicts = st.prober.relayed(&target, seq, alive).into_iter().collect();
                fx.changes.extend(on_verdicts(st, verdicts, now));
            }
            GossipMessage::Leave { name, incarnation } => {
                st.prober.forget(&name);
                fx.changes.extend(st.members.mark_left(&name, incarnation, now));
            }
        }
        fx
    }

    fn on_tick(&self) -> Effects {
        let now = self.now_ms();
        let mut fx = Effects::default();
        let mut state = self.state();
        let st = &mut *state;

        if st.prober.round_due(now) {
            if let Some(target) = st.members.pick_random_member().map(|m| m.info.clone()) {
                let seq = st.prober.probe(&target.name, now);
                fx.send(
                    target.addr,
                    GossipMessage::Ping {
                        seq,
                        from: st.members.local_name().to_string(),
                        gossip: st.members.drain_gossip(),
                    },
                );
            }
        }

        let verdicts = st.prober.expire(now);
        fx.changes.extend(on_verdicts(st, verdicts, now));

        for (seq, target) in st.prober.needs_helpers() {
            let Some(target_info) = st.members.get(&target).map(|m| m.info.clone()) else {
                continue;
            };
            let helpers: Vec<NodeInfo> = st
                .members
                .pick_k_random_members(self.config.indirect_probes, &target)
                .into_iter()
                .map(|m| m.info.clone())
                .collect();
            if helpers.is_empty() {
                continue;
            }
            debug!(
                "No ack from {}, asking {} member(s) to probe",
                target,
                helpers.len()
            );
            for helper in &helpers {
                fx.send(
                    helper.addr,
                    GossipMessage::PingReq {
                        seq,
                        target: target_info.clone(),
                    },
                );
            }
            st.prober.helpers_asked(seq, helpers.len());
        }

        let relay_timeout = self.config.probe_timeout_ms;
        let expired: Vec<u64> = st
            .relays
            .iter()
            .filter(|(_, r)| now.saturating_sub(r.started_at) >= relay_timeout)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(relay) = st.relays.remove(&seq) {
                fx.send(
                    relay.requester,
                    GossipMessage::PingReqAck {
                        seq: relay.origin_seq,
                        target: relay.target,
                        alive: false,
                    },
                );
            }
        }

        for change in st.members.reap(now, self.config.reap_after_ms) {
            st.prober.forget(&change.node.name);
            fx.changes.push(change);
        }
        fx
    }
}

/// Merge piggybacked updates, clearing suspicion of members proven alive.
fn absorb(st: &mut State, updates: &[GossipUpdate], now: u64) -> Vec<MembershipChange> {
    let changes = st.members.process_gossip(updates, now);
    for update in updates {
        let name = update.name();
        match st.members.get(name).map(|m| m.state) {
            Some(MemberState::Alive) => {
                st.prober.refuted(name);
            }
            Some(MemberState::Dead) | Some(MemberState::Left) => st.prober.forget(name),
            _ => {}
        }
    }
    changes
}

fn on_verdicts(st: &mut State, verdicts: Vec<Verdict>, now: u64) -> Vec<MembershipChange> {
    let mut changes = Vec::new();
    for verdict in verdicts {
        match verdict {
            Verdict::Suspect(name) => {
                let Some(incarnation) = st.members.get(&name).map(|m| m.incarnation) else {
                    continue;
                };
                if st.members.suspect(&name, incarnation, now) {
                    info!("Suspecting {}", name);
                    st.prober.suspect(&name, incarnation, now);
                }
            }
            Verdict::Dead { name, incarnation } => {
                st.prober.forget(&name);
                changes.extend(st.members.mark_dead(&name, incarnation, now));
            }
            Verdict::Reachable(name) => {
                debug!("Indirect probe reached {}", name);
            }
        }
    }
    changes
}

async fn receive_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            result = inner.socket.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("Gossip receive error: {}", e);
                        continue;
                    }
                };
                let Some(msg) = GossipMessage::from_json(&buf[..len]) else {
                    debug!("Dropping malformed gossip packet from {}", from);
                    continue;
                };
                let effects = inner.on_message(msg, from);
                inner.apply(effects).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Move events from the hand-off queue into the consumer channel.
async fn forward_events(
    mut queue: mpsc::UnboundedReceiver<MembershipEvent>,
    events: mpsc::Sender<MembershipEvent>,
    send_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = queue.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        match events.send_timeout(event, send_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(event)) => warn!(
                "Dropping {} event for {} member(s), consumer not keeping up",
                event.kind,
                event.members.len()
            ),
            Err(SendTimeoutError::Closed(_)) => {
                debug!("Membership event consumer gone");
                break;
            }
        }
    }
}

async fn probe_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let effects = inner.on_tick();
                inner.apply(effects).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}
