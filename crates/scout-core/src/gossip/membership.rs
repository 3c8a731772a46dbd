//! Membership list for tracking gossip participants.
//!
//! Tracks every known node, its state and incarnation number, and the queue
//! of updates still to be piggybacked. State transitions that matter to the
//! rest of the system (join, leave, failed, reap) come back as
//! `MembershipChange`s for the caller to publish.

use super::{GossipUpdate, NodeInfo};
use crate::events::{EventType, GossipMember};
use std::collections::{HashMap, VecDeque};

/// Maximum number of pending gossip updates before oldest are dropped
const MAX_GOSSIP_QUEUE_SIZE: usize = 100;

/// State of a member in the membership list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Answering probes
    Alive,
    /// Missed probes, might be dead
    Suspected,
    /// Failed to refute suspicion
    Dead,
    /// Left gracefully
    Left,
}

impl MemberState {
    /// Dead or left: waiting to be reaped.
    pub fn is_departed(self) -> bool {
        matches!(self, Self::Dead | Self::Left)
    }
}

/// A member in the membership list.
#[derive(Debug, Clone)]
pub struct Member {
    pub info: NodeInfo,
    pub state: MemberState,
    /// Increases when the member refutes suspicion
    pub incarnation: u64,
    /// When `state` was last changed (ms, caller's clock)
    pub state_changed_at: u64,
}

/// A transition other components need to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub kind: EventType,
    pub node: NodeInfo,
}

impl MembershipChange {
    fn new(kind: EventType, node: NodeInfo) -> Self {
        Self { kind, node }
    }

    pub fn member(&self) -> GossipMember {
        GossipMember::new(self.node.name.clone(), self.node.addr)
    }
}

/// Membership list tracking all known nodes.
pub struct MembershipList {
    local: NodeInfo,
    local_incarnation: u64,
    members: HashMap<String, Member>,
    pending_gossip: VecDeque<GossipUpdate>,
    /// Maximum gossip updates to piggyback per message
    gossip_fanout: usize,
}

impl MembershipList {
    /// Create a new membership list with default incarnation (1).
    pub fn new(local: NodeInfo) -> Self {
        Self::with_incarnation(local, 1)
    }

    pub fn with_incarnation(local: NodeInfo, incarnation: u64) -> Self {
        Self {
            local,
            local_incarnation: incarnation,
            members: HashMap::new(),
            pending_gossip: VecDeque::new(),
            gossip_fanout: 6,
        }
    }

    pub fn local_info(&self) -> &NodeInfo {
        &self.local
    }

    pub fn local_name(&self) -> &str {
        &self.local.name
    }

    pub fn local_incarnation(&self) -> u64 {
        self.local_incarnation
    }

    /// Set the gossip fanout (max updates per message).
    pub fn set_gossip_fanout(&mut self, fanout: usize) {
        self.gossip_fanout = fanout;
    }

    fn is_local(&self, name: &str) -> bool {
        name == self.local.name
    }

    /// Bump our incarnation past `seen` and announce we are alive.
    fn refute(&mut self, seen: u64) {
        self.local_incarnation = self.local_incarnation.max(seen).saturating_add(1);
        tracing::debug!("Refuting claim about self, incarnation now {}", self.local_incarnation);
        let update = GossipUpdate::alive(self.local.clone(), self.local_incarnation);
        self.queue_gossip(update);
    }

    /// A node contacted us directly to join.
    ///
    /// Direct contact is authoritative: a departed member is revived even if
    /// it restarted with a lower incarnation. Returns the resulting incarnation
    /// and a `Join` change if the node is new or was departed.
    pub fn join(
        &mut self,
        node: NodeInfo,
        incarnation: u64,
        now_ms: u64,
    ) -> (u64, Option<MembershipChange>) {
        if self.is_local(&node.name) {
            return (self.local_incarnation, None);
        }

        let (incarnation, change) = match self.members.get_mut(&node.name) {
            Some(existing) => {
                let was_departed = existing.state.is_departed();
                let incarnation = if was_departed {
                    incarnation.max(existing.incarnation.saturating_add(1))
                } else {
                    incarnation.max(existing.incarnation)
                };
                existing.info = node.clone();
                existing.incarnation = incarnation;
                if existing.state != MemberState::Alive {
                    existing.state = MemberState::Alive;
                    existing.state_changed_at = now_ms;
                }
                let change = was_departed.then(|| MembershipChange::new(EventType::Join, node.clone()));
                (incarnation, change)
            }
            None => {
                self.insert_alive(node.clone(), incarnation, now_ms);
                (
                    incarnation,
                    Some(MembershipChange::new(EventType::Join, node.clone())),
                )
            }
        };

        self.queue_gossip(GossipUpdate::alive(node, incarnation));
        (incarnation, change)
    }

    fn insert_alive(&mut self, node: NodeInfo, incarnation: u64, now_ms: u64) {
        self.members.insert(
            node.name.clone(),
            Member {
                info: node,
                state: MemberState::Alive,
                incarnation,
                state_changed_at: now_ms,
            },
        );
    }

    /// Apply an `Alive` claim learned through gossip.
    pub fn alive(
        &mut self,
        node: NodeInfo,
        incarnation: u64,
        now_ms: u64,
    ) -> Option<MembershipChange> {
        if self.is_local(&node.name) {
            return None;
        }

        let Some(existing) = self.members.get_mut(&node.name) else {
            self.insert_alive(node.clone(), incarnation, now_ms);
            self.queue_gossip(GossipUpdate::alive(node.clone(), incarnation));
            return Some(MembershipChange::new(EventType::Join, node));
        };

        let newer = incarnation > existing.incarnation;
        let refutes = incarnation == existing.incarnation && existing.state == MemberState::Suspected;
        if !newer && !refutes {
            return None;
        }

        let was_departed = existing.state.is_departed();
        existing.info = node.clone();
        existing.incarnation = incarnation;
        if existing.state != MemberState::Alive {
            existing.state = MemberState::Alive;
            existing.state_changed_at = now_ms;
        }
        self.queue_gossip(GossipUpdate::alive(node.clone(), incarnation));

        was_departed.then(|| MembershipChange::new(EventType::Join, node))
    }

    /// Mark a node as suspected.
    ///
    /// Suspicion about ourselves is refuted instead. Returns true if state changed.
    pub fn suspect(&mut self, name: &str, incarnation: u64, now_ms: u64) -> bool {
        if self.is_local(name) {
            if incarnation >= self.local_incarnation {
                self.refute(incarnation);
            }
            return false;
        }

        let Some(member) = self.members.get_mut(name) else {
            return false;
        };
        if member.state != MemberState::Alive || incarnation < member.incarnation {
            return false;
        }
        member.state = MemberState::Suspected;
        member.incarnation = incarnation;
        member.state_changed_at = now_ms;
        tracing::debug!("Suspecting {} (incarnation {})", name, incarnation);
        self.queue_gossip(GossipUpdate::suspect(name, incarnation));
        true
    }

    /// Mark a node as dead.
    ///
    /// Stale claims (lower incarnation) are ignored. A claim about ourselves
    /// is refuted.
    pub fn mark_dead(
        &mut self,
        name: &str,
        incarnation: u64,
        now_ms: u64,
    ) -> Option<MembershipChange> {
        if self.is_local(name) {
            if incarnation >= self.local_incarnation {
                self.refute(incarnation);
            }
            return None;
        }

        let member = self.members.get_mut(name)?;
        if member.state.is_departed() || incarnation < member.incarnation {
            return None;
        }
        member.state = MemberState::Dead;
        member.incarnation = incarnation;
        member.state_changed_at = now_ms;
        tracing::info!("Member {} declared dead", name);
        let node = member.info.clone();
        self.queue_gossip(GossipUpdate::dead(name, incarnation));
        Some(MembershipChange::new(EventType::Failed, node))
    }

    /// Mark a node as gracefully departed.
    pub fn mark_left(
        &mut self,
        name: &str,
        incarnation: u64,
        now_ms: u64,
    ) -> Option<MembershipChange> {
        if self.is_local(name) {
            return None;
        }

        let member = self.members.get_mut(name)?;
        if member.state == MemberState::Left || incarnation < member.incarnation {
            return None;
        }
        member.state = MemberState::Left;
        member.incarnation = incarnation;
        member.state_changed_at = now_ms;
        let node = member.info.clone();
        self.queue_gossip(GossipUpdate::left(name, incarnation));
        Some(MembershipChange::new(EventType::Leave, node))
    }

    /// Announce our own departure. Returns the update to send.
    pub fn leave_local(&mut self) -> GossipUpdate {
        let update = GossipUpdate::left(self.local.name.clone(), self.local_incarnation);
        self.queue_gossip(update.clone());
        update
    }

    /// Forget members that have been dead or gone for at least `reap_after_ms`.
    pub fn reap(&mut self, now_ms: u64, reap_after_ms: u64) -> Vec<MembershipChange> {
        let expired: Vec<String> = self
            .members
            .values()
            .filter(|m| {
                m.state.is_departed() && now_ms.saturating_sub(m.state_changed_at) >= reap_after_ms
            })
            .map(|m| m.info.name.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|name| self.members.remove(&name))
            .map(|m| MembershipChange::new(EventType::Reap, m.info))
            .collect()
    }

    /// Apply a batch of incoming gossip.
    pub fn process_gossip(&mut self, updates: &[GossipUpdate], now_ms: u64) -> Vec<MembershipChange> {
        let mut changes = Vec::new();

        for update in updates {
            let change = match update {
                GossipUpdate::Alive { node, incarnation } => {
                    self.alive(node.clone(), *incarnation, now_ms)
                }
                GossipUpdate::Suspect { name, incarnation } => {
                    self.suspect(name, *incarnation, now_ms);
                    None
                }
                GossipUpdate::Dead { name, incarnation } => {
                    self.mark_dead(name, *incarnation, now_ms)
                }
                GossipUpdate::Left { name, incarnation } => {
                    self.mark_left(name, *incarnation, now_ms)
                }
            };
            changes.extend(change);
        }

        changes
    }

    /// Queue a gossip update for propagation.
    pub fn queue_gossip(&mut self, update: GossipUpdate) {
        // Drop oldest if queue is full (FIFO eviction)
        if self.pending_gossip.len() >= MAX_GOSSIP_QUEUE_SIZE {
            self.pending_gossip.pop_front();
        }
        self.pending_gossip.push_back(update);
    }

    /// Take up to `gossip_fanout` updates for the next message.
    pub fn drain_gossip(&mut self) -> Vec<GossipUpdate> {
        let count = self.gossip_fanout.min(self.pending_gossip.len());
        self.pending_gossip.drain(..count).collect()
    }

    pub fn pending_gossip_len(&self) -> usize {
        self.pending_gossip.len()
    }

    /// `Alive` updates for ourselves and every live member.
    ///
    /// Sent to a joining node. Departed members are not replayed.
    pub fn live_updates(&self) -> Vec<GossipUpdate> {
        let mut updates = vec![GossipUpdate::alive(self.local.clone(), self.local_incarnation)];
        updates.extend(
            self.members
                .values()
                .filter(|m| !m.state.is_departed())
                .map(|m| GossipUpdate::alive(m.info.clone(), m.incarnation)),
        );
        updates
    }

    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn alive_members(&self) -> impl Iterator<Item = &Member> {
        self.members
            .values()
            .filter(|m| m.state == MemberState::Alive)
    }

    /// Alive or suspected: still worth probing.
    pub fn probe_targets(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|m| !m.state.is_departed())
    }

    /// Number of members (excluding ourselves).
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Pick a random member to probe.
    pub fn pick_random_member(&self) -> Option<&Member> {
        use rand::seq::IndexedRandom;

        let targets: Vec<_> = self.probe_targets().collect();
        targets.choose(&mut rand::rng()).copied()
    }

    /// Pick up to `k` random alive members, excluding `exclude`.
    pub fn pick_k_random_members(&self, k: usize, exclude: &str) -> Vec<&Member> {
        use rand::seq::SliceRandom;

        let mut candidates: Vec<_> = self
            .alive_members()
            .filter(|m| m.info.name != exclude)
            .collect();

        candidates.shuffle(&mut rand::rng());
        candidates.truncate(k);
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, last_octet: u8) -> NodeInfo {
        NodeInfo::new(name, format!("10.0.0.{}:7946", last_octet).parse().unwrap())
    }

    fn local() -> NodeInfo {
        node("local", 1)
    }

    // ==================== Joining ====================

    #[test]
    fn test_new_list_is_empty() {
        let list = MembershipList::new(local());
        assert!(list.is_empty());
        assert_eq!(list.local_incarnation(), 1);
        assert_eq!(list.local_name(), "local");
    }

    #[test]
    fn test_direct_join_emits_join() {
        let mut list = MembershipList::new(local());

        let (incarnation, change) = list.join(node("a", 2), 1, 100);

        assert_eq!(incarnation, 1);
        let change = change.unwrap();
        assert_eq!(change.kind, EventType::Join);
        assert_eq!(change.node.name, "a");
        assert_eq!(list.get("a").unwrap().state, MemberState::Alive);
    }

    #[test]
    fn test_repeated_join_emits_once() {
        let mut list = MembershipList::new(local());

        assert!(list.join(node("a", 2), 1, 100).1.is_some());
        assert!(list.join(node("a", 2), 1, 200).1.is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_join_revives_departed_member_with_higher_incarnation() {
        let mut list = MembershipList::new(local());
        list.alive(node("a", 2), 5, 0);
        list.mark_dead("a", 5, 10).unwrap();

        // Restarted node comes back with incarnation 1
        let (incarnation, change) = list.join(node("a", 2), 1, 20);

        assert_eq!(incarnation, 6);
        assert_eq!(change.unwrap().kind, EventType::Join);
        assert_eq!(list.get("a").unwrap().state, MemberState::Alive);
    }

    #[test]
    fn test_join_about_self_ignored() {
        let mut list = MembershipList::new(local());
        let (_, change) = list.join(local(), 1, 0);
        assert!(change.is_none());
        assert!(list.is_empty());
    }

    // ==================== Alive gossip ====================

    #[test]
    fn test_alive_gossip_adds_member() {
        let mut list = MembershipList::new(local());
        let change = list.alive(node("a", 2), 1, 0).unwrap();
        assert_eq!(change.kind, EventType::Join);
        assert_eq!(change.member().port, 7946);
    }

    #[test]
    fn test_stale_alive_ignored() {
        let mut list = MembershipList::new(local());
        list.alive(node("a", 2), 3, 0);
        list.mark_dead("a", 3, 10);

        // Same incarnation cannot resurrect a dead member
        assert!(list.alive(node("a", 2), 3, 20).is_none());
        assert_eq!(list.get("a").unwrap().state, MemberState::Dead);
    }

    #[test]
    fn test_alive_refutes_suspicion_without_event() {
        let mut list = MembershipList::new(local());
        list.alive(node("a", 2), 1, 0);
        assert!(list.suspect("a", 1, 10));

        assert!(list.alive(node("a", 2), 1, 20).is_none());
        assert_eq!(list.get("a").unwrap().state, MemberState::Alive);
    }

    #[test]
    fn test_higher_incarnation_revives_dead_with_join() {
        let mut list = MembershipList::new(local());
        list.alive(node("a", 2), 1, 0);
        list.mark_dead("a", 1, 10);

        let change = list.alive(node("a", 2), 2, 20).unwrap();
        assert_eq!(change.kind, EventType::Join);
    }

    // ==================== Suspicion and failure ====================

    #[test]
    fn test_suspect_requires_current_incarnation() {
        let mut list = MembershipList::new(local());
        list.alive(node("a", 2), 5, 0);

        assert!(!list.suspect("a", 4, 10));
        assert!(list.suspect("a", 5, 10));
        assert_eq!(list.get("a").unwrap().state, MemberState::Suspected);
    }

    #[test]
    fn test_suspicion_about_self_refuted() {
        let mut list = MembershipList::new(local());
        list.drain_gossip();

        assert!(!list.suspect("local", 1, 0));

        assert_eq!(list.local_incarnation(), 2);
        let gossip = list.drain_gossip();
        assert_eq!(gossip, vec![GossipUpdate::alive(local(), 2)]);
    }

    #[test]
    fn test_mark_dead_emits_failed() {
        let mut list = MembershipList::new(local());
        list.alive(node("a", 2), 1, 0);

        let change = list.mark_dead("a", 1, 10).unwrap();
        assert_eq!(change.kind, EventType::Failed);

        // Second time is a no-op
        assert!(list.mark_dead("a", 1, 20).is_none());
    }

    #[test]
    fn test_stale_dead_ignored() {
        let mut list = MembershipList::new(local());
        list.alive(node("a", 2), 4, 0);
        assert!(list.mark_dead("a", 3, 10).is_none());
        assert_eq!(list.get("a").unwrap().state, MemberState::Alive);
    }

    #[test]
    fn test_dead_about_self_refuted() {
        let mut list = MembershipList::new(local());
        assert!(list.mark_dead("local", 1, 0).is_none());
        assert_eq!(list.local_incarnation(), 2);
    }

    // ==================== Leave and reap ====================

    #[test]
    fn test_mark_left_emits_leave() {
        let mut list = MembershipList::new(local());
        list.alive(node("a", 2), 1, 0);

        let change = list.mark_left("a", 1, 10).unwrap();
        assert_eq!(change.kind, EventType::Leave);
        assert!(list.mark_left("a", 1, 20).is_none());
    }

    #[test]
    fn test_dead_after_left_is_ignored() {
        let mut list = MembershipList::new(local());
        list.alive(node("a", 2), 1, 0);
        list.mark_left("a", 1, 10);
        assert!(list.mark_dead("a", 1, 20).is_none());
    }

    #[test]
    fn test_reap_removes_departed_after_window() {
        let mut list = MembershipList::new(local());
        list.alive(node("a", 2), 1, 0);
        list.alive(node("b", 3), 1, 0);
        list.mark_dead("a", 1, 1000);

        assert!(list.reap(5000, 10_000).is_empty());

        let reaped = list.reap(11_000, 10_000);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].kind, EventType::Reap);
        assert_eq!(reaped[0].node.name, "a");
        assert!(!list.contains("a"));
        assert!(list.contains("b"));
    }

    #[test]
    fn test_leave_local_queues_left() {
        let mut list = MembershipList::new(local());
        list.drain_gossip();
        let update = list.leave_local();
        assert_eq!(update, GossipUpdate::left("local", 1));
        assert_eq!(list.drain_gossip(), vec![update]);
    }

    // ==================== Gossip processing ====================

    #[test]
    fn test_process_gossip_collects_changes() {
        let mut list = MembershipList::new(local());
        list.alive(node("c", 4), 1, 0);

        let changes = list.process_gossip(
            &[
                GossipUpdate::alive(node("a", 2), 1),
                GossipUpdate::alive(node("b", 3), 1),
                GossipUpdate::suspect("a", 1),
                GossipUpdate::left("c", 1),
            ],
            10,
        );

        let kinds: Vec<_> = changes.iter().map(|c| (c.kind, c.node.name.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (EventType::Join, "a"),
                (EventType::Join, "b"),
                (EventType::Leave, "c")
            ]
        );
        assert_eq!(list.get("a").unwrap().state, MemberState::Suspected);
    }

    #[test]
    fn test_live_updates_skip_departed() {
        let mut list = MembershipList::new(local());
        list.alive(node("a", 2), 1, 0);
        list.alive(node("b", 3), 1, 0);
        list.mark_dead("b", 1, 10);

        let names: Vec<_> = list.live_updates().iter().map(|u| u.name().to_string()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"local".to_string()));
        assert!(names.contains(&"a".to_string()));
    }

    #[test]
    fn test_gossip_queue_bounded() {
        let mut list = MembershipList::new(local());
        for i in 0..(MAX_GOSSIP_QUEUE_SIZE + 20) {
            list.queue_gossip(GossipUpdate::suspect(format!("n{}", i), 1));
        }
        assert_eq!(list.pending_gossip_len(), MAX_GOSSIP_QUEUE_SIZE);

        // Oldest dropped first
        let first = list.drain_gossip();
        assert_eq!(first[0].name(), "n20");
    }

    #[test]
    fn test_drain_respects_fanout() {
        let mut list = MembershipList::new(local());
        list.set_gossip_fanout(2);
        for i in 0..5 {
            list.queue_gossip(GossipUpdate::suspect(format!("n{}", i), 1));
        }
        assert_eq!(list.drain_gossip().len(), 2);
        assert_eq!(list.pending_gossip_len(), 3);
    }

    // ==================== Random selection ====================

    #[test]
    fn test_pick_random_member_skips_departed() {
        let mut list = MembershipList::new(local());
        assert!(list.pick_random_member().is_none());

        list.alive(node("a", 2), 1, 0);
        list.alive(node("b", 3), 1, 0);
        list.mark_dead("b", 1, 10);

        for _ in 0..20 {
            assert_eq!(list.pick_random_member().unwrap().info.name, "a");
        }
    }

    #[test]
    fn test_pick_k_excludes_target() {
        let mut list = MembershipList::new(local());
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            list.alive(node(name, i as u8 + 2), 1, 0);
        }

        let picked = list.pick_k_random_members(3, "a");
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|m| m.info.name != "a"));

        assert_eq!(list.pick_k_random_members(10, "a").len(), 3);
    }
}
