//! Probe bookkeeping for failure detection.
//!
//! A probe goes through up to three phases. It starts `Direct` (we pinged the
//! target ourselves). After `timeout_ms` without an ack it needs helpers, and
//! once helpers have been asked it is `Indirect`. If every helper reports
//! failure, or the probe outlives three timeouts, the target becomes a
//! suspect. A suspect that nobody vouches for within `suspicion_ms` is dead.
//!
//! The caller owns the clock and passes milliseconds in, so tests drive the
//! prober without sleeping.

use std::collections::{BTreeMap, HashMap};

/// Probe timing, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Gap between probe rounds.
    pub interval_ms: u64,
    /// Wait for a direct ack before asking helpers.
    pub timeout_ms: u64,
    /// Helpers asked per indirect probe.
    pub helpers: usize,
    /// A suspect not refuted within this window is declared dead.
    pub suspicion_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            timeout_ms: 500,
            helpers: 3,
            suspicion_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Direct,
    NeedsHelpers,
    Indirect { asked: usize, failed: usize },
}

#[derive(Debug, Clone)]
struct Probe {
    target: String,
    started: u64,
    phase: Phase,
}

#[derive(Debug, Clone, Copy)]
struct Suspect {
    since: u64,
    incarnation: u64,
}

/// What the prober concluded about a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Probes went unanswered; start suspecting.
    Suspect(String),
    /// Suspicion ran out.
    Dead { name: String, incarnation: u64 },
    /// A helper reached a member we suspected.
    Reachable(String),
}

pub struct Prober {
    config: ProbeConfig,
    last_seq: u64,
    probes: BTreeMap<u64, Probe>,
    suspects: HashMap<String, Suspect>,
    next_round: u64,
}

impl Prober {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            last_seq: 0,
            probes: BTreeMap::new(),
            suspects: HashMap::new(),
            next_round: 0,
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// True once per interval; the round is consumed when reported.
    pub fn round_due(&mut self, now_ms: u64) -> bool {
        if now_ms < self.next_round {
            return false;
        }
        self.next_round = now_ms.saturating_add(self.config.interval_ms);
        true
    }

    /// Sequence number not tied to any probe of ours (relayed pings).
    pub fn fresh_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    /// Track a direct ping to `target`; returns its sequence number.
    pub fn probe(&mut self, target: &str, now_ms: u64) -> u64 {
        let seq = self.fresh_seq();
        self.probes.insert(
            seq,
            Probe {
                target: target.to_string(),
                started: now_ms,
                phase: Phase::Direct,
            },
        );
        seq
    }

    /// A direct ack arrived. Settles the probe and any suspicion of its target.
    pub fn acked(&mut self, seq: u64) -> Option<String> {
        let probe = self.probes.remove(&seq)?;
        self.suspects.remove(&probe.target);
        Some(probe.target)
    }

    /// A helper reported back on `target`.
    pub fn relayed(&mut self, target: &str, seq: u64, reachable: bool) -> Option<Verdict> {
        let probe = self.probes.get_mut(&seq).filter(|p| p.target == target)?;

        if reachable {
            self.probes.remove(&seq);
            return self
                .suspects
                .remove(target)
                .map(|_| Verdict::Reachable(target.to_string()));
        }

        let Phase::Indirect { asked, failed } = probe.phase else {
            return None;
        };
        let failed = failed + 1;
        if failed < asked {
            probe.phase = Phase::Indirect { asked, failed };
            return None;
        }
        self.probes.remove(&seq);
        Some(Verdict::Suspect(target.to_string()))
    }

    /// Advance probe phases and suspicion timers.
    pub fn expire(&mut self, now_ms: u64) -> Vec<Verdict> {
        let timeout = self.config.timeout_ms;
        let mut verdicts = Vec::new();

        self.probes.retain(|_, probe| {
            let age = now_ms.saturating_sub(probe.started);
            match probe.phase {
                Phase::Direct if age >= timeout => {
                    probe.phase = Phase::NeedsHelpers;
                    true
                }
                Phase::NeedsHelpers | Phase::Indirect { .. } if age >= timeout * 3 => {
                    verdicts.push(Verdict::Suspect(probe.target.clone()));
                    false
                }
                _ => true,
            }
        });

        let window = self.config.suspicion_ms;
        let mut dead: Vec<(String, u64)> = self
            .suspects
            .iter()
            .filter(|(_, s)| now_ms.saturating_sub(s.since) >= window)
            .map(|(name, s)| (name.clone(), s.incarnation))
            .collect();
        dead.sort();
        for (name, incarnation) in dead {
            self.suspects.remove(&name);
            verdicts.push(Verdict::Dead { name, incarnation });
        }

        verdicts
    }

    /// Probes that timed out and have not asked for help yet.
    pub fn needs_helpers(&self) -> Vec<(u64, String)> {
        self.probes
            .iter()
            .filter(|(_, p)| p.phase == Phase::NeedsHelpers)
            .map(|(seq, p)| (*seq, p.target.clone()))
            .collect()
    }

    /// Record that `asked` helpers were sent a ping request for `seq`.
    pub fn helpers_asked(&mut self, seq: u64, asked: usize) {
        if let Some(probe) = self.probes.get_mut(&seq) {
            if asked > 0 {
                probe.phase = Phase::Indirect { asked, failed: 0 };
            }
        }
    }

    /// Start the suspicion clock. A running clock is never restarted.
    pub fn suspect(&mut self, name: &str, incarnation: u64, now_ms: u64) {
        self.suspects.entry(name.to_string()).or_insert(Suspect {
            since: now_ms,
            incarnation,
        });
    }

    /// The member proved alive. Returns whether it was suspected.
    pub fn refuted(&mut self, name: &str) -> bool {
        self.suspects.remove(name).is_some()
    }

    /// Stop tracking a member entirely.
    pub fn forget(&mut self, name: &str) {
        self.suspects.remove(name);
        self.probes.retain(|_, p| p.target != name);
    }

    pub fn is_suspected(&self, name: &str) -> bool {
        self.suspects.contains_key(name)
    }

    pub fn in_flight(&self) -> usize {
        self.probes.len()
    }

    pub fn suspect_count(&self) -> usize {
        self.suspects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prober() -> Prober {
        Prober::new(ProbeConfig::default())
    }

    /// Probe `target` at `start` and walk it to the indirect phase with `helpers`.
    fn indirect(prober: &mut Prober, target: &str, start: u64, helpers: usize) -> u64 {
        let seq = prober.probe(target, start);
        assert!(prober.expire(start + 500).is_empty());
        assert_eq!(prober.needs_helpers(), vec![(seq, target.to_string())]);
        prober.helpers_asked(seq, helpers);
        seq
    }

    // ==================== Direct probes ====================

    #[test]
    fn test_sequence_numbers_are_unique() {
        let mut prober = prober();
        let a = prober.probe("a", 0);
        let relay = prober.fresh_seq();
        let b = prober.probe("b", 0);
        assert!(a < relay && relay < b);
        assert_eq!(prober.in_flight(), 2);
    }

    #[test]
    fn test_ack_settles_probe_once() {
        let mut prober = prober();
        let seq = prober.probe("a", 0);

        assert_eq!(prober.acked(seq).as_deref(), Some("a"));
        assert_eq!(prober.acked(seq), None);
        assert_eq!(prober.in_flight(), 0);
    }

    #[test]
    fn test_ack_refutes_suspicion() {
        let mut prober = prober();
        prober.suspect("a", 2, 0);
        let seq = prober.probe("a", 100);

        prober.acked(seq);
        assert!(!prober.is_suspected("a"));
    }

    #[test]
    fn test_round_due_once_per_interval() {
        let mut prober = prober();
        assert!(prober.round_due(0));
        assert!(!prober.round_due(999));
        assert!(prober.round_due(1000));
        assert!(!prober.round_due(1500));
    }

    // ==================== Indirect probes ====================

    #[test]
    fn test_no_helpers_before_timeout() {
        let mut prober = prober();
        prober.probe("a", 1000);
        prober.expire(1499);
        assert!(prober.needs_helpers().is_empty());
    }

    #[test]
    fn test_all_helpers_failing_suspects() {
        let mut prober = prober();
        let seq = indirect(&mut prober, "a", 0, 2);

        assert_eq!(prober.relayed("a", seq, false), None);
        assert_eq!(prober.relayed("a", seq, false), Some(Verdict::Suspect("a".into())));
        assert_eq!(prober.in_flight(), 0);
    }

    #[test]
    fn test_helper_reaching_suspect_vouches() {
        let mut prober = prober();
        prober.suspect("a", 4, 0);
        let seq = indirect(&mut prober, "a", 100, 3);

        assert_eq!(prober.relayed("a", seq, true), Some(Verdict::Reachable("a".into())));
        assert!(!prober.is_suspected("a"));
    }

    #[test]
    fn test_helper_reaching_healthy_member_is_quiet() {
        let mut prober = prober();
        let seq = indirect(&mut prober, "a", 0, 1);
        assert_eq!(prober.relayed("a", seq, true), None);
        assert_eq!(prober.in_flight(), 0);
    }

    #[test]
    fn test_relay_for_other_target_ignored() {
        let mut prober = prober();
        let seq = indirect(&mut prober, "a", 0, 1);

        assert_eq!(prober.relayed("b", seq, false), None);
        assert_eq!(prober.in_flight(), 1);
    }

    #[test]
    fn test_unanswered_probe_suspected_after_three_timeouts() {
        let mut prober = prober();
        indirect(&mut prober, "a", 0, 2);
        // Nobody could be asked for this one
        prober.probe("b", 0);
        prober.expire(500);

        assert!(prober.expire(1499).is_empty());
        let mut verdicts = prober.expire(1500);
        verdicts.sort_by_key(|v| format!("{:?}", v));
        assert_eq!(
            verdicts,
            vec![Verdict::Suspect("a".into()), Verdict::Suspect("b".into())]
        );
    }

    // ==================== Suspicion ====================

    #[test]
    fn test_suspect_dies_after_window() {
        let mut prober = prober();
        prober.suspect("a", 7, 1000);

        assert!(prober.expire(5999).is_empty());
        assert_eq!(
            prober.expire(6000),
            vec![Verdict::Dead {
                name: "a".into(),
                incarnation: 7
            }]
        );
        assert_eq!(prober.suspect_count(), 0);
    }

    #[test]
    fn test_resuspecting_keeps_original_clock() {
        let mut prober = prober();
        prober.suspect("a", 1, 0);
        prober.suspect("a", 1, 4000);
        assert_eq!(prober.expire(5000).len(), 1);
    }

    #[test]
    fn test_refuted_reports_prior_suspicion() {
        let mut prober = prober();
        prober.suspect("a", 1, 0);
        assert!(prober.refuted("a"));
        assert!(!prober.refuted("a"));
    }

    #[test]
    fn test_forget_clears_probes_and_suspicion() {
        let mut prober = prober();
        prober.suspect("a", 1, 0);
        prober.probe("a", 0);
        prober.probe("b", 0);

        prober.forget("a");

        assert!(!prober.is_suspected("a"));
        assert_eq!(prober.in_flight(), 1);
    }
}
