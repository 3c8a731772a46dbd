//! SWIM-style gossip membership.
//!
//! Pure state machines; the UDP runtime lives in scout-daemon.
//!
//! **Failure Detection:**
//! 1. Each node periodically pings a random member
//! 2. No ack within timeout: ask K other members to ping it
//! 3. Indirect ping also fails: mark it suspected
//! 4. Suspicion timeout expires: mark it dead (`failed` event)
//!
//! **Dissemination:** membership updates are piggybacked on ping/ack traffic.
//! Dead and departed members are reaped after a configurable window (`reap`
//! event).

pub mod failure;
pub mod membership;
pub mod messages;

pub use failure::{ProbeConfig, Prober, Verdict};
pub use membership::{Member, MemberState, MembershipChange, MembershipList};
pub use messages::{GossipMessage, GossipUpdate, NodeInfo};
