//! scout-daemon library: the node and its components.
//!
//! The binary is a thin layer over `coordinator::Node`; everything is exposed
//! here so integration tests can drive the pieces directly.

pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod data_service;
pub mod directory;
pub mod discovery;
pub mod gossip;
pub mod health;
pub mod identity;
pub mod reconciler;

// Re-export key types for convenience
pub use config::{Config, ConfigError, DiscoveryMode};
pub use consensus::ConsensusStore;
pub use coordinator::{ClusterJoiner, Node, NodeError};
pub use discovery::{Discovery, DiscoveryOutcome, DiscoveryRun};
pub use gossip::{Gossip, GossipError};
pub use reconciler::{Reconciler, TickOutcome};
