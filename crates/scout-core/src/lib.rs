//! scout-core: runtime-agnostic building blocks for self-organizing clusters.
//!
//! This crate provides:
//! - The discovery handshake codec
//! - Node addressing and stable node ids
//! - Gossip membership state machines and the events they produce
//! - The capability traits (consensus, overlay, directory, data service)
//!   the control plane is written against, plus in-memory versions

pub mod address;
pub mod cluster;
pub mod codec;
pub mod error;
pub mod events;
pub mod gossip;
pub mod memory;
pub mod state_machine;

pub use address::{AddressError, ConsensusAddress, NodeId, NodeIdentity};
pub use cluster::{
    ClusterConfiguration, Consensus, DataService, Overlay, PeerDirectory, Server, Suffrage,
};
pub use codec::{CodecError, Packet, PacketHeader};
pub use error::{ClusterError, Result};
pub use events::{EventType, GossipMember, MembershipEvent};
pub use memory::{InMemoryConsensus, InMemoryDataService, InMemoryDirectory, InMemoryOverlay};
pub use state_machine::{NoopStateMachine, StateMachine};
