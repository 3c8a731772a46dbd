//! Cluster error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Storage unavailable: {0}")]
    Storage(String),

    #[error("Bind failed: {0}")]
    Bind(String),

    #[error("Not the leader")]
    NotLeader,

    #[error("Membership change failed: {0}")]
    Membership(String),

    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Recovery failed: {0}")]
    Recovery(String),

    #[error("Gossip join failed: {0}")]
    Join(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Data service error: {0}")]
    DataService(String),
}

impl ClusterError {
    /// Fatal errors leave the node unable to participate; the process should stop.
    ///
    /// Everything else is either retried, reported, or re-evaluated on the next
    /// tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Bind(_) | Self::Recovery(_))
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
