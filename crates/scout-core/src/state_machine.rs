//! Application state machine applied to committed log entries.
//!
//! The control plane does not interpret commands. Whatever runs on top of the
//! cluster plugs in its own `StateMachine`; the default does nothing.

/// Deterministic state machine fed by the replicated log.
///
/// Calls are serialized by the consensus engine, in log order.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply the command committed at `index`, returning the response payload.
    fn apply(&self, index: u64, command: &[u8]) -> Vec<u8>;

    /// Serialize the full state for a snapshot.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the state with a snapshot produced by `snapshot`.
    fn restore(&self, snapshot: &[u8]) -> Result<(), String>;
}

/// Applies nothing; snapshots are empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStateMachine;

impl StateMachine for NoopStateMachine {
    fn apply(&self, _index: u64, _command: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    fn snapshot(&self) -> Vec<u8> {
        Vec::new()
    }

    fn restore(&self, _snapshot: &[u8]) -> Result<(), String> {
        Ok(())
    }
}
