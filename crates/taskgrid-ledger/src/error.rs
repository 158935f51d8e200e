//! Ledger error types.

use taskgrid_core::ResourceKind;
use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Which limit rejected a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityScope {
    Agent,
    System,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient {kind} capacity ({scope:?}) on {agent_id}: requested {requested}, available {available}")]
    InsufficientCapacity {
        agent_id: String,
        scope: CapacityScope,
        kind: ResourceKind,
        requested: u64,
        available: u64,
    },

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent already registered: {0}")]
    AgentExists(String),

    #[error("task {task_id} already holds a reservation on {agent_id}")]
    AlreadyReserved { task_id: String, agent_id: String },

    #[error("reservation {0} already released")]
    AlreadyReleased(String),

    #[error("agent {agent_id} still holds {reservations} reservation(s)")]
    AgentBusy { agent_id: String, reservations: usize },
}

impl LedgerError {
    /// Transient rejection: the task should stay pending and be retried.
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, LedgerError::InsufficientCapacity { .. })
    }
}
