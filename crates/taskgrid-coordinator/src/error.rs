//! Coordinator error types.

use thiserror::Error;

use taskgrid_core::ConfigError;
use taskgrid_ledger::LedgerError;
use taskgrid_queue::QueueError;
use taskgrid_state::{AgentStatus, ErrorKind, StateError};

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent {0} registered with zero capacity")]
    ZeroCapacity(String),

    #[error("pool is full ({max_agents} agents)")]
    PoolFull { max_agents: u32 },

    #[error("agent {agent_id} cannot go from {from} to {to}")]
    InvalidAgentTransition {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },

    #[error("agent {agent_id} still holds {reservations} reservation(s)")]
    AgentBusy {
        agent_id: String,
        reservations: usize,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoordinatorError {
    /// The domain error kind this maps to, where there is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CoordinatorError::Ledger(e) if e.is_insufficient_capacity() => {
                Some(ErrorKind::InsufficientCapacity)
            }
            CoordinatorError::Config(_) => Some(ErrorKind::ConfigurationInvalid),
            _ => None,
        }
    }
}
