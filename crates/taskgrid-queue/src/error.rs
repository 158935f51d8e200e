//! Queue error types.

use taskgrid_state::TaskStatus;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task not found: {0}")]
    UnknownTask(String),

    #[error("task already exists: {0}")]
    DuplicateTask(String),

    #[error("task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("task {0} depends on itself")]
    SelfDependency(String),

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {task_id} is not assigned to {agent_id}")]
    WrongAgent { task_id: String, agent_id: String },
}
