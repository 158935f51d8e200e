//! The boundary to whatever executes task payloads.

use tracing::debug;

use crate::coordinator::Assignment;

/// Delivers assignments to agents and relays stop signals.
///
/// Both calls are best effort: the coordinator never waits on task
/// execution, and a missing acknowledgement is handled by the health path.
pub trait WorkerRuntime: Send + Sync {
    fn dispatch(&self, assignment: &Assignment) -> anyhow::Result<()>;

    fn stop(&self, agent_id: &str, task_id: &str) -> anyhow::Result<()>;
}

/// Agents pull their work; nothing is pushed.
pub struct NoopRuntime;

impl WorkerRuntime for NoopRuntime {
    fn dispatch(&self, assignment: &Assignment) -> anyhow::Result<()> {
        debug!(task_id = %assignment.task_id, agent_id = %assignment.agent_id, "assignment ready");
        Ok(())
    }

    fn stop(&self, agent_id: &str, task_id: &str) -> anyhow::Result<()> {
        debug!(%agent_id, %task_id, "stop signal dropped (no runtime)");
        Ok(())
    }
}
