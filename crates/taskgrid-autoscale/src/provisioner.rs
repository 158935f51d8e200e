//! The boundary to whatever actually starts and stops agents.

use tracing::info;

/// Starts and stops agents on behalf of the scaling controller.
///
/// New agents join through registration; `scale_up` only requests them.
pub trait Provisioner: Send + Sync {
    fn scale_up(&self, count: u32) -> anyhow::Result<()>;

    /// Stop an agent that has finished draining.
    fn terminate(&self, agent_id: &str) -> anyhow::Result<()>;
}

/// Logs requests and does nothing else.
pub struct NoopProvisioner;

impl Provisioner for NoopProvisioner {
    fn scale_up(&self, count: u32) -> anyhow::Result<()> {
        info!(count, "scale-up requested (no provisioner configured)");
        Ok(())
    }

    fn terminate(&self, agent_id: &str) -> anyhow::Result<()> {
        info!(%agent_id, "termination requested (no provisioner configured)");
        Ok(())
    }
}
