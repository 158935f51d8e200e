//! Best-fit placement.
//!
//! Chooses the agent that will have the least capacity left idle once the
//! task is placed, so large holes stay available for large tasks.

use taskgrid_state::TaskRecord;

use crate::view::{AgentView, eligible};
use crate::{PlacementStrategy, Selection};

pub struct ResourceAwareStrategy;

impl ResourceAwareStrategy {
    /// The best-fit agent, without the `Selection` wrapper.
    pub fn best_fit<'a>(task: &TaskRecord, agents: &'a [AgentView]) -> Option<&'a AgentView> {
        eligible(task, agents).into_iter().min_by(|a, b| {
            a.leftover_after(&task.demand)
                .total_cmp(&b.leftover_after(&task.demand))
                .then(a.registration_seq.cmp(&b.registration_seq))
        })
    }
}

impl PlacementStrategy for ResourceAwareStrategy {
    fn name(&self) -> &'static str {
        "resource-aware"
    }

    fn select(&self, task: &TaskRecord, agents: &[AgentView]) -> Option<Selection> {
        Self::best_fit(task, agents).map(|a| Selection {
            agent_id: a.id.clone(),
            via: self.name(),
        })
    }
}
