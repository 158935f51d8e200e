//! Capability-match placement.
//!
//! Among agents that carry every required tag, prefer the one with the
//! fewest tags the task did not ask for, keeping specialised agents free
//! for work that needs them. Ties go to the least loaded agent: lowest
//! utilization, then fewest active tasks, then registration order.

use taskgrid_state::TaskRecord;

use crate::view::{AgentView, eligible};
use crate::{PlacementStrategy, Selection};

pub struct PriorityStrategy;

impl PlacementStrategy for PriorityStrategy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn select(&self, task: &TaskRecord, agents: &[AgentView]) -> Option<Selection> {
        let chosen = eligible(task, agents).into_iter().min_by(|a, b| {
            a.surplus_tags(task)
                .cmp(&b.surplus_tags(task))
                .then(a.utilization().total_cmp(&b.utilization()))
                .then(a.active_tasks.cmp(&b.active_tasks))
                .then(a.registration_seq.cmp(&b.registration_seq))
        })?;
        Some(Selection {
            agent_id: chosen.id.clone(),
            via: self.name(),
        })
    }
}
