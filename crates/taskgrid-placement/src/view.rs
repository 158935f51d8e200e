//! Agent snapshots and the fit checks shared by every strategy.

use std::collections::BTreeSet;

use taskgrid_core::{ResourceKind, Resources};
use taskgrid_state::{AgentId, AgentStatus, TaskRecord};

/// What a strategy knows about an agent at selection time.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentView {
    pub id: AgentId,
    pub registration_seq: u64,
    pub status: AgentStatus,
    pub tags: BTreeSet<String>,
    pub capacity: Resources,
    pub free: Resources,
    pub active_tasks: usize,
}

impl AgentView {
    /// Schedulable, has room for the demand, and carries every required tag.
    pub fn can_host(&self, task: &TaskRecord) -> bool {
        self.status.is_schedulable()
            && task.demand.fits_within(&self.free)
            && task.required_tags.is_subset(&self.tags)
    }

    /// Bottleneck utilization before placement.
    pub fn utilization(&self) -> f64 {
        let used = self.capacity.saturating_sub(&self.free);
        ResourceKind::ALL
            .iter()
            .filter_map(|k| Resources::utilization_of(&used, &self.capacity, *k))
            .fold(0.0, f64::max)
    }

    /// Mean fraction of capacity left idle after placing `demand`, over
    /// the dimensions this agent has. Lower means a tighter fit.
    pub fn leftover_after(&self, demand: &Resources) -> f64 {
        let left = self.free.saturating_sub(demand);
        let fractions: Vec<f64> = ResourceKind::ALL
            .iter()
            .filter(|k| self.capacity.get(**k) > 0)
            .map(|k| left.get(*k) as f64 / self.capacity.get(*k) as f64)
            .collect();
        if fractions.is_empty() {
            return 0.0;
        }
        fractions.iter().sum::<f64>() / fractions.len() as f64
    }

    /// Tags this agent has that the task did not ask for.
    pub fn surplus_tags(&self, task: &TaskRecord) -> usize {
        self.tags.difference(&task.required_tags).count()
    }
}

/// Agents able to host `task`, in registration order.
pub fn eligible<'a>(task: &TaskRecord, agents: &'a [AgentView]) -> Vec<&'a AgentView> {
    let mut out: Vec<&AgentView> = agents.iter().filter(|a| a.can_host(task)).collect();
    out.sort_by_key(|a| a.registration_seq);
    out
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn can_host_checks_status_room_and_tags() {
        let mut a = agent("a", 0, 4, 2);
        let mut t = task("t", 2);
        assert!(a.can_host(&t));

        t.required_tags.insert("gpu".into());
        assert!(!a.can_host(&t));
        a.tags.insert("gpu".into());
        assert!(a.can_host(&t));

        a.status = AgentStatus::Draining;
        assert!(!a.can_host(&t));
        a.status = AgentStatus::Busy;
        assert!(a.can_host(&t));

        assert!(!a.can_host(&task("big", 3)));
    }

    #[test]
    fn leftover_prefers_tight_fit() {
        let roomy = agent("roomy", 0, 8, 8);
        let tight = agent("tight", 1, 4, 2);
        let demand = Resources::cpu(2);
        assert_eq!(tight.leftover_after(&demand), 0.0);
        assert_eq!(roomy.leftover_after(&demand), 0.75);
    }

    #[test]
    fn eligible_sorted_by_registration() {
        let agents = vec![agent("b", 2, 4, 4), agent("full", 0, 4, 0), agent("a", 1, 4, 4)];
        let ids: Vec<_> = eligible(&task("t", 1), &agents)
            .iter()
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
