//! Round-robin placement.
//!
//! Walks agents in registration order using an atomic cursor. The cursor
//! holds the registration sequence to start from, so agents joining or
//! leaving do not reset the rotation. Agents that cannot host the task are
//! skipped.

use std::sync::atomic::{AtomicU64, Ordering};

use taskgrid_state::TaskRecord;

use crate::view::{AgentView, eligible};
use crate::{PlacementStrategy, Selection};

pub struct RoundRobinStrategy {
    next_seq: AtomicU64,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(0),
        }
    }

    /// Reset the rotation to the first registered agent.
    pub fn reset(&self) {
        self.next_seq.store(0, Ordering::Relaxed);
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self, task: &TaskRecord, agents: &[AgentView]) -> Option<Selection> {
        let candidates = eligible(task, agents);
        let start = self.next_seq.load(Ordering::Relaxed);
        let chosen = candidates
            .iter()
            .find(|a| a.registration_seq >= start)
            .or_else(|| candidates.first())?;
        self.next_seq
            .store(chosen.registration_seq + 1, Ordering::Relaxed);
        Some(Selection {
            agent_id: chosen.id.clone(),
            via: self.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::testing::{agent, task};
    use taskgrid_state::AgentStatus;

    fn pick(rr: &RoundRobinStrategy, agents: &[AgentView]) -> Option<String> {
        rr.select(&task("t", 1), agents).map(|s| s.agent_id)
    }

    #[test]
    fn cycles_in_registration_order() {
        let rr = RoundRobinStrategy::new();
        let agents = vec![agent("c", 3, 4, 4), agent("a", 1, 4, 4), agent("b", 2, 4, 4)];

        let picks: Vec<_> = (0..5).filter_map(|_| pick(&rr, &agents)).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b"]);
    }

    #[test]
    fn skips_unhealthy_draining_and_full_agents() {
        let rr = RoundRobinStrategy::new();
        let mut sick = agent("sick", 1, 4, 4);
        sick.status = AgentStatus::Unhealthy;
        let mut leaving = agent("leaving", 2, 4, 4);
        leaving.status = AgentStatus::Draining;
        let full = agent("full", 3, 4, 0);
        let ok = agent("ok", 4, 4, 4);
        let agents = vec![sick, leaving, full, ok];

        for _ in 0..3 {
            assert_eq!(pick(&rr, &agents).as_deref(), Some("ok"));
        }
    }

    #[test]
    fn none_when_nothing_fits() {
        let rr = RoundRobinStrategy::new();
        assert_eq!(pick(&rr, &[]), None);
        assert_eq!(pick(&rr, &[agent("full", 0, 4, 0)]), None);
    }

    #[test]
    fn rotation_survives_membership_changes() {
        let rr = RoundRobinStrategy::new();
        let two = vec![agent("a", 1, 4, 4), agent("b", 2, 4, 4)];
        assert_eq!(pick(&rr, &two).as_deref(), Some("a"));

        let three = vec![agent("a", 1, 4, 4), agent("b", 2, 4, 4), agent("c", 3, 4, 4)];
        assert_eq!(pick(&rr, &three).as_deref(), Some("b"));
        assert_eq!(pick(&rr, &three).as_deref(), Some("c"));

        rr.reset();
        assert_eq!(pick(&rr, &three).as_deref(), Some("a"));
    }
}
