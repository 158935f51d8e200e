//! Adaptive placement.
//!
//! Runs the fixed policies as arms and keeps rolling success/latency
//! statistics per arm and per agent. Each selection exploits the arm with
//! the best recent score, restricted to agents scoring near the best agent.
//! Every `ceil(1 / exploration_rate)`-th selection instead explores the
//! least-used arm, so no arm starves. Exploration is on a fixed schedule;
//! nothing here is random.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use taskgrid_core::AdaptiveConfig;
use taskgrid_state::{AgentId, TaskId, TaskRecord};

use crate::affinity::AffinityStrategy;
use crate::priority::PriorityStrategy;
use crate::resource_aware::ResourceAwareStrategy;
use crate::round_robin::RoundRobinStrategy;
use crate::stats::RollingStats;
use crate::view::{AgentView, eligible};
use crate::{PlacementOutcome, PlacementStrategy, Selection};

/// Score assumed for an agent with no recorded outcomes. Arms without
/// outcomes are only reached by exploration.
const UNSEEN_AGENT_SCORE: f64 = 1.0;

/// Agents scoring within this margin of the best eligible agent stay in play.
const AGENT_TOLERANCE: f64 = 0.25;

pub struct AdaptiveStrategy {
    config: AdaptiveConfig,
    arms: Vec<Box<dyn PlacementStrategy>>,
    by_arm: DashMap<&'static str, RollingStats>,
    by_agent: DashMap<AgentId, RollingStats>,
    in_flight: DashMap<TaskId, &'static str>,
    selections: AtomicU64,
    explore_every: Option<u64>,
}

impl AdaptiveStrategy {
    pub fn new(config: AdaptiveConfig) -> Self {
        let explore_every = if config.exploration_rate > 0.0 {
            Some((1.0 / config.exploration_rate).ceil().max(1.0) as u64)
        } else {
            None
        };
        Self {
            config,
            // Order breaks score ties: best-fit first.
            arms: vec![
                Box::new(ResourceAwareStrategy),
                Box::new(PriorityStrategy),
                Box::new(AffinityStrategy::new()),
                Box::new(RoundRobinStrategy::new()),
            ],
            by_arm: DashMap::new(),
            by_agent: DashMap::new(),
            in_flight: DashMap::new(),
            selections: AtomicU64::new(0),
            explore_every,
        }
    }

    /// Recent score of an arm, `None` before its first outcome.
    pub fn arm_score(&self, arm: &str) -> Option<f64> {
        self.by_arm
            .get(arm)
            .and_then(|s| s.score(self.config.latency_weight))
    }

    /// Recent score of an agent, `None` before its first outcome.
    pub fn agent_score(&self, agent_id: &str) -> Option<f64> {
        self.by_agent
            .get(agent_id)
            .and_then(|s| s.score(self.config.latency_weight))
    }

    /// Outcomes retained for an agent.
    pub fn agent_samples(&self, agent_id: &str) -> usize {
        self.by_agent.get(agent_id).map(|s| s.len()).unwrap_or(0)
    }

    fn arm_uses(&self, arm: &str) -> u64 {
        self.by_arm.get(arm).map(|s| s.total()).unwrap_or(0)
    }

    /// Index of the arm to use, and whether this is an exploring pick.
    fn choose_arm(&self) -> (usize, bool) {
        let n = self.selections.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(every) = self.explore_every
            && n % every == 0
        {
            let idx = (0..self.arms.len())
                .min_by_key(|i| self.arm_uses(self.arms[*i].name()))
                .unwrap_or(0);
            return (idx, true);
        }

        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (i, arm) in self.arms.iter().enumerate() {
            let score = self.arm_score(arm.name()).unwrap_or(f64::NEG_INFINITY);
            if score > best_score {
                best = i;
                best_score = score;
            }
        }
        (best, false)
    }

    /// Eligible agents whose recent score is close to the best one.
    fn preferred_agents(&self, task: &TaskRecord, agents: &[AgentView]) -> Vec<AgentView> {
        let scored: Vec<(&AgentView, f64)> = eligible(task, agents)
            .into_iter()
            .map(|a| (a, self.agent_score(&a.id).unwrap_or(UNSEEN_AGENT_SCORE)))
            .collect();
        let best = scored
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::NEG_INFINITY, f64::max);
        scored
            .into_iter()
            .filter(|(_, s)| *s >= best - AGENT_TOLERANCE)
            .map(|(a, _)| a.clone())
            .collect()
    }
}

impl PlacementStrategy for AdaptiveStrategy {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn select(&self, task: &TaskRecord, agents: &[AgentView]) -> Option<Selection> {
        let (idx, explored) = self.choose_arm();
        let arm = &self.arms[idx];
        let preferred = self.preferred_agents(task, agents);
        let pick = arm
            .select(task, &preferred)
            .or_else(|| arm.select(task, agents))?;
        debug!(
            task_id = %task.id,
            agent_id = %pick.agent_id,
            arm = arm.name(),
            explored,
            "adaptive selection"
        );
        Some(Selection {
            agent_id: pick.agent_id,
            via: arm.name(),
        })
    }

    fn on_assigned(&self, task: &TaskRecord, selection: &Selection) {
        self.in_flight.insert(task.id.clone(), selection.via);
        for arm in &self.arms {
            arm.on_assigned(task, selection);
        }
    }

    fn on_outcome(&self, outcome: &PlacementOutcome) {
        let window = self.config.window_size;
        if let Some((_, via)) = self.in_flight.remove(&outcome.task_id) {
            self.by_arm
                .entry(via)
                .or_insert_with(|| RollingStats::new(window))
                .record(outcome.success, outcome.latency_ms);
        }
        self.by_agent
            .entry(outcome.agent_id.clone())
            .or_insert_with(|| RollingStats::new(window))
            .record(outcome.success, outcome.latency_ms);
        for arm in &self.arms {
            arm.on_outcome(outcome);
        }
    }

    fn forget(&self, task_id: &str) {
        self.in_flight.remove(task_id);
    }

    fn forget_agent(&self, agent_id: &str) {
        self.by_agent.remove(agent_id);
        for arm in &self.arms {
            arm.forget_agent(agent_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::testing::{agent, task};

    fn config(rate: f64) -> AdaptiveConfig {
        AdaptiveConfig {
            window_size: 8,
            exploration_rate: rate,
            latency_weight: 0.01,
        }
    }

    fn run(s: &AdaptiveStrategy, task_id: &str, agent_id: &str, via: &'static str, ok: bool) {
        let t = task(task_id, 1);
        s.on_assigned(
            &t,
            &Selection {
                agent_id: agent_id.into(),
                via,
            },
        );
        s.on_outcome(&PlacementOutcome {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            family: None,
            success: ok,
            latency_ms: 50,
        });
    }

    #[test]
    fn exploits_the_best_arm() {
        let s = AdaptiveStrategy::new(config(0.0));
        for i in 0..4 {
            run(&s, &format!("bad{i}"), "a", "resource-aware", false);
            run(&s, &format!("good{i}"), "a", "priority", true);
        }
        assert!(s.arm_score("priority").unwrap() > s.arm_score("resource-aware").unwrap());

        let pick = s.select(&task("t", 1), &[agent("a", 1, 4, 4)]).unwrap();
        assert_eq!(pick.via, "priority");
    }

    #[test]
    fn explores_least_used_arm_on_schedule() {
        let s = AdaptiveStrategy::new(config(0.5));
        for i in 0..3 {
            run(&s, &format!("t{i}"), "a", "resource-aware", true);
            run(&s, &format!("u{i}"), "a", "priority", true);
            run(&s, &format!("v{i}"), "a", "task-affinity", true);
        }
        let agents = [agent("a", 1, 4, 4)];

        // First selection exploits, second explores the unused arm.
        let first = s.select(&task("x", 1), &agents).unwrap();
        let second = s.select(&task("y", 1), &agents).unwrap();
        assert_ne!(first.via, "round-robin");
        assert_eq!(second.via, "round-robin");
    }

    #[test]
    fn steers_away_from_failing_agents() {
        let s = AdaptiveStrategy::new(config(0.0));
        for i in 0..6 {
            run(&s, &format!("f{i}"), "flaky", "resource-aware", false);
            run(&s, &format!("s{i}"), "steady", "resource-aware", true);
        }
        // Best-fit alone would pick "flaky" (tighter fit).
        let agents = [agent("flaky", 1, 2, 2), agent("steady", 2, 8, 8)];
        let pick = s.select(&task("t", 1), &agents).unwrap();
        assert_eq!(pick.agent_id, "steady");
    }

    #[test]
    fn uses_a_poor_agent_when_it_is_the_only_option() {
        let s = AdaptiveStrategy::new(config(0.0));
        for i in 0..6 {
            run(&s, &format!("s{i}"), "steady", "resource-aware", true);
            run(&s, &format!("f{i}"), "flaky", "resource-aware", false);
        }
        let agents = [agent("flaky", 1, 4, 4)];
        let pick = s.select(&task("t", 1), &agents).unwrap();
        assert_eq!(pick.agent_id, "flaky");
    }

    #[test]
    fn statistics_stay_bounded() {
        let s = AdaptiveStrategy::new(config(0.1));
        for i in 0..100 {
            run(&s, &format!("t{i}"), "a", "priority", i % 2 == 0);
        }
        assert_eq!(s.agent_samples("a"), 8);
        assert!(s.in_flight.is_empty());
    }

    #[test]
    fn forget_drops_in_flight_bookkeeping() {
        let s = AdaptiveStrategy::new(config(0.1));
        let t = task("t", 1);
        s.on_assigned(
            &t,
            &Selection {
                agent_id: "a".into(),
                via: "priority",
            },
        );
        s.forget("t");
        assert!(s.in_flight.is_empty());
    }

    #[test]
    fn agent_statistics_leave_with_the_agent() {
        let s = AdaptiveStrategy::new(config(0.1));
        for i in 0..3 {
            run(&s, &format!("a{i}"), "a", "priority", true);
            run(&s, &format!("b{i}"), "b", "priority", false);
        }
        s.forget_agent("b");
        assert_eq!(s.agent_samples("b"), 0);
        assert_eq!(s.agent_samples("a"), 3);
        assert_eq!(s.by_agent.len(), 1);
        // Arm statistics describe the policy, not the agent.
        assert!(s.arm_score("priority").is_some());
    }
}
