//! taskgrid-placement: choosing which agent receives a task.
//!
//! Each policy implements [`PlacementStrategy`]; the coordinator holds one,
//! built from configuration by [`build_strategy`].
//!
//! # Components
//!
//! - **`view`**: `AgentView`, the read-only agent snapshot strategies see,
//!   and the eligibility and fit helpers they share
//! - **`round_robin`**, **`priority`**, **`resource_aware`**, **`affinity`** -
//!   the fixed policies
//! - **`adaptive`**: picks among the fixed policies using rolling
//!   success/latency statistics from **`stats`**

pub mod adaptive;
pub mod affinity;
pub mod priority;
pub mod resource_aware;
pub mod round_robin;
pub mod stats;
pub mod view;

use taskgrid_core::{AdaptiveConfig, StrategyKind};
use taskgrid_state::{AgentId, TaskId, TaskRecord};

pub use adaptive::AdaptiveStrategy;
pub use affinity::AffinityStrategy;
pub use priority::PriorityStrategy;
pub use resource_aware::ResourceAwareStrategy;
pub use round_robin::RoundRobinStrategy;
pub use stats::RollingStats;
pub use view::AgentView;

/// An agent chosen for a task, and the policy that chose it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub agent_id: AgentId,
    pub via: &'static str,
}

/// How an assignment ended, fed back to strategies that learn.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementOutcome {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub family: Option<String>,
    pub success: bool,
    /// Time from assignment to the outcome.
    pub latency_ms: u64,
}

/// A placement policy.
///
/// `select` must only return an agent for which
/// [`AgentView::can_host`] holds.
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, task: &TaskRecord, agents: &[AgentView]) -> Option<Selection>;

    /// The coordinator reserved capacity and assigned the task.
    fn on_assigned(&self, _task: &TaskRecord, _selection: &Selection) {}

    /// The assignment completed or failed.
    fn on_outcome(&self, _outcome: &PlacementOutcome) {}

    /// The task left without an outcome (cancelled).
    fn forget(&self, _task_id: &str) {}

    /// The agent left the pool; drop anything remembered about it.
    fn forget_agent(&self, _agent_id: &str) {}
}

/// Build the strategy named by configuration.
pub fn build_strategy(kind: StrategyKind, adaptive: &AdaptiveConfig) -> Box<dyn PlacementStrategy> {
    match kind {
        StrategyKind::RoundRobin => Box::new(RoundRobinStrategy::new()),
        StrategyKind::Priority => Box::new(PriorityStrategy),
        StrategyKind::ResourceAware => Box::new(ResourceAwareStrategy),
        StrategyKind::TaskAffinity => Box::new(AffinityStrategy::new()),
        StrategyKind::Adaptive => Box::new(AdaptiveStrategy::new(adaptive.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_every_configured_strategy() {
        let cfg = AdaptiveConfig::default();
        for kind in [
            StrategyKind::RoundRobin,
            StrategyKind::Priority,
            StrategyKind::ResourceAware,
            StrategyKind::TaskAffinity,
            StrategyKind::Adaptive,
        ] {
            assert_eq!(build_strategy(kind, &cfg).name(), kind.name());
        }
    }
}
