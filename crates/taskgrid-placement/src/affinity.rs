//! Task-affinity placement.
//!
//! Remembers, per task family, the agents that most recently ran a task of
//! that family and sends new tasks of the family back to them while they
//! can host it. Tasks without a family, or whose remembered agents are all
//! unavailable, fall back to best-fit.

use std::collections::VecDeque;

use dashmap::DashMap;
use taskgrid_state::{AgentId, TaskRecord};

use crate::resource_aware::ResourceAwareStrategy;
use crate::view::AgentView;
use crate::{PlacementStrategy, Selection};

/// Agents remembered per family.
const HISTORY_PER_FAMILY: usize = 8;

pub struct AffinityStrategy {
    history: DashMap<String, VecDeque<AgentId>>,
}

impl AffinityStrategy {
    pub fn new() -> Self {
        Self {
            history: DashMap::new(),
        }
    }

    /// Most recent first.
    pub fn history_for(&self, family: &str) -> Vec<AgentId> {
        self.history
            .get(family)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remember(&self, family: &str, agent_id: &str) {
        let mut entry = self.history.entry(family.to_string()).or_default();
        entry.retain(|a| a != agent_id);
        entry.push_front(agent_id.to_string());
        entry.truncate(HISTORY_PER_FAMILY);
    }
}

impl Default for AffinityStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementStrategy for AffinityStrategy {
    fn name(&self) -> &'static str {
        "task-affinity"
    }

    fn select(&self, task: &TaskRecord, agents: &[AgentView]) -> Option<Selection> {
        if let Some(family) = &task.family {
            let recent = self.history_for(family);
            let warm = recent.iter().find_map(|id| {
                agents
                    .iter()
                    .find(|a| &a.id == id && a.can_host(task))
            });
            if let Some(agent) = warm {
                return Some(Selection {
                    agent_id: agent.id.clone(),
                    via: self.name(),
                });
            }
        }
        ResourceAwareStrategy::best_fit(task, agents).map(|a| Selection {
            agent_id: a.id.clone(),
            via: self.name(),
        })
    }

    fn on_assigned(&self, task: &TaskRecord, selection: &Selection) {
        if let Some(family) = &task.family {
            self.remember(family, &selection.agent_id);
        }
    }

    fn forget_agent(&self, agent_id: &str) {
        self.history.retain(|_, agents| {
            agents.retain(|a| a != agent_id);
            !agents.is_empty()
        });
    }
}
