//! Agent registry.
//!
//! One `DashMap` entry per agent; every status change is made under that
//! entry's lock alone. The live-agent count is a CAS-guarded atomic so
//! concurrent registrations can never overshoot `max_agents`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use taskgrid_core::Resources;
use taskgrid_state::{AgentId, AgentRecord, AgentStatus, StateStore};

use crate::error::{CoordinatorError, CoordinatorResult};

pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentRecord>,
    seq: AtomicU64,
    live: AtomicU32,
    max_agents: u32,
    store: Option<StateStore>,
}

/// Whether an agent may move from `from` to `to`.
fn allowed(from: AgentStatus, to: AgentStatus) -> bool {
    use AgentStatus::*;
    match (from, to) {
        (Terminated, _) => false,
        (_, Terminated) => true,
        (Idle | Busy, Idle | Busy | Draining | Unhealthy) => true,
        (Draining, Draining | Unhealthy) => true,
        // A heartbeat revives an unhealthy agent.
        (Unhealthy, Idle | Busy | Draining | Unhealthy) => true,
        _ => false,
    }
}

impl AgentRegistry {
    pub fn new(max_agents: u32) -> Self {
        Self {
            agents: DashMap::new(),
            seq: AtomicU64::new(0),
            live: AtomicU32::new(0),
            max_agents,
            store: None,
        }
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Admit an agent. Rejected when the id is taken, the capacity is zero,
    /// or the pool already holds `max_agents`.
    pub fn register(
        &self,
        agent_id: &str,
        capacity: Resources,
        tags: BTreeSet<String>,
        now: u64,
    ) -> CoordinatorResult<AgentRecord> {
        if capacity.is_zero() {
            return Err(CoordinatorError::ZeroCapacity(agent_id.to_string()));
        }
        let max = self.max_agents;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map_err(|_| CoordinatorError::PoolFull { max_agents: max })?;

        let record = match self.agents.entry(agent_id.to_string()) {
            Entry::Occupied(_) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(CoordinatorError::DuplicateAgent(agent_id.to_string()));
            }
            Entry::Vacant(slot) => {
                let record = AgentRecord {
                    id: agent_id.to_string(),
                    status: AgentStatus::Idle,
                    tags,
                    capacity,
                    registration_seq: self.seq.fetch_add(1, Ordering::SeqCst),
                    last_heartbeat: now,
                    registered_at: now,
                    updated_at: now,
                };
                self.persist(&record);
                slot.insert(record.clone());
                record
            }
        };
        info!(%agent_id, seq = record.registration_seq, "agent registered");
        Ok(record)
    }

    /// Drop an agent from the registry and the store.
    pub fn remove(&self, agent_id: &str) -> Option<AgentRecord> {
        let (_, record) = self.agents.remove(agent_id)?;
        if record.status != AgentStatus::Terminated {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(store) = &self.store
            && let Err(e) = store.delete_agent(agent_id)
        {
            warn!(%agent_id, error = %e, "failed to delete agent record");
        }
        info!(%agent_id, "agent removed");
        Some(record)
    }

    /// Move an agent to `to`. Returns the previous status.
    pub fn set_status(&self, agent_id: &str, to: AgentStatus, now: u64) -> CoordinatorResult<AgentStatus> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordinatorError::UnknownAgent(agent_id.to_string()))?;
        let from = agent.status;
        if from == to {
            return Ok(from);
        }
        if !allowed(from, to) {
            return Err(CoordinatorError::InvalidAgentTransition {
                agent_id: agent_id.to_string(),
                from,
                to,
            });
        }
        agent.status = to;
        agent.updated_at = now;
        if to == AgentStatus::Terminated {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        self.persist(&agent);
        info!(%agent_id, %from, %to, "agent status changed");
        Ok(from)
    }

    /// Flip between `idle` and `busy` to match the agent's reservation
    /// count. Other statuses are left alone.
    pub fn refresh_load(&self, agent_id: &str, reservations: usize, now: u64) {
        let Some(mut agent) = self.agents.get_mut(agent_id) else {
            return;
        };
        let target = if reservations == 0 {
            AgentStatus::Idle
        } else {
            AgentStatus::Busy
        };
        if agent.status.is_schedulable() && agent.status != target {
            debug!(%agent_id, from = %agent.status, to = %target, reservations, "agent load changed");
            agent.status = target;
            agent.updated_at = now;
            self.persist(&agent);
        }
    }

    /// Record a heartbeat timestamp. Older timestamps are ignored.
    pub fn touch(&self, agent_id: &str, ts: u64) -> CoordinatorResult<()> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordinatorError::UnknownAgent(agent_id.to_string()))?;
        if ts > agent.last_heartbeat {
            agent.last_heartbeat = ts;
            self.persist(&agent);
        }
        Ok(())
    }

    /// Reinstate an agent loaded from the state store.
    pub fn restore(&self, record: AgentRecord) {
        self.seq
            .fetch_max(record.registration_seq.saturating_add(1), Ordering::SeqCst);
        if record.status != AgentStatus::Terminated {
            self.live.fetch_add(1, Ordering::SeqCst);
        }
        self.agents.insert(record.id.clone(), record);
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.get(agent_id).map(|a| a.value().clone())
    }

    pub fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agents.get(agent_id).map(|a| a.status)
    }

    /// All agents in registration order.
    pub fn list(&self) -> Vec<AgentRecord> {
        let mut out: Vec<AgentRecord> = self.agents.iter().map(|a| a.value().clone()).collect();
        out.sort_by_key(|a| a.registration_seq);
        out
    }

    pub fn with_status(&self, status: AgentStatus) -> Vec<AgentId> {
        let mut out: Vec<(u64, AgentId)> = self
            .agents
            .iter()
            .filter(|a| a.status == status)
            .map(|a| (a.registration_seq, a.key().clone()))
            .collect();
        out.sort();
        out.into_iter().map(|(_, id)| id).collect()
    }

    /// Agents not yet terminated.
    pub fn live_count(&self) -> u32 {
        self.live.load(Ordering::SeqCst)
    }

    /// Agents neither draining nor terminated.
    pub fn active_count(&self) -> u32 {
        self.agents
            .iter()
            .filter(|a| !matches!(a.status, AgentStatus::Draining | AgentStatus::Terminated))
            .count() as u32
    }

    pub fn schedulable_count(&self) -> u32 {
        self.agents
            .iter()
            .filter(|a| a.status.is_schedulable())
            .count() as u32
    }

    pub fn max_agents(&self) -> u32 {
        self.max_agents
    }

    fn persist(&self, record: &AgentRecord) {
        if let Some(store) = &self.store
            && let Err(e) = store.put_agent(record)
        {
            warn!(agent_id = %record.id, error = %e, "failed to persist agent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn registers_in_order() {
        let r = AgentRegistry::new(4);
        r.register("b", Resources::cpu(2), tags(&[]), 0).unwrap();
        r.register("a", Resources::cpu(2), tags(&["gpu"]), 0).unwrap();
        let ids: Vec<_> = r.list().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(r.schedulable_count(), 2);
    }

    #[test]
    fn rejects_duplicates_zero_capacity_and_overflow() {
        let r = AgentRegistry::new(2);
        r.register("a", Resources::cpu(1), tags(&[]), 0).unwrap();
        assert!(matches!(
            r.register("a", Resources::cpu(1), tags(&[]), 0),
            Err(CoordinatorError::DuplicateAgent(_))
        ));
        assert!(matches!(
            r.register("z", Resources::ZERO, tags(&[]), 0),
            Err(CoordinatorError::ZeroCapacity(_))
        ));
        r.register("b", Resources::cpu(1), tags(&[]), 0).unwrap();
        assert!(matches!(
            r.register("c", Resources::cpu(1), tags(&[]), 0),
            Err(CoordinatorError::PoolFull { max_agents: 2 })
        ));
        assert_eq!(r.live_count(), 2);
    }

    #[test]
    fn terminated_agents_free_a_slot() {
        let r = AgentRegistry::new(1);
        r.register("a", Resources::cpu(1), tags(&[]), 0).unwrap();
        r.set_status("a", AgentStatus::Terminated, 1).unwrap();
        r.remove("a");
        r.register("b", Resources::cpu(1), tags(&[]), 2).unwrap();
        assert_eq!(r.live_count(), 1);
    }

    #[test]
    fn transitions_are_checked() {
        let r = AgentRegistry::new(4);
        r.register("a", Resources::cpu(1), tags(&[]), 0).unwrap();
        r.set_status("a", AgentStatus::Draining, 1).unwrap();
        assert!(matches!(
            r.set_status("a", AgentStatus::Idle, 2),
            Err(CoordinatorError::InvalidAgentTransition { .. })
        ));
        r.set_status("a", AgentStatus::Terminated, 3).unwrap();
        assert!(r.set_status("a", AgentStatus::Unhealthy, 4).is_err());
    }

    #[test]
    fn load_only_moves_schedulable_agents() {
        let r = AgentRegistry::new(4);
        r.register("a", Resources::cpu(1), tags(&[]), 0).unwrap();
        r.refresh_load("a", 2, 1);
        assert_eq!(r.status("a"), Some(AgentStatus::Busy));
        r.refresh_load("a", 0, 2);
        assert_eq!(r.status("a"), Some(AgentStatus::Idle));

        r.set_status("a", AgentStatus::Unhealthy, 3).unwrap();
        r.refresh_load("a", 1, 4);
        assert_eq!(r.status("a"), Some(AgentStatus::Unhealthy));
    }

    #[test]
    fn persists_and_restores() {
        let store = StateStore::open_in_memory().unwrap();
        let r = AgentRegistry::new(4).with_store(store.clone());
        r.register("a", Resources::cpu(1), tags(&[]), 0).unwrap();
        r.register("b", Resources::cpu(1), tags(&[]), 0).unwrap();
        r.touch("a", 50).unwrap();

        let fresh = AgentRegistry::new(4);
        for rec in store.list_agents().unwrap() {
            fresh.restore(rec);
        }
        assert_eq!(fresh.get("a").unwrap().last_heartbeat, 50);
        let c = fresh.register("c", Resources::cpu(1), tags(&[]), 60).unwrap();
        assert_eq!(c.registration_seq, 2);
        assert_eq!(fresh.live_count(), 3);
    }
}
