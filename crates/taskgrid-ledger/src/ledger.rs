//! Resource ledger: per-agent capacity accounting.
//!
//! Tracks consumed vs. available CPU/memory/disk/network per agent and in
//! aggregate, grants and releases reservations, and reports utilization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};
use uuid::Uuid;

use taskgrid_core::{LimitFractions, ResourceKind, Resources};
use taskgrid_state::{AgentId, Reservation, StateStore, TaskId};

use crate::error::{CapacityScope, LedgerError, LedgerResult};

/// Capacity and holdings of a single agent.
struct Account {
    capacity: Resources,
    in_use: Resources,
    reservations: HashMap<TaskId, Reservation>,
}

/// System-wide totals, one atomic per dimension.
#[derive(Default)]
struct Totals {
    capacity: [AtomicU64; 4],
    in_use: [AtomicU64; 4],
}

fn slot(kind: ResourceKind) -> usize {
    match kind {
        ResourceKind::Cpu => 0,
        ResourceKind::Memory => 1,
        ResourceKind::Disk => 2,
        ResourceKind::Network => 3,
    }
}

impl Totals {
    fn add_capacity(&self, r: &Resources) {
        for kind in ResourceKind::ALL {
            self.capacity[slot(kind)].fetch_add(r.get(kind), Ordering::SeqCst);
        }
    }

    fn sub_capacity(&self, r: &Resources) {
        for kind in ResourceKind::ALL {
            saturating_sub(&self.capacity[slot(kind)], r.get(kind));
        }
    }

    /// Claim `r` against the system-wide limit, all dimensions or none.
    ///
    /// On failure returns `(kind, requested, available)` for the first
    /// dimension that did not fit.
    fn try_claim(
        &self,
        r: &Resources,
        limits: &LimitFractions,
    ) -> Result<(), (ResourceKind, u64, u64)> {
        let mut claimed: Vec<(usize, u64)> = Vec::with_capacity(4);
        for kind in ResourceKind::ALL {
            let amount = r.get(kind);
            if amount == 0 {
                continue;
            }
            let i = slot(kind);
            let cap = self.capacity[i].load(Ordering::SeqCst);
            let limit = (cap as f64 * limits.get(kind)).floor() as u64;
            let result = self.in_use[i].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                cur.checked_add(amount).filter(|next| *next <= limit)
            });
            match result {
                Ok(_) => claimed.push((i, amount)),
                Err(current) => {
                    for (j, amt) in claimed {
                        saturating_sub(&self.in_use[j], amt);
                    }
                    return Err((kind, amount, limit.saturating_sub(current)));
                }
            }
        }
        Ok(())
    }

    fn add_in_use(&self, r: &Resources) {
        for kind in ResourceKind::ALL {
            self.in_use[slot(kind)].fetch_add(r.get(kind), Ordering::SeqCst);
        }
    }

    fn release(&self, r: &Resources) {
        for kind in ResourceKind::ALL {
            saturating_sub(&self.in_use[slot(kind)], r.get(kind));
        }
    }

    fn load(values: &[AtomicU64; 4]) -> Resources {
        let mut out = Resources::ZERO;
        for kind in ResourceKind::ALL {
            out.set(kind, values[slot(kind)].load(Ordering::SeqCst));
        }
        out
    }
}

fn saturating_sub(cell: &AtomicU64, amount: u64) {
    let _ = cell.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
        Some(cur.saturating_sub(amount))
    });
}

/// Aggregate ledger state at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot {
    pub capacity: Resources,
    pub in_use: Resources,
    pub agents: usize,
    pub reservations: usize,
}

impl LedgerSnapshot {
    /// `in_use / capacity` for one dimension; zero when there is no capacity.
    pub fn utilization(&self, kind: ResourceKind) -> f64 {
        Resources::utilization_of(&self.in_use, &self.capacity, kind).unwrap_or(0.0)
    }

    /// Bottleneck utilization: the highest across dimensions with capacity.
    pub fn aggregate(&self) -> f64 {
        ResourceKind::ALL
            .iter()
            .filter_map(|k| Resources::utilization_of(&self.in_use, &self.capacity, *k))
            .fold(0.0, f64::max)
    }

    pub fn available(&self) -> Resources {
        self.capacity.saturating_sub(&self.in_use)
    }
}

/// Capacity and usage of one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentUsage {
    pub agent_id: AgentId,
    pub capacity: Resources,
    pub in_use: Resources,
    pub reservations: usize,
}

impl AgentUsage {
    pub fn free(&self) -> Resources {
        self.capacity.saturating_sub(&self.in_use)
    }

    /// Bottleneck utilization of this agent.
    pub fn utilization(&self) -> f64 {
        ResourceKind::ALL
            .iter()
            .filter_map(|k| Resources::utilization_of(&self.in_use, &self.capacity, *k))
            .fold(0.0, f64::max)
    }
}

/// The resource ledger.
pub struct ResourceLedger {
    by_task: DashMap<TaskId, AgentId>,
    agents: DashMap<AgentId, Account>,
    totals: Totals,
    limits: LimitFractions,
    store: Option<StateStore>,
}

impl ResourceLedger {
    /// Create an in-memory ledger with system-wide `limits`.
    pub fn new(limits: LimitFractions) -> Self {
        Self {
            by_task: DashMap::new(),
            agents: DashMap::new(),
            totals: Totals::default(),
            limits,
            store: None,
        }
    }

    /// Persist every reservation change to `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Add an agent's capacity to the ledger.
    pub fn register_agent(&self, agent_id: &str, capacity: Resources) -> LedgerResult<()> {
        match self.agents.entry(agent_id.to_string()) {
            Entry::Occupied(_) => Err(LedgerError::AgentExists(agent_id.to_string())),
            Entry::Vacant(v) => {
                v.insert(Account {
                    capacity,
                    in_use: Resources::ZERO,
                    reservations: HashMap::new(),
                });
                self.totals.add_capacity(&capacity);
                debug!(%agent_id, %capacity, "agent capacity registered");
                Ok(())
            }
        }
    }

    /// Remove an agent. Refused while it still holds reservations.
    pub fn remove_agent(&self, agent_id: &str) -> LedgerResult<Resources> {
        match self.agents.entry(agent_id.to_string()) {
            Entry::Vacant(_) => Err(LedgerError::UnknownAgent(agent_id.to_string())),
            Entry::Occupied(e) => {
                let held = e.get().reservations.len();
                if held > 0 {
                    return Err(LedgerError::AgentBusy {
                        agent_id: agent_id.to_string(),
                        reservations: held,
                    });
                }
                let account = e.remove();
                self.totals.sub_capacity(&account.capacity);
                debug!(%agent_id, "agent capacity removed");
                Ok(account.capacity)
            }
        }
    }

    /// Reserve `amounts` on `agent_id` for `task_id`.
    ///
    /// Fails with `InsufficientCapacity` if any dimension would exceed the
    /// agent's free capacity or the system-wide limit. Either the whole
    /// reservation becomes visible or nothing does.
    pub fn reserve(
        &self,
        agent_id: &str,
        task_id: &str,
        amounts: Resources,
        now: u64,
    ) -> LedgerResult<Reservation> {
        let slot = match self.by_task.entry(task_id.to_string()) {
            Entry::Occupied(e) => {
                return Err(LedgerError::AlreadyReserved {
                    task_id: task_id.to_string(),
                    agent_id: e.get().clone(),
                });
            }
            Entry::Vacant(v) => v,
        };

        let mut account = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| LedgerError::UnknownAgent(agent_id.to_string()))?;

        let free = account.capacity.saturating_sub(&account.in_use);
        if let Some(kind) = amounts.first_exceeding(&free) {
            return Err(LedgerError::InsufficientCapacity {
                agent_id: agent_id.to_string(),
                scope: CapacityScope::Agent,
                kind,
                requested: amounts.get(kind),
                available: free.get(kind),
            });
        }

        self.totals
            .try_claim(&amounts, &self.limits)
            .map_err(|(kind, requested, available)| LedgerError::InsufficientCapacity {
                agent_id: agent_id.to_string(),
                scope: CapacityScope::System,
                kind,
                requested,
                available,
            })?;

        let reservation = Reservation {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            amounts,
            created_at: now,
        };
        account.in_use = account.in_use.saturating_add(&amounts);
        account
            .reservations
            .insert(task_id.to_string(), reservation.clone());
        self.persist_reserve(&reservation);
        drop(account);
        slot.insert(agent_id.to_string());

        debug!(%agent_id, %task_id, %amounts, "reservation granted");
        Ok(reservation)
    }

    /// Release a reservation.
    ///
    /// Releasing the same reservation twice returns `AlreadyReleased`; the
    /// capacity is only ever returned once.
    pub fn release(&self, reservation: &Reservation) -> LedgerResult<Resources> {
        let already = || LedgerError::AlreadyReleased(reservation.id.clone());

        let Entry::Occupied(slot) = self.by_task.entry(reservation.task_id.clone()) else {
            return Err(already());
        };
        if slot.get() != &reservation.agent_id {
            return Err(already());
        }

        let mut account = self
            .agents
            .get_mut(&reservation.agent_id)
            .ok_or_else(already)?;
        let matches = account
            .reservations
            .get(&reservation.task_id)
            .is_some_and(|held| held.id == reservation.id);
        if !matches {
            return Err(already());
        }
        let Some(held) = account.reservations.remove(&reservation.task_id) else {
            return Err(already());
        };
        account.in_use = account.in_use.saturating_sub(&held.amounts);
        self.totals.release(&held.amounts);
        self.persist_release(&held);
        drop(account);
        slot.remove();

        debug!(
            agent_id = %held.agent_id,
            task_id = %held.task_id,
            amounts = %held.amounts,
            "reservation released"
        );
        Ok(held.amounts)
    }

    /// Release whatever reservation `task_id` holds, if any.
    pub fn release_task(&self, task_id: &str) -> Option<Reservation> {
        let reservation = self.reservation_for_task(task_id)?;
        match self.release(&reservation) {
            Ok(_) => Some(reservation),
            Err(e) => {
                debug!(%task_id, error = %e, "task reservation already gone");
                None
            }
        }
    }

    /// Release every reservation held on `agent_id`.
    pub fn release_all(&self, agent_id: &str) -> Vec<Reservation> {
        let held: Vec<Reservation> = match self.agents.get(agent_id) {
            Some(account) => account.reservations.values().cloned().collect(),
            None => return Vec::new(),
        };

        held.into_iter()
            .filter(|r| match self.release(r) {
                Ok(_) => true,
                Err(e) => {
                    debug!(%agent_id, error = %e, "skipping reservation released concurrently");
                    false
                }
            })
            .collect()
    }

    /// Reinstate a reservation loaded from the state store after a restart.
    ///
    /// Bypasses limit checks: the claim was valid when it was granted.
    pub fn restore(&self, reservation: Reservation) -> LedgerResult<()> {
        let slot = match self.by_task.entry(reservation.task_id.clone()) {
            Entry::Occupied(e) => {
                return Err(LedgerError::AlreadyReserved {
                    task_id: reservation.task_id.clone(),
                    agent_id: e.get().clone(),
                });
            }
            Entry::Vacant(v) => v,
        };
        let mut account = self
            .agents
            .get_mut(&reservation.agent_id)
            .ok_or_else(|| LedgerError::UnknownAgent(reservation.agent_id.clone()))?;
        account.in_use = account.in_use.saturating_add(&reservation.amounts);
        self.totals.add_in_use(&reservation.amounts);
        let agent_id = reservation.agent_id.clone();
        account
            .reservations
            .insert(reservation.task_id.clone(), reservation);
        drop(account);
        slot.insert(agent_id);
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Aggregate capacity and usage across all agents.
    pub fn utilization(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            capacity: Totals::load(&self.totals.capacity),
            in_use: Totals::load(&self.totals.in_use),
            agents: self.agents.len(),
            reservations: self.by_task.len(),
        }
    }

    pub fn capacity_for(&self, agent_id: &str) -> Option<Resources> {
        self.agents.get(agent_id).map(|a| a.capacity)
    }

    pub fn free_for(&self, agent_id: &str) -> Option<Resources> {
        self.agents
            .get(agent_id)
            .map(|a| a.capacity.saturating_sub(&a.in_use))
    }

    pub fn usage(&self, agent_id: &str) -> Option<AgentUsage> {
        self.agents.get(agent_id).map(|a| AgentUsage {
            agent_id: agent_id.to_string(),
            capacity: a.capacity,
            in_use: a.in_use,
            reservations: a.reservations.len(),
        })
    }

    pub fn usages(&self) -> Vec<AgentUsage> {
        self.agents
            .iter()
            .map(|entry| AgentUsage {
                agent_id: entry.key().clone(),
                capacity: entry.capacity,
                in_use: entry.in_use,
                reservations: entry.reservations.len(),
            })
            .collect()
    }

    pub fn reservations_for(&self, agent_id: &str) -> Vec<Reservation> {
        self.agents
            .get(agent_id)
            .map(|a| a.reservations.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reservation_for_task(&self, task_id: &str) -> Option<Reservation> {
        let agent_id = self.by_task.get(task_id)?.clone();
        let account = self.agents.get(&agent_id)?;
        account.reservations.get(task_id).cloned()
    }

    pub fn has_reservations(&self, agent_id: &str) -> bool {
        self.agents
            .get(agent_id)
            .is_some_and(|a| !a.reservations.is_empty())
    }

    pub fn contains_agent(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    // ── Persistence ────────────────────────────────────────────────

    fn persist_reserve(&self, reservation: &Reservation) {
        if let Some(store) = &self.store
            && let Err(e) = store.put_reservation(reservation)
        {
            warn!(task_id = %reservation.task_id, error = %e, "failed to persist reservation");
        }
    }

    fn persist_release(&self, reservation: &Reservation) {
        if let Some(store) = &self.store
            && let Err(e) = store.delete_reservation(&reservation.task_id)
        {
            warn!(task_id = %reservation.task_id, error = %e, "failed to delete persisted reservation");
        }
    }
}
