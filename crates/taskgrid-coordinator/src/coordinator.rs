//! The assignment cycle.
//!
//! Each cycle pulls a bounded batch of eligible tasks in queue order and
//! places them one at a time:
//!
//! ```text
//! candidate ─► strategy.select ─► ledger.reserve ─► queue.mark_assigned
//!                   │ none             │ insufficient       │ lost the CAS
//!                   ▼                  ▼                    ▼
//!            stays pending      stays pending        reservation released
//! ```
//!
//! An assignment whose reservation vanished by the time it landed (the
//! agent failed mid-placement) is requeued on the spot.
//!
//! The agent snapshot is taken once per cycle and adjusted locally after
//! each placement, so later tasks in the batch see the capacity earlier
//! ones took. The ledger re-checks every reservation regardless.

use std::sync::Arc;

use tracing::{debug, info, warn};

use taskgrid_health::{HealthMonitor, Liveness};
use taskgrid_ledger::ResourceLedger;
use taskgrid_metrics::MetricsCollector;
use taskgrid_placement::{AgentView, PlacementStrategy, Selection};
use taskgrid_queue::TaskQueue;
use taskgrid_state::{AgentId, ErrorKind, ReservationId, TaskId, TaskRecord};

use crate::registry::AgentRegistry;
use crate::runtime::WorkerRuntime;

/// A task placed on an agent during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub reservation_id: ReservationId,
    /// Name of the policy that chose the agent.
    pub strategy: &'static str,
    /// Time from eligible to assigned.
    pub latency_ms: u64,
    pub assigned_at: u64,
}

/// Why a candidate was left pending.
enum Skip {
    NoAgent,
    Capacity(String),
    Raced,
}

pub struct Coordinator {
    registry: Arc<AgentRegistry>,
    ledger: Arc<ResourceLedger>,
    queue: Arc<TaskQueue>,
    health: Arc<HealthMonitor>,
    strategy: Arc<dyn PlacementStrategy>,
    metrics: Arc<MetricsCollector>,
    runtime: Arc<dyn WorkerRuntime>,
    batch_size: usize,
    latency_target_ms: u64,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        ledger: Arc<ResourceLedger>,
        queue: Arc<TaskQueue>,
        health: Arc<HealthMonitor>,
        strategy: Arc<dyn PlacementStrategy>,
        metrics: Arc<MetricsCollector>,
        runtime: Arc<dyn WorkerRuntime>,
        batch_size: usize,
        latency_target_ms: u64,
    ) -> Self {
        Self {
            registry,
            ledger,
            queue,
            health,
            strategy,
            metrics,
            runtime,
            batch_size,
            latency_target_ms,
        }
    }

    pub fn strategy(&self) -> &Arc<dyn PlacementStrategy> {
        &self.strategy
    }

    /// Run one cycle. Returns the assignments made, in queue order.
    pub fn assign_next_batch(&self, now: u64) -> Vec<Assignment> {
        let candidates = self.queue.dequeue_candidates(self.batch_size);
        if candidates.is_empty() {
            return Vec::new();
        }
        let mut views = self.agent_views();
        let mut made = Vec::new();
        let mut left = 0usize;

        for task in &candidates {
            match self.place(task, &views, now) {
                Ok(assignment) => {
                    if let Some(view) = views.iter_mut().find(|v| v.id == assignment.agent_id) {
                        view.free = view.free.saturating_sub(&task.demand);
                        view.active_tasks += 1;
                    }
                    made.push(assignment);
                }
                Err(Skip::NoAgent) => {
                    left += 1;
                    self.queue.record_error(
                        &task.id,
                        ErrorKind::InsufficientCapacity,
                        "no eligible agent can host the demand",
                        now,
                    );
                }
                Err(Skip::Capacity(message)) => {
                    left += 1;
                    self.queue
                        .record_error(&task.id, ErrorKind::InsufficientCapacity, &message, now);
                }
                Err(Skip::Raced) => left += 1,
            }
        }

        if !made.is_empty() || left > 0 {
            debug!(
                candidates = candidates.len(),
                assigned = made.len(),
                pending = left,
                "assignment cycle"
            );
        }
        made
    }

    /// Schedulable agents whose liveness is confirmed, with their current
    /// free capacity.
    pub fn agent_views(&self) -> Vec<AgentView> {
        self.registry
            .list()
            .into_iter()
            .filter(|a| a.status.is_schedulable())
            .filter(|a| self.health.liveness(&a.id) == Some(Liveness::Healthy))
            .filter_map(|a| {
                let usage = self.ledger.usage(&a.id)?;
                Some(AgentView {
                    free: usage.free(),
                    active_tasks: usage.reservations,
                    id: a.id,
                    registration_seq: a.registration_seq,
                    status: a.status,
                    tags: a.tags,
                    capacity: usage.capacity,
                })
            })
            .collect()
    }

    fn place(&self, task: &TaskRecord, views: &[AgentView], now: u64) -> Result<Assignment, Skip> {
        let Selection { agent_id, via } = self.strategy.select(task, views).ok_or(Skip::NoAgent)?;

        let reservation = match self.ledger.reserve(&agent_id, &task.id, task.demand, now) {
            Ok(r) => r,
            Err(e) if e.is_insufficient_capacity() => {
                debug!(task_id = %task.id, %agent_id, error = %e, "reservation refused");
                return Err(Skip::Capacity(e.to_string()));
            }
            Err(e) => {
                warn!(task_id = %task.id, %agent_id, error = %e, "reservation failed");
                return Err(Skip::Raced);
            }
        };

        // The agent may have started draining or failed since the snapshot.
        let still_open = self
            .registry
            .status(&agent_id)
            .is_some_and(|s| s.is_schedulable());
        if !still_open {
            self.rollback(&reservation);
            debug!(task_id = %task.id, %agent_id, "agent left the schedulable set mid-cycle");
            return Err(Skip::Raced);
        }

        if let Err(e) = self.queue.mark_assigned(&task.id, &agent_id, now) {
            self.rollback(&reservation);
            debug!(task_id = %task.id, error = %e, "task no longer pending, reservation rolled back");
            return Err(Skip::Raced);
        }

        // Recovery may have released the agent after the status check and
        // scanned its tasks before this one was assigned.
        let held = self
            .ledger
            .reservation_for_task(&task.id)
            .is_some_and(|r| r.id == reservation.id);
        if !held {
            self.recover_lost(&task.id, &agent_id, now);
            return Err(Skip::Raced);
        }

        let selection = Selection {
            agent_id: agent_id.clone(),
            via,
        };
        self.strategy.on_assigned(task, &selection);
        self.registry
            .refresh_load(&agent_id, self.ledger.reservations_for(&agent_id).len(), now);

        let latency_ms = now.saturating_sub(task.eligible_at.unwrap_or(task.submitted_at));
        if latency_ms > self.latency_target_ms {
            info!(task_id = %task.id, latency_ms, target_ms = self.latency_target_ms, "assignment latency above target");
        }
        self.metrics
            .record_assignment(&task.id, &agent_id, via, latency_ms, now);

        let assignment = Assignment {
            task_id: task.id.clone(),
            agent_id,
            reservation_id: reservation.id,
            strategy: via,
            latency_ms,
            assigned_at: now,
        };
        if let Err(e) = self.runtime.dispatch(&assignment) {
            warn!(task_id = %assignment.task_id, agent_id = %assignment.agent_id, error = %e, "dispatch failed");
        }
        Ok(assignment)
    }

    fn recover_lost(&self, task_id: &str, agent_id: &str, now: u64) {
        match self.queue.requeue_from(
            task_id,
            agent_id,
            ErrorKind::AgentUnhealthy,
            "agent failed during assignment",
            now,
        ) {
            Ok(outcome) => {
                warn!(%task_id, %agent_id, "reservation lost during assignment, task requeued");
                if outcome.is_terminal() {
                    self.metrics.record_failure();
                } else {
                    self.metrics.record_requeue();
                }
            }
            Err(e) => debug!(%task_id, error = %e, "lost assignment already recovered"),
        }
    }

    fn rollback(&self, reservation: &taskgrid_state::Reservation) {
        if let Err(e) = self.ledger.release(reservation) {
            warn!(task_id = %reservation.task_id, error = %e, "rollback release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use taskgrid_core::{AdaptiveConfig, DependencyFailurePolicy, LimitFractions, Resources, StrategyKind};
    use taskgrid_placement::build_strategy;
    use taskgrid_state::{TaskSpec, TaskStatus};

    use super::*;

    /// Records dispatches and refuses every one of them.
    #[derive(Default)]
    struct RefusingRuntime {
        seen: Mutex<Vec<TaskId>>,
    }

    impl WorkerRuntime for RefusingRuntime {
        fn dispatch(&self, assignment: &Assignment) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(assignment.task_id.clone());
            anyhow::bail!("agent unreachable")
        }

        fn stop(&self, _agent_id: &str, _task_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<AgentRegistry>,
        ledger: Arc<ResourceLedger>,
        queue: Arc<TaskQueue>,
        health: Arc<HealthMonitor>,
        runtime: Arc<RefusingRuntime>,
        coordinator: Coordinator,
    }

    fn fixture(kind: StrategyKind, batch_size: usize) -> Fixture {
        let registry = Arc::new(AgentRegistry::new(8));
        let ledger = Arc::new(ResourceLedger::new(LimitFractions::default()));
        let queue = Arc::new(TaskQueue::new(3, DependencyFailurePolicy::Cancel));
        let health = Arc::new(HealthMonitor::new(Duration::from_secs(10), 3));
        let runtime = Arc::new(RefusingRuntime::default());
        let coordinator = Coordinator::new(
            registry.clone(),
            ledger.clone(),
            queue.clone(),
            health.clone(),
            Arc::from(build_strategy(kind, &AdaptiveConfig::default())),
            Arc::new(MetricsCollector::new(16)),
            runtime.clone(),
            batch_size,
            500,
        );
        Fixture {
            registry,
            ledger,
            queue,
            health,
            runtime,
            coordinator,
        }
    }

    impl Fixture {
        fn agent(&self, id: &str, cores: u64) {
            self.registry
                .register(id, Resources::cpu(cores), BTreeSet::new(), 0)
                .unwrap();
            self.ledger.register_agent(id, Resources::cpu(cores)).unwrap();
            self.health.track(id, 0);
        }
    }

    #[test]
    fn later_tasks_see_capacity_taken_earlier_in_the_cycle() {
        let f = fixture(StrategyKind::RoundRobin, 8);
        f.agent("a", 1);
        f.agent("b", 2);
        let ids: Vec<_> = (0..4)
            .map(|_| f.queue.enqueue(TaskSpec::new(1, Resources::cpu(1)), 0).unwrap())
            .collect();

        let made = f.coordinator.assign_next_batch(10);
        assert_eq!(made.len(), 3);
        assert_eq!(f.ledger.usage("a").unwrap().reservations, 1);
        assert_eq!(f.ledger.usage("b").unwrap().reservations, 2);
        assert_eq!(f.queue.status(&ids[3]), Some(TaskStatus::Pending));
        assert_eq!(f.registry.status("b"), Some(taskgrid_state::AgentStatus::Busy));
    }

    #[test]
    fn batch_size_bounds_a_cycle() {
        let f = fixture(StrategyKind::ResourceAware, 2);
        f.agent("a", 8);
        for _ in 0..5 {
            f.queue.enqueue(TaskSpec::new(1, Resources::cpu(1)), 0).unwrap();
        }
        assert_eq!(f.coordinator.assign_next_batch(10).len(), 2);
        assert_eq!(f.coordinator.assign_next_batch(20).len(), 2);
        assert_eq!(f.queue.pending_count(), 1);
    }

    #[test]
    fn dispatch_failure_keeps_the_assignment() {
        let f = fixture(StrategyKind::Priority, 8);
        f.agent("a", 2);
        let id = f.queue.enqueue(TaskSpec::new(1, Resources::cpu(1)), 0).unwrap();

        let made = f.coordinator.assign_next_batch(10);
        assert_eq!(made.len(), 1);
        assert_eq!(made[0].strategy, "priority");
        assert_eq!(made[0].latency_ms, 10);
        assert_eq!(*f.runtime.seen.lock().unwrap(), vec![id.clone()]);
        assert_eq!(f.queue.status(&id), Some(TaskStatus::Assigned));
        assert!(f.ledger.reservation_for_task(&id).is_some());
    }

    #[test]
    fn only_confirmed_schedulable_agents_are_offered() {
        let f = fixture(StrategyKind::RoundRobin, 8);
        f.agent("a", 2);
        f.agent("b", 2);
        f.agent("c", 2);
        f.registry
            .set_status("b", taskgrid_state::AgentStatus::Draining, 1)
            .unwrap();
        f.health.restore("c", 0, 1);

        let ids: Vec<_> = f.coordinator.agent_views().into_iter().map(|v| v.id).collect();
        assert_eq!(ids, vec!["a"]);
    }
}
