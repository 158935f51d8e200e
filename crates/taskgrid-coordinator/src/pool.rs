//! The pool facade: every external interface of a TaskGrid pool.
//!
//! A `Pool` owns one registry, ledger, queue, health monitor, scaling
//! controller and metrics collector. Nothing is global, so independent
//! pools can run side by side in one process.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use taskgrid_autoscale::{
    DrainCandidate, NoopProvisioner, PoolSize, Provisioner, ScalingController, ScalingPhase,
    ScalingPolicy,
};
use taskgrid_core::{GridConfig, Resources};
use taskgrid_health::{HealthMonitor, Liveness};
use taskgrid_ledger::{LedgerSnapshot, ResourceLedger};
use taskgrid_metrics::{MetricsCollector, PoolMetrics};
use taskgrid_placement::{PlacementOutcome, PlacementStrategy, build_strategy};
use taskgrid_queue::{CancelOutcome, FailOutcome, QueueError, TaskQueue};
use taskgrid_state::{
    AgentId, AgentRecord, AgentStatus, ErrorKind, MetricsSample, ScalingDecision,
    ScalingDirection, StateStore, TaskId, TaskRecord, TaskSpec, TaskStatus, epoch_ms,
};

use crate::coordinator::{Assignment, Coordinator};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::registry::AgentRegistry;
use crate::runtime::{NoopRuntime, WorkerRuntime};

/// Work recovered from agents that failed or left.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Agents newly marked unhealthy.
    pub unhealthy: Vec<AgentId>,
    /// Tasks returned to `pending`.
    pub requeued: Vec<TaskId>,
    /// Tasks whose retry budget ran out.
    pub failed: Vec<TaskId>,
    pub released: usize,
}

/// What a restart brought back from the state store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub agents: usize,
    pub tasks: usize,
    pub reservations: usize,
    /// Reservations whose task was no longer in flight on that agent.
    pub orphaned: usize,
    /// In-flight tasks whose reservation did not survive.
    pub requeued: usize,
}

pub struct PoolBuilder {
    config: GridConfig,
    store: Option<StateStore>,
    runtime: Arc<dyn WorkerRuntime>,
    provisioner: Arc<dyn Provisioner>,
}

impl PoolBuilder {
    pub fn new(config: GridConfig) -> Self {
        Self {
            config,
            store: None,
            runtime: Arc::new(NoopRuntime),
            provisioner: Arc::new(NoopProvisioner),
        }
    }

    /// Persist all state to `store` and recover from it on build.
    pub fn store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn WorkerRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Validate the configuration and assemble the pool. With a store,
    /// state persisted by a previous run is restored as of `now`.
    pub fn build(self, now: u64) -> CoordinatorResult<Pool> {
        let cfg = self.config;
        cfg.validate()?;

        let mut registry = AgentRegistry::new(cfg.scaling.max_agents);
        let mut ledger = ResourceLedger::new(cfg.limits.fractions());
        let mut queue = TaskQueue::new(
            cfg.coordinator.max_retries,
            cfg.coordinator.dependency_failure,
        );
        let metrics = match &self.store {
            Some(store) => MetricsCollector::with_store(store.clone(), cfg.metrics.history),
            None => MetricsCollector::new(cfg.metrics.history),
        };
        if let Some(store) = &self.store {
            registry = registry.with_store(store.clone());
            ledger = ledger.with_store(store.clone());
            queue = queue.with_store(store.clone());
        }

        let registry = Arc::new(registry);
        let ledger = Arc::new(ledger);
        let queue = Arc::new(queue);
        let metrics = Arc::new(metrics);
        let health = Arc::new(HealthMonitor::from_config(&cfg)?);
        let strategy: Arc<dyn PlacementStrategy> =
            Arc::from(build_strategy(cfg.coordinator.strategy, &cfg.adaptive));
        let scaler = ScalingController::new(ScalingPolicy::from_config(&cfg)?);

        let coordinator = Coordinator::new(
            registry.clone(),
            ledger.clone(),
            queue.clone(),
            health.clone(),
            strategy,
            metrics.clone(),
            self.runtime.clone(),
            cfg.coordinator.batch_size,
            cfg.assignment_latency_target()?.as_millis() as u64,
        );

        let mut pool = Pool {
            config: cfg,
            store: self.store,
            registry,
            ledger,
            queue,
            health,
            scaler: Mutex::new(scaler),
            metrics,
            coordinator,
            runtime: self.runtime,
            provisioner: self.provisioner,
            restored: RestoreSummary::default(),
        };
        if pool.store.is_some() {
            pool.restored = pool.restore(now)?;
        }
        info!(
            strategy = pool.coordinator.strategy().name(),
            max_agents = pool.config.scaling.max_agents,
            "pool ready"
        );
        Ok(pool)
    }
}

pub struct Pool {
    config: GridConfig,
    store: Option<StateStore>,
    registry: Arc<AgentRegistry>,
    ledger: Arc<ResourceLedger>,
    queue: Arc<TaskQueue>,
    health: Arc<HealthMonitor>,
    scaler: Mutex<ScalingController>,
    metrics: Arc<MetricsCollector>,
    coordinator: Coordinator,
    runtime: Arc<dyn WorkerRuntime>,
    provisioner: Arc<dyn Provisioner>,
    restored: RestoreSummary,
}

impl Pool {
    /// A pool with no persistence.
    pub fn in_memory(config: GridConfig) -> CoordinatorResult<Self> {
        PoolBuilder::new(config).build(epoch_ms())
    }

    /// A pool backed by `store`, recovering whatever it holds.
    pub fn open(config: GridConfig, store: StateStore, now: u64) -> CoordinatorResult<Self> {
        PoolBuilder::new(config).store(store).build(now)
    }

    fn scaler(&self) -> MutexGuard<'_, ScalingController> {
        self.scaler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Restart recovery ───────────────────────────────────────────

    fn restore(&self, now: u64) -> CoordinatorResult<RestoreSummary> {
        let Some(store) = &self.store else {
            return Ok(RestoreSummary::default());
        };
        let mut summary = RestoreSummary::default();

        for agent in store.list_agents()? {
            if agent.status == AgentStatus::Terminated {
                store.delete_agent(&agent.id)?;
                continue;
            }
            self.ledger.register_agent(&agent.id, agent.capacity)?;
            self.health.restore(&agent.id, agent.last_heartbeat, now);
            self.registry.restore(agent);
            summary.agents += 1;
        }

        for task in store.list_tasks()? {
            self.queue.restore(task);
            summary.tasks += 1;
        }

        for reservation in store.list_reservations()? {
            let held = self.queue.get(&reservation.task_id).is_some_and(|t| {
                t.status.is_in_flight()
                    && t.assigned_agent.as_deref() == Some(reservation.agent_id.as_str())
            });
            if !held {
                warn!(task_id = %reservation.task_id, agent_id = %reservation.agent_id, "dropping orphaned reservation");
                store.delete_reservation(&reservation.task_id)?;
                summary.orphaned += 1;
                continue;
            }
            match self.ledger.restore(reservation) {
                Ok(()) => summary.reservations += 1,
                Err(e) => warn!(error = %e, "reservation not restored"),
            }
        }

        for task in self.queue.in_flight() {
            if self.ledger.reservation_for_task(&task.id).is_none() {
                self.queue.requeue(
                    &task.id,
                    ErrorKind::AgentUnhealthy,
                    "reservation lost across restart",
                    now,
                )?;
                summary.requeued += 1;
            }
        }

        for agent in self.registry.list() {
            self.refresh_load(&agent.id, now);
        }
        if let Some(decision) = store.latest_decision()? {
            self.scaler().restore(decision, now);
        }
        self.metrics
            .restore_history(store.list_metrics(self.config.metrics.history)?);

        info!(
            agents = summary.agents,
            tasks = summary.tasks,
            reservations = summary.reservations,
            orphaned = summary.orphaned,
            requeued = summary.requeued,
            "pool state restored, agents await a heartbeat"
        );
        Ok(summary)
    }

    // ── Agent registration ─────────────────────────────────────────

    /// Admit an agent. The returned error says why it was rejected.
    pub fn register(
        &self,
        agent_id: &str,
        capacity: Resources,
        tags: BTreeSet<String>,
        now: u64,
    ) -> CoordinatorResult<AgentRecord> {
        let record = self.registry.register(agent_id, capacity, tags, now)?;
        if let Err(e) = self.ledger.register_agent(agent_id, capacity) {
            self.registry.remove(agent_id);
            return Err(e.into());
        }
        self.health.track(agent_id, now);
        Ok(record)
    }

    /// Remove an agent. Refused while it holds reservations unless `force`,
    /// in which case its tasks are requeued first.
    pub fn deregister(&self, agent_id: &str, force: bool, now: u64) -> CoordinatorResult<AgentRecord> {
        if self.registry.status(agent_id).is_none() {
            return Err(CoordinatorError::UnknownAgent(agent_id.to_string()));
        }
        let held = self.ledger.reservations_for(agent_id).len();
        if held > 0 {
            if !force {
                return Err(CoordinatorError::AgentBusy {
                    agent_id: agent_id.to_string(),
                    reservations: held,
                });
            }
            let mut report = RecoveryReport::default();
            self.evacuate(agent_id, "agent deregistered", now, &mut report);
        }

        self.ledger.remove_agent(agent_id)?;
        self.health.untrack(agent_id);
        self.coordinator.strategy().forget_agent(agent_id);
        self.scaler().withdraw_candidate(agent_id);
        self.registry.set_status(agent_id, AgentStatus::Terminated, now)?;
        self.registry
            .remove(agent_id)
            .ok_or_else(|| CoordinatorError::UnknownAgent(agent_id.to_string()))
    }

    /// Record a heartbeat sent at `ts`. Revives an unhealthy agent.
    pub fn heartbeat(&self, agent_id: &str, ts: u64) -> CoordinatorResult<()> {
        let beat = self
            .health
            .record_heartbeat(agent_id, ts)
            .ok_or_else(|| CoordinatorError::UnknownAgent(agent_id.to_string()))?;
        self.registry.touch(agent_id, ts)?;
        // Recovery can mark the agent unhealthy after the tracker already
        // revived, so the registry is checked on every healthy beat.
        if beat.current == Liveness::Healthy
            && self.registry.status(agent_id) == Some(AgentStatus::Unhealthy)
        {
            self.registry.set_status(agent_id, AgentStatus::Idle, ts)?;
            self.refresh_load(agent_id, ts);
            self.scaler().withdraw_candidate(agent_id);
        }
        Ok(())
    }

    // ── Task submission ────────────────────────────────────────────

    pub fn submit(&self, spec: TaskSpec, now: u64) -> CoordinatorResult<TaskId> {
        Ok(self.queue.enqueue(spec, now)?)
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.queue.status(task_id)
    }

    /// Full record: status, last error kind and attempt history.
    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.queue.get(task_id)
    }

    /// Cancel a task that has not completed. An in-flight task's
    /// reservation is released and its agent is asked to stop it.
    pub fn cancel(&self, task_id: &str, now: u64) -> CoordinatorResult<CancelOutcome> {
        let outcome = self.queue.cancel(task_id, now)?;
        if let Some(agent_id) = &outcome.agent_id {
            self.ledger.release_task(task_id);
            self.coordinator.strategy().forget(task_id);
            if let Err(e) = self.runtime.stop(agent_id, task_id) {
                debug!(%task_id, %agent_id, error = %e, "stop signal not delivered");
            }
            self.refresh_load(agent_id, now);
        }
        Ok(outcome)
    }

    /// Put a terminally failed or cancelled task back in the queue.
    pub fn resubmit(&self, task_id: &str, now: u64) -> CoordinatorResult<()> {
        Ok(self.queue.resubmit(task_id, now)?)
    }

    // ── Worker execution bridge ────────────────────────────────────

    pub fn notify_started(&self, task_id: &str, agent_id: &str, now: u64) -> CoordinatorResult<()> {
        Ok(self.queue.mark_running(task_id, agent_id, now)?)
    }

    pub fn notify_completed(
        &self,
        task_id: &str,
        result_ref: Option<String>,
        now: u64,
    ) -> CoordinatorResult<TaskRecord> {
        let record = self.queue.mark_completed(task_id, result_ref, now)?;
        self.ledger.release_task(task_id);
        if let Some(agent_id) = &record.assigned_agent {
            self.report_outcome(&record, agent_id, true, now);
            self.refresh_load(agent_id, now);
        }
        self.metrics.record_completion();
        Ok(record)
    }

    /// The worker reported a failure. With `retry` the task goes back to
    /// the queue while its retry budget lasts.
    pub fn notify_failed(
        &self,
        task_id: &str,
        message: &str,
        retry: bool,
        now: u64,
    ) -> CoordinatorResult<FailOutcome> {
        let before = self
            .queue
            .get(task_id)
            .ok_or_else(|| QueueError::UnknownTask(task_id.to_string()))?;
        let outcome = self
            .queue
            .mark_failed(task_id, ErrorKind::WorkerFailed, message, retry, now)?;
        self.ledger.release_task(task_id);
        if let Some(agent_id) = outcome.agent_id() {
            self.report_outcome(&before, agent_id, false, now);
            self.refresh_load(agent_id, now);
        }
        if outcome.is_terminal() {
            self.metrics.record_failure();
        } else {
            self.metrics.record_requeue();
        }
        Ok(outcome)
    }

    // ── Control-loop entry points ──────────────────────────────────

    pub fn assign_next_batch(&self, now: u64) -> Vec<Assignment> {
        self.coordinator.assign_next_batch(now)
    }

    /// Mark agents that stopped heartbeating unhealthy and recover their
    /// work.
    pub fn sweep_health(&self, now: u64) -> RecoveryReport {
        let failed = self.health.sweep(now);
        if failed.is_empty() {
            return RecoveryReport::default();
        }
        self.recover_agents(&failed, now)
    }

    /// For each agent: mark it unhealthy, release its reservations,
    /// requeue each of its tasks once, and report it for removal.
    pub fn recover_agents(&self, agent_ids: &[AgentId], now: u64) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        for agent_id in agent_ids {
            if self.health.liveness(agent_id) != Some(Liveness::Unhealthy) {
                debug!(%agent_id, "agent heartbeated since the sweep, not recovering");
                continue;
            }
            if let Err(e) = self.registry.set_status(agent_id, AgentStatus::Unhealthy, now) {
                debug!(%agent_id, error = %e, "not recovering agent");
                continue;
            }
            report.unhealthy.push(agent_id.clone());
            let before = report.requeued.len() + report.failed.len();
            self.evacuate(agent_id, "agent missed heartbeats", now, &mut report);
            self.scaler().report_removal_candidate(agent_id);
            warn!(
                %agent_id,
                tasks = report.requeued.len() + report.failed.len() - before,
                "agent failed, work recovered"
            );
        }
        self.metrics
            .record_sweep(&report.unhealthy, report.requeued.len(), now);
        report
    }

    /// Requeue every in-flight task on `agent_id` and release everything
    /// it holds.
    fn evacuate(&self, agent_id: &str, reason: &str, now: u64, report: &mut RecoveryReport) {
        report.released += self.ledger.release_all(agent_id).len();
        for task_id in self.queue.tasks_on_agent(agent_id) {
            let Some(before) = self.queue.get(&task_id) else {
                continue;
            };
            match self
                .queue
                .requeue_from(&task_id, agent_id, ErrorKind::AgentUnhealthy, reason, now)
            {
                Ok(outcome) => {
                    self.report_outcome(&before, agent_id, false, now);
                    if outcome.is_terminal() {
                        self.metrics.record_failure();
                        report.failed.push(task_id);
                    } else {
                        self.metrics.record_requeue();
                        report.requeued.push(task_id);
                    }
                }
                Err(e) => debug!(%task_id, error = %e, "task left the agent concurrently"),
            }
        }
    }

    /// The pool's current metrics sample. Nothing is recorded.
    pub fn metrics_sample(&self, now: u64) -> MetricsSample {
        MetricsSample {
            at: now,
            utilization: self.ledger.utilization().aggregate(),
            queue_depth: self.queue.eligible_count() as u64,
            agents: self.registry.live_count(),
            schedulable_agents: self.registry.schedulable_count(),
        }
    }

    /// Take a sample and add it to the metrics history.
    pub fn record_sample(&self, now: u64) -> MetricsSample {
        let sample = self.metrics_sample(now);
        self.metrics.record_sample(sample.clone());
        sample
    }

    /// Evaluate the recorded metrics history and act on the decision.
    pub fn evaluate_scaling(&self, now: u64) -> ScalingDecision {
        let window = self.metrics.window(0);
        let size = PoolSize::new(self.registry.active_count(), self.registry.live_count());
        let mut decision = self.scaler().evaluate(&window, size, now);
        if decision.is_none() {
            debug!(reason = %decision.trigger.reason, "no scaling action");
            return decision;
        }
        self.apply_decision(&mut decision, now);
        decision
    }

    /// Carry out a decision: request agents for a scale-up, choose and mark
    /// agents for draining on a scale-down. The decision is persisted.
    pub fn apply_decision(&self, decision: &mut ScalingDecision, now: u64) {
        match decision.direction {
            ScalingDirection::None => return,
            ScalingDirection::Up => {
                if let Err(e) = self.provisioner.scale_up(decision.magnitude) {
                    warn!(magnitude = decision.magnitude, error = %e, "scale-up request failed");
                }
            }
            ScalingDirection::Down => {
                let candidates = self.drain_candidates();
                let drain = self
                    .scaler()
                    .select_for_drain(decision.magnitude, &candidates);
                for agent_id in &drain {
                    match self.registry.set_status(agent_id, AgentStatus::Draining, now) {
                        Ok(_) => info!(%agent_id, "agent draining"),
                        Err(e) => warn!(%agent_id, error = %e, "could not drain agent"),
                    }
                }
                decision.drain = drain;
            }
        }
        if let Some(store) = &self.store
            && let Err(e) = store.put_decision(decision)
        {
            warn!(error = %e, "failed to persist scaling decision");
        }
        self.metrics.record_decision(decision);
    }

    fn drain_candidates(&self) -> Vec<DrainCandidate> {
        self.registry
            .list()
            .into_iter()
            .filter(|a| a.status != AgentStatus::Terminated)
            .map(|a| {
                let usage = self.ledger.usage(&a.id);
                DrainCandidate {
                    utilization: usage.as_ref().map(|u| u.utilization()).unwrap_or(0.0),
                    reservations: usage.map(|u| u.reservations).unwrap_or(0),
                    draining: a.status == AgentStatus::Draining,
                    agent_id: a.id,
                }
            })
            .collect()
    }

    /// Terminate draining agents whose reservations have all been
    /// released. Agents still holding work are left draining.
    pub fn reap_drained(&self, now: u64) -> Vec<AgentId> {
        let mut reaped = Vec::new();
        for agent_id in self.registry.with_status(AgentStatus::Draining) {
            if self.ledger.has_reservations(&agent_id) {
                continue;
            }
            if let Err(e) = self.ledger.remove_agent(&agent_id) {
                debug!(%agent_id, error = %e, "drained agent picked up work, not removed");
                continue;
            }
            self.health.untrack(&agent_id);
            self.coordinator.strategy().forget_agent(&agent_id);
            if let Err(e) = self.provisioner.terminate(&agent_id) {
                warn!(%agent_id, error = %e, "terminate request failed");
            }
            if let Err(e) = self.registry.set_status(&agent_id, AgentStatus::Terminated, now) {
                warn!(%agent_id, error = %e, "terminated agent in unexpected state");
            }
            self.registry.remove(&agent_id);
            reaped.push(agent_id);
        }
        reaped
    }

    // ── Queries ────────────────────────────────────────────────────

    /// The most recent scaling decision and its justification.
    pub fn latest_decision(&self) -> Option<ScalingDecision> {
        if let Some(d) = self.scaler().last_decision() {
            return Some(d.clone());
        }
        let store = self.store.as_ref()?;
        store.latest_decision().ok().flatten()
    }

    /// Agents the health path reported for removal, oldest first.
    pub fn removal_candidates(&self) -> Vec<AgentId> {
        self.scaler().removal_candidates().to_vec()
    }

    pub fn scaling_phase(&self) -> ScalingPhase {
        self.scaler().phase()
    }

    pub fn utilization(&self) -> LedgerSnapshot {
        self.ledger.utilization()
    }

    /// Counters and latency percentiles over recent assignments.
    pub fn pool_metrics(&self, now: u64) -> PoolMetrics {
        self.metrics.peek(now)
    }

    /// What the last open recovered from the store.
    pub fn restored(&self) -> &RestoreSummary {
        &self.restored
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.registry.get(agent_id)
    }

    pub fn agents(&self) -> Vec<AgentRecord> {
        self.registry.list()
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn strategy_name(&self) -> &'static str {
        self.coordinator.strategy().name()
    }

    // ── Internals ──────────────────────────────────────────────────

    fn refresh_load(&self, agent_id: &str, now: u64) {
        let held = self
            .ledger
            .usage(agent_id)
            .map(|u| u.reservations)
            .unwrap_or(0);
        self.registry.refresh_load(agent_id, held, now);
    }

    fn report_outcome(&self, task: &TaskRecord, agent_id: &str, success: bool, now: u64) {
        let assigned_at = task.assigned_at.unwrap_or(now);
        self.coordinator.strategy().on_outcome(&PlacementOutcome {
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
            family: task.family.clone(),
            success,
            latency_ms: now.saturating_sub(assigned_at),
        });
    }
}
