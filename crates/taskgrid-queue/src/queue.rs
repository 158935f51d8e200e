//! The task queue.
//!
//! Every status change is a single compare-and-set on one task's entry.
//! No guard on one task is ever held while another task is looked up, so
//! unrelated tasks never contend and no two shards are locked at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskgrid_core::DependencyFailurePolicy;
use taskgrid_state::{
    AgentId, Attempt, ErrorKind, StateStore, TaskError, TaskId, TaskRecord, TaskSpec, TaskStatus,
};

use crate::error::{QueueError, QueueResult};

/// What `mark_failed` did with the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to `pending` for another attempt.
    Requeued {
        agent_id: Option<AgentId>,
        retry_count: u32,
    },
    /// Terminally `failed`. Dependents cancelled as a consequence are listed.
    Failed {
        agent_id: Option<AgentId>,
        kind: ErrorKind,
        retry_count: u32,
        cancelled: Vec<TaskId>,
    },
}

impl FailOutcome {
    /// The agent the failed attempt ran on.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            FailOutcome::Requeued { agent_id, .. } | FailOutcome::Failed { agent_id, .. } => {
                agent_id.as_deref()
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FailOutcome::Failed { .. })
    }
}

/// Result of cancelling a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub prior: TaskStatus,
    /// Set when the task was in flight; the caller releases its reservation
    /// and signals the worker.
    pub agent_id: Option<AgentId>,
    pub cancelled_dependents: Vec<TaskId>,
}

/// Priority- and dependency-aware task queue.
pub struct TaskQueue {
    tasks: DashMap<TaskId, TaskRecord>,
    seq: AtomicU64,
    max_retries: u32,
    policy: DependencyFailurePolicy,
    store: Option<StateStore>,
}

impl TaskQueue {
    pub fn new(max_retries: u32, policy: DependencyFailurePolicy) -> Self {
        Self {
            tasks: DashMap::new(),
            seq: AtomicU64::new(0),
            max_retries,
            policy,
            store: None,
        }
    }

    /// Persist every task mutation to `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn policy(&self) -> DependencyFailurePolicy {
        self.policy
    }

    /// Admit a task.
    ///
    /// Every dependency must already be known. A dependency that has already
    /// failed or been cancelled applies the failure policy straight away.
    pub fn enqueue(&self, spec: TaskSpec, now: u64) -> QueueResult<TaskId> {
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if spec.dependencies.contains(&id) {
            return Err(QueueError::SelfDependency(id));
        }

        let mut all_completed = true;
        let mut failed_dep = None;
        for dep in &spec.dependencies {
            let status = self.tasks.get(dep).map(|t| t.status).ok_or_else(|| {
                QueueError::UnknownDependency {
                    task_id: id.clone(),
                    dependency: dep.clone(),
                }
            })?;
            match status {
                TaskStatus::Completed => {}
                TaskStatus::Failed | TaskStatus::Cancelled => {
                    all_completed = false;
                    failed_dep.get_or_insert_with(|| dep.clone());
                }
                _ => all_completed = false,
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut record = TaskRecord::from_spec(id.clone(), spec, seq, now);
        if all_completed {
            record.eligible_at = Some(now);
        }

        match self.tasks.entry(id.clone()) {
            Entry::Occupied(_) => return Err(QueueError::DuplicateTask(id)),
            Entry::Vacant(v) => {
                self.persist(&record);
                info!(
                    task_id = %id,
                    priority = record.priority,
                    demand = %record.demand,
                    deps = record.dependencies.len(),
                    "task enqueued"
                );
                v.insert(record);
            }
        }

        // A dependency may also have failed between the check above and the
        // insert; re-check so the cascade cannot miss this task.
        let failed_dep = failed_dep.or_else(|| self.failed_dependency_of(&id));
        if let Some(dep) = failed_dep
            && self.policy == DependencyFailurePolicy::Cancel
            && self.cancel_for_dependency(&id, &dep, now)
        {
            self.cascade(&id, now);
        }

        Ok(id)
    }

    /// Up to `limit` pending tasks whose dependencies are all completed,
    /// ordered by priority then enqueue sequence.
    pub fn dequeue_candidates(&self, limit: usize) -> Vec<TaskRecord> {
        let statuses = self.statuses();
        let mut candidates: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| deps_completed(t, &statuses))
            .map(|t| t.value().clone())
            .collect();
        candidates.sort_by_key(TaskRecord::order_key);
        candidates.truncate(limit);
        candidates
    }

    /// `pending → assigned`. Fails if another caller got there first.
    pub fn mark_assigned(&self, task_id: &str, agent_id: &str, now: u64) -> QueueResult<()> {
        let mut task = self.entry_mut(task_id)?;
        if task.status != TaskStatus::Pending {
            return Err(transition(task_id, task.status, TaskStatus::Assigned));
        }
        task.status = TaskStatus::Assigned;
        task.assigned_agent = Some(agent_id.to_string());
        task.assigned_at = Some(now);
        task.updated_at = now;
        task.history.push(Attempt {
            agent_id: agent_id.to_string(),
            assigned_at: now,
            ended_at: None,
            error: None,
        });
        self.persist(&task);
        info!(%task_id, %agent_id, "task assigned");
        Ok(())
    }

    /// `assigned → running`, acknowledged by the agent the task is on.
    /// Repeating the acknowledgement is harmless.
    pub fn mark_running(&self, task_id: &str, agent_id: &str, now: u64) -> QueueResult<()> {
        let mut task = self.entry_mut(task_id)?;
        if task.assigned_agent.as_deref() != Some(agent_id) {
            return Err(QueueError::WrongAgent {
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
            });
        }
        match task.status {
            TaskStatus::Running => Ok(()),
            TaskStatus::Assigned => {
                task.status = TaskStatus::Running;
                task.started_at = Some(now);
                task.updated_at = now;
                self.persist(&task);
                info!(%task_id, %agent_id, "task running");
                Ok(())
            }
            other => Err(transition(task_id, other, TaskStatus::Running)),
        }
    }

    /// `assigned|running → completed`. Returns the final record.
    pub fn mark_completed(
        &self,
        task_id: &str,
        result_ref: Option<String>,
        now: u64,
    ) -> QueueResult<TaskRecord> {
        let record = {
            let mut task = self.entry_mut(task_id)?;
            if !task.status.is_in_flight() {
                return Err(transition(task_id, task.status, TaskStatus::Completed));
            }
            task.status = TaskStatus::Completed;
            task.result_ref = result_ref;
            task.finished_at = Some(now);
            task.updated_at = now;
            close_attempt(&mut task, now, None);
            self.persist(&task);
            task.clone()
        };
        info!(%task_id, agent_id = ?record.assigned_agent, "task completed");

        self.refresh_dependents(task_id, now);
        Ok(record)
    }

    /// Record a failed attempt.
    ///
    /// The retry count always increments. With `retry` and budget left the
    /// task returns to `pending`; otherwise it becomes terminally `failed`
    /// (`RetryLimitExceeded` when the budget ran out) and its dependents are
    /// handled per the dependency policy.
    pub fn mark_failed(
        &self,
        task_id: &str,
        kind: ErrorKind,
        message: &str,
        retry: bool,
        now: u64,
    ) -> QueueResult<FailOutcome> {
        self.fail_attempt(task_id, None, kind, message, retry, now)
    }

    fn fail_attempt(
        &self,
        task_id: &str,
        on_agent: Option<&str>,
        kind: ErrorKind,
        message: &str,
        retry: bool,
        now: u64,
    ) -> QueueResult<FailOutcome> {
        let (agent_id, retry_count, terminal_kind) = {
            let mut task = self.entry_mut(task_id)?;
            if !task.status.is_in_flight() {
                return Err(transition(task_id, task.status, TaskStatus::Failed));
            }
            if let Some(expected) = on_agent
                && task.assigned_agent.as_deref() != Some(expected)
            {
                return Err(QueueError::WrongAgent {
                    task_id: task_id.to_string(),
                    agent_id: expected.to_string(),
                });
            }
            let agent_id = task.assigned_agent.take();
            close_attempt(&mut task, now, Some(kind));
            task.retry_count += 1;
            task.assigned_at = None;
            task.started_at = None;
            task.updated_at = now;

            let terminal_kind = if retry && task.retry_count <= self.max_retries {
                task.status = TaskStatus::Pending;
                task.eligible_at = Some(now);
                task.last_error = Some(TaskError {
                    kind,
                    message: message.to_string(),
                    at: now,
                });
                None
            } else {
                let (final_kind, final_message) = if retry {
                    (
                        ErrorKind::RetryLimitExceeded,
                        format!("{kind} after {} attempt(s): {message}", task.retry_count),
                    )
                } else {
                    (kind, message.to_string())
                };
                task.status = TaskStatus::Failed;
                task.finished_at = Some(now);
                task.last_error = Some(TaskError {
                    kind: final_kind,
                    message: final_message,
                    at: now,
                });
                Some(final_kind)
            };
            self.persist(&task);
            (agent_id, task.retry_count, terminal_kind)
        };

        match terminal_kind {
            None => {
                warn!(%task_id, agent_id = ?agent_id, %kind, retry_count, "task attempt failed, requeued");
                Ok(FailOutcome::Requeued {
                    agent_id,
                    retry_count,
                })
            }
            Some(final_kind) => {
                warn!(%task_id, agent_id = ?agent_id, kind = %final_kind, retry_count, "task failed terminally");
                let cancelled = self.cascade(task_id, now);
                Ok(FailOutcome::Failed {
                    agent_id,
                    kind: final_kind,
                    retry_count,
                    cancelled,
                })
            }
        }
    }

    /// Put an in-flight task back for another attempt (recovery path).
    pub fn requeue(
        &self,
        task_id: &str,
        kind: ErrorKind,
        message: &str,
        now: u64,
    ) -> QueueResult<FailOutcome> {
        self.mark_failed(task_id, kind, message, true, now)
    }

    /// Like [`requeue`](Self::requeue), but only while the task is still in
    /// flight on `agent_id`. Two recovery paths racing over the same
    /// attempt requeue it once.
    pub fn requeue_from(
        &self,
        task_id: &str,
        agent_id: &str,
        kind: ErrorKind,
        message: &str,
        now: u64,
    ) -> QueueResult<FailOutcome> {
        self.fail_attempt(task_id, Some(agent_id), kind, message, true, now)
    }

    /// Cancel any task that has not completed.
    pub fn cancel(&self, task_id: &str, now: u64) -> QueueResult<CancelOutcome> {
        let (prior, agent_id) = {
            let mut task = self.entry_mut(task_id)?;
            let prior = task.status;
            if prior.is_terminal() {
                return Err(transition(task_id, prior, TaskStatus::Cancelled));
            }
            let agent_id = task.assigned_agent.take();
            if prior.is_in_flight() {
                close_attempt(&mut task, now, Some(ErrorKind::Cancelled));
            }
            task.status = TaskStatus::Cancelled;
            task.finished_at = Some(now);
            task.updated_at = now;
            task.last_error = Some(TaskError {
                kind: ErrorKind::Cancelled,
                message: "cancelled by submitter".to_string(),
                at: now,
            });
            self.persist(&task);
            (prior, agent_id)
        };
        info!(%task_id, %prior, agent_id = ?agent_id, "task cancelled");

        let cancelled_dependents = self.cascade(task_id, now);
        Ok(CancelOutcome {
            prior,
            agent_id,
            cancelled_dependents,
        })
    }

    /// Reset a terminally failed or cancelled task to `pending` with a fresh
    /// retry budget. Dependents held back under the `wait` policy become
    /// candidates again once it completes.
    pub fn resubmit(&self, task_id: &str, now: u64) -> QueueResult<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut task = self.entry_mut(task_id)?;
            if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                return Err(transition(task_id, task.status, TaskStatus::Pending));
            }
            task.status = TaskStatus::Pending;
            task.retry_count = 0;
            task.enqueue_seq = seq;
            task.finished_at = None;
            task.updated_at = now;
            self.persist(&task);
        }
        let eligible = self.failed_dependency_of(task_id).is_none()
            && self.dependencies_completed(task_id);
        if eligible && let Some(mut task) = self.tasks.get_mut(task_id) {
            task.eligible_at = Some(now);
        }
        info!(%task_id, "task resubmitted");
        Ok(())
    }

    /// Note why a pending task was not placed this cycle.
    pub fn record_error(&self, task_id: &str, kind: ErrorKind, message: &str, now: u64) {
        let Some(mut task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if task.status != TaskStatus::Pending {
            return;
        }
        let unchanged = task
            .last_error
            .as_ref()
            .is_some_and(|e| e.kind == kind && e.message == message);
        if unchanged {
            return;
        }
        task.last_error = Some(TaskError {
            kind,
            message: message.to_string(),
            at: now,
        });
        task.updated_at = now;
        self.persist(&task);
        debug!(%task_id, %kind, "task left pending");
    }

    /// Reinstate a task loaded from the state store.
    pub fn restore(&self, record: TaskRecord) {
        self.seq
            .fetch_max(record.enqueue_seq.saturating_add(1), Ordering::SeqCst);
        self.tasks.insert(record.id.clone(), record);
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|t| t.status)
    }

    /// Full record, including last error and attempt history.
    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.get(task_id).map(|t| t.value().clone())
    }

    pub fn pending_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Pending tasks whose dependencies are satisfied: the placement backlog.
    pub fn eligible_count(&self) -> usize {
        let statuses = self.statuses();
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && deps_completed(t, &statuses))
            .count()
    }

    /// Ids of in-flight tasks on `agent_id`.
    pub fn tasks_on_agent(&self, agent_id: &str) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_in_flight() && t.assigned_agent.as_deref() == Some(agent_id))
            .map(|t| t.key().clone())
            .collect()
    }

    /// All in-flight tasks.
    pub fn in_flight(&self) -> Vec<TaskRecord> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_in_flight())
            .map(|t| t.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    // ── Internals ──────────────────────────────────────────────────

    fn entry_mut(
        &self,
        task_id: &str,
    ) -> QueueResult<dashmap::mapref::one::RefMut<'_, TaskId, TaskRecord>> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::UnknownTask(task_id.to_string()))
    }

    fn statuses(&self) -> HashMap<TaskId, TaskStatus> {
        self.tasks
            .iter()
            .map(|t| (t.key().clone(), t.status))
            .collect()
    }

    fn dependencies_of(&self, task_id: &str) -> Vec<TaskId> {
        self.tasks
            .get(task_id)
            .map(|t| t.dependencies.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn dependencies_completed(&self, task_id: &str) -> bool {
        self.dependencies_of(task_id)
            .iter()
            .all(|d| self.status(d) == Some(TaskStatus::Completed))
    }

    fn failed_dependency_of(&self, task_id: &str) -> Option<TaskId> {
        self.dependencies_of(task_id).into_iter().find(|d| {
            matches!(
                self.status(d),
                Some(TaskStatus::Failed | TaskStatus::Cancelled)
            )
        })
    }

    fn dependents_of(&self, task_id: &str) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| !t.status.is_terminal() && t.dependencies.contains(task_id))
            .map(|t| t.key().clone())
            .collect()
    }

    /// Apply the dependency policy to everything downstream of `root`.
    fn cascade(&self, root: &str, now: u64) -> Vec<TaskId> {
        if self.policy == DependencyFailurePolicy::Wait {
            let waiting = self.dependents_of(root);
            if !waiting.is_empty() {
                info!(task_id = %root, dependents = waiting.len(), "dependents waiting on resubmission");
            }
            return Vec::new();
        }

        let mut cancelled = Vec::new();
        let mut stack = vec![root.to_string()];
        while let Some(failed) = stack.pop() {
            for dependent in self.dependents_of(&failed) {
                if self.cancel_for_dependency(&dependent, &failed, now) {
                    stack.push(dependent.clone());
                    cancelled.push(dependent);
                }
            }
        }
        cancelled
    }

    fn cancel_for_dependency(&self, task_id: &str, failed_dep: &str, now: u64) -> bool {
        let Some(mut task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        if task.status != TaskStatus::Pending {
            return false;
        }
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(now);
        task.updated_at = now;
        task.last_error = Some(TaskError {
            kind: ErrorKind::TaskDependencyFailed,
            message: format!("dependency {failed_dep} did not complete"),
            at: now,
        });
        self.persist(&task);
        warn!(%task_id, dependency = %failed_dep, "task cancelled, dependency failed");
        true
    }

    /// Stamp `eligible_at` on dependents whose last dependency just completed.
    fn refresh_dependents(&self, completed: &str, now: u64) {
        for dependent in self.dependents_of(completed) {
            if !self.dependencies_completed(&dependent) {
                continue;
            }
            if let Some(mut task) = self.tasks.get_mut(&dependent)
                && task.status == TaskStatus::Pending
            {
                task.eligible_at = Some(now);
                debug!(task_id = %dependent, "task eligible");
            }
        }
    }

    fn persist(&self, task: &TaskRecord) {
        if let Some(store) = &self.store
            && let Err(e) = store.put_task(task)
        {
            warn!(task_id = %task.id, error = %e, "failed to persist task");
        }
    }
}

fn deps_completed(task: &TaskRecord, statuses: &HashMap<TaskId, TaskStatus>) -> bool {
    task.dependencies
        .iter()
        .all(|d| statuses.get(d) == Some(&TaskStatus::Completed))
}

fn close_attempt(task: &mut TaskRecord, now: u64, error: Option<ErrorKind>) {
    if let Some(attempt) = task.history.last_mut()
        && attempt.ended_at.is_none()
    {
        attempt.ended_at = Some(now);
        attempt.error = error;
    }
}

fn transition(task_id: &str, from: TaskStatus, to: TaskStatus) -> QueueError {
    QueueError::InvalidTransition {
        task_id: task_id.to_string(),
        from,
        to,
    }
}
