//! Domain types for the TaskGrid state store.
//!
//! These types represent the persisted state of agents, tasks,
//! reservations, scaling decisions, and metrics samples. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use taskgrid_core::Resources;

/// Unique identifier for a registered agent.
pub type AgentId = String;

/// Unique identifier for a submitted task.
pub type TaskId = String;

/// Unique identifier for a resource reservation.
pub type ReservationId = String;

/// Current Unix time in milliseconds. All persisted timestamps use this.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Agent ──────────────────────────────────────────────────────────

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    /// Accepts no new work; removed once its reservations reach zero.
    Draining,
    Unhealthy,
    Terminated,
}

impl AgentStatus {
    /// Whether new work may be placed on an agent in this status.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Draining => "draining",
            AgentStatus::Unhealthy => "unhealthy",
            AgentStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub id: AgentId,
    pub status: AgentStatus,
    /// Capability tags matched against task requirements.
    pub tags: BTreeSet<String>,
    pub capacity: Resources,
    /// Monotonic registration order, used by round-robin placement.
    pub registration_seq: u64,
    /// Unix timestamp (ms) of the last heartbeat.
    pub last_heartbeat: u64,
    /// Unix timestamp (ms) when the agent registered.
    pub registered_at: u64,
    /// Unix timestamp (ms) of the last status change.
    pub updated_at: u64,
}

// ── Task ───────────────────────────────────────────────────────────

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Holding (or about to hold) a reservation.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Error taxonomy surfaced on tasks and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Recoverable: retried next cycle.
    InsufficientCapacity,
    /// Recoverable via reassignment.
    AgentUnhealthy,
    /// A dependency failed; cascades to dependents.
    TaskDependencyFailed,
    /// Terminal: the retry budget is exhausted.
    RetryLimitExceeded,
    /// Fatal at startup.
    ConfigurationInvalid,
    /// Reported by the worker runtime through `notify_failed`.
    WorkerFailed,
    /// Cancelled by the submitter.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InsufficientCapacity => "insufficient_capacity",
            ErrorKind::AgentUnhealthy => "agent_unhealthy",
            ErrorKind::TaskDependencyFailed => "task_dependency_failed",
            ErrorKind::RetryLimitExceeded => "retry_limit_exceeded",
            ErrorKind::ConfigurationInvalid => "configuration_invalid",
            ErrorKind::WorkerFailed => "worker_failed",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The last error recorded against a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    /// Unix timestamp (ms).
    pub at: u64,
}

/// One placement attempt, kept for retry history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attempt {
    pub agent_id: AgentId,
    pub assigned_at: u64,
    pub ended_at: Option<u64>,
    /// `None` while in flight or when it completed successfully.
    pub error: Option<ErrorKind>,
}

/// What a submitter provides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskSpec {
    /// Caller-chosen id; generated when absent.
    pub id: Option<TaskId>,
    /// Lower is more urgent.
    pub priority: u32,
    pub demand: Resources,
    pub dependencies: BTreeSet<TaskId>,
    /// Affinity key: tasks of the same family prefer the same agent.
    pub family: Option<String>,
    /// Tags an agent must carry to run this task.
    pub required_tags: BTreeSet<String>,
}

impl TaskSpec {
    pub fn new(priority: u32, demand: Resources) -> Self {
        Self {
            priority,
            demand,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.insert(tag.into());
        self
    }
}

/// Persisted state of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub priority: u32,
    pub demand: Resources,
    pub dependencies: BTreeSet<TaskId>,
    pub family: Option<String>,
    pub required_tags: BTreeSet<String>,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
    /// Monotonic enqueue order; ties on priority break on this.
    pub enqueue_seq: u64,
    pub retry_count: u32,
    pub last_error: Option<TaskError>,
    pub history: Vec<Attempt>,
    /// Opaque reference handed back by the worker runtime on completion.
    pub result_ref: Option<String>,
    pub submitted_at: u64,
    /// When the task last became eligible for placement.
    pub eligible_at: Option<u64>,
    pub assigned_at: Option<u64>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub updated_at: u64,
}

impl TaskRecord {
    pub fn from_spec(id: TaskId, spec: TaskSpec, enqueue_seq: u64, now: u64) -> Self {
        Self {
            id,
            priority: spec.priority,
            demand: spec.demand,
            dependencies: spec.dependencies,
            family: spec.family,
            required_tags: spec.required_tags,
            status: TaskStatus::Pending,
            assigned_agent: None,
            enqueue_seq,
            retry_count: 0,
            last_error: None,
            history: Vec::new(),
            result_ref: None,
            submitted_at: now,
            eligible_at: None,
            assigned_at: None,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Ordering key for placement: priority, then enqueue order.
    pub fn order_key(&self) -> (u32, u64) {
        (self.priority, self.enqueue_seq)
    }
}

// ── Reservation ────────────────────────────────────────────────────

/// A held claim on an agent's capacity for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub id: ReservationId,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub amounts: Resources,
    pub created_at: u64,
}

// ── Scaling ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirection {
    Up,
    Down,
    None,
}

impl fmt::Display for ScalingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalingDirection::Up => "up",
            ScalingDirection::Down => "down",
            ScalingDirection::None => "none",
        };
        f.write_str(s)
    }
}

/// Metric values that justified a scaling decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScalingTrigger {
    /// Mean aggregate utilization over the sustain window.
    pub utilization: f64,
    /// Minimum and maximum utilization seen in the window.
    pub utilization_min: f64,
    pub utilization_max: f64,
    /// Latest pending-eligible queue depth.
    pub queue_depth: u64,
    pub agents: u32,
    pub schedulable_agents: u32,
    pub samples: usize,
    pub reason: String,
}

/// A scaling decision with its justification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingDecision {
    /// Unix timestamp (ms).
    pub at: u64,
    pub direction: ScalingDirection,
    /// Agents to add or remove. Zero for `None`.
    pub magnitude: u32,
    pub trigger: ScalingTrigger,
    /// Unix timestamp (ms) until which no further decision is made.
    /// Zero for `None`.
    pub cooldown_until: u64,
    /// Agents chosen for draining on a scale-down.
    pub drain: Vec<AgentId>,
}

impl ScalingDecision {
    pub fn none(at: u64, trigger: ScalingTrigger) -> Self {
        Self {
            at,
            direction: ScalingDirection::None,
            magnitude: 0,
            trigger,
            cooldown_until: 0,
            drain: Vec::new(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.direction == ScalingDirection::None
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// Point-in-time pool metrics, the input to scaling evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSample {
    /// Unix timestamp (ms).
    pub at: u64,
    /// Bottleneck utilization across resource dimensions, in `[0, 1]`.
    pub utilization: f64,
    /// Pending tasks whose dependencies are satisfied.
    pub queue_depth: u64,
    pub agents: u32,
    /// Agents that may receive new work (idle or busy).
    pub schedulable_agents: u32,
}

// ── Table keys ─────────────────────────────────────────────────────

impl ScalingDecision {
    /// Zero-padded so lexical order is chronological.
    pub fn table_key(&self) -> String {
        format!("{:020}", self.at)
    }
}

impl MetricsSample {
    pub fn table_key(&self) -> String {
        format!("{:020}", self.at)
    }
}
