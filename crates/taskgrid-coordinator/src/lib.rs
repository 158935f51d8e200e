//! taskgrid-coordinator: the running pool.
//!
//! [`Pool`] is the facade external callers use: agent registration and
//! heartbeats, task submission and cancellation, worker notifications,
//! and the queries behind the metrics surface. Internally it wires the
//! ledger, queue, health monitor, scaling controller and metrics collector
//! around the [`Coordinator`], which runs the assignment cycle.
//!
//! ```text
//!   register/heartbeat ─► AgentRegistry ◄─┐
//!   submit/cancel ──────► TaskQueue ◄─────┤
//!                              │          │
//!                              ▼          │
//!                         Coordinator ────┼─► ResourceLedger
//!                              │          │
//!                              ▼          │
//!                       WorkerRuntime     │
//!   notify_* ─────────────────────────────┘
//! ```
//!
//! [`run_loops`] drives the assignment, health, scaling and metrics loops
//! until shutdown. Tests call the same entry points directly with explicit
//! timestamps instead.

pub mod coordinator;
pub mod error;
pub mod loops;
pub mod pool;
pub mod registry;
pub mod runtime;

pub use coordinator::{Assignment, Coordinator};
pub use error::{CoordinatorError, CoordinatorResult};
pub use loops::{run_assignment_loop, run_loops, run_scaling_loop};
pub use pool::{Pool, PoolBuilder, RecoveryReport, RestoreSummary};
pub use registry::AgentRegistry;
pub use runtime::{NoopRuntime, WorkerRuntime};
