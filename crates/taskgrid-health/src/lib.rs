//! taskgrid-health: agent liveness for TaskGrid.
//!
//! Agents send heartbeats; a periodic sweep flags any agent that has been
//! silent for longer than `heartbeat_interval × missed_threshold`. The
//! recovery that follows (releasing reservations, re-enqueueing tasks,
//! notifying the scaler) belongs to the caller, which receives the newly
//! unhealthy agents from [`HealthMonitor::sweep`] or through the
//! [`SweepCallback`] of the background loop.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── trackers: DashMap<AgentId, HeartbeatTracker>
//!   │     └── liveness: unconfirmed | healthy | unhealthy
//!   └── run_sweep_loop() → sweep(now) → SweepCallback
//! ```
//!
//! Agents restored after a restart start `unconfirmed`: they must heartbeat
//! within one interval or the next sweep treats them as failed.

pub mod checker;
pub mod monitor;

pub use checker::{Beat, HeartbeatTracker, Liveness};
pub use monitor::{AgentHealth, BoxFuture, HealthMonitor, SweepCallback, run_sweep_loop};
