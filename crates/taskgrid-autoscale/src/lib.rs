//! taskgrid-autoscale: the scaling controller.
//!
//! Reads a window of `MetricsSample`s and decides whether the agent pool
//! should grow or shrink. Decisions carry the metric values that justified
//! them and open a cooldown during which no further decision is made.
//!
//! # Scaling Algorithm
//!
//! ```text
//! window   = samples in the last `sustain_window`
//! pressure = utilization >= upper  or  backlog / schedulable >= backlog_per_agent
//! slack    = utilization <= lower  and backlog == 0
//!
//! agents   = registered agents not draining
//!
//! every sample under pressure, registered < max:
//!     up by max(1, ceil(agents * util / upper) - agents,
//!                  ceil(backlog / backlog_per_agent) - agents)
//!
//! every sample slack, agents > min:
//!     down by max(1, agents - max(ceil(agents * util / upper), min))
//! ```
//!
//! State machine: `stable → scaling_up → stable`,
//! `stable → scaling_down → stable`; the cooldown after a decision keeps
//! the controller out of `stable` until it expires.
//!
//! Agents are never removed directly. A scale-down picks agents to drain;
//! they stop receiving work and are terminated once their reservations
//! reach zero.

pub mod provisioner;
pub mod scaler;

pub use provisioner::{NoopProvisioner, Provisioner};
pub use scaler::{DrainCandidate, PoolSize, ScalingController, ScalingPhase, ScalingPolicy};
