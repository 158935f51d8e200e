//! taskgrid-ledger: the resource ledger.
//!
//! The ledger is the single source of truth for capacity. Nothing is placed
//! on an agent without a reservation from here, and a reservation is
//! released exactly once.
//!
//! # Concurrency
//!
//! ```text
//! ResourceLedger
//!   ├── by_task: DashMap<TaskId, AgentId>    (one reservation per task)
//!   ├── agents:  DashMap<AgentId, Account>   (per-agent capacity + holdings)
//!   └── totals:  atomics per dimension       (system-wide limit, CAS)
//! ```
//!
//! Locks are always taken in the order `by_task` → `agents`, and only for
//! the duration of one reserve or release. Unrelated agents never contend.

pub mod error;
pub mod ledger;

pub use error::{CapacityScope, LedgerError, LedgerResult};
pub use ledger::{AgentUsage, LedgerSnapshot, ResourceLedger};
