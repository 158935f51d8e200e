//! taskgrid-queue: the task queue.
//!
//! Holds admitted tasks until they are placed, tracks their lifecycle
//! (`pending → assigned → running → completed|failed|cancelled`), and
//! resolves dependencies between them.
//!
//! Candidates are returned in a deterministic order: priority ascending,
//! then enqueue sequence ascending. A task whose dependencies are not all
//! `completed` is never a candidate.

pub mod error;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use queue::{CancelOutcome, FailOutcome, TaskQueue};
