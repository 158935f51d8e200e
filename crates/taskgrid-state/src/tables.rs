//! redb table definitions for the TaskGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Agent records keyed by `{agent_id}`.
pub const AGENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agents");

/// Task records keyed by `{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Active reservations keyed by `{task_id}` (a task holds at most one).
pub const RESERVATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("reservations");

/// Scaling decisions keyed by zero-padded `{at}`.
pub const DECISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("decisions");

/// Metrics samples keyed by zero-padded `{at}`.
pub const METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("metrics");
