//! taskgrid-state: embedded state store for TaskGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for the agent registry, task queue, reservation table, scaling
//! decisions, and metrics samples. Everything a restart must not lose lives
//! here.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Time-ordered tables (decisions, metrics) use zero-padded timestamp keys
//! so a reverse scan yields the newest record first.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across the control loops.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
