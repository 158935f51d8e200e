//! taskgrid-metrics: observability for a TaskGrid pool.
//!
//! Records assignment latency and lifecycle counters, keeps a bounded
//! history of pool samples for the scaling controller, persists samples to
//! the state store, and broadcasts every observation as a timestamped
//! [`Emission`].
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── record_assignment() ← called per placement
//!   ├── record_sample()     → history + StateStore + Emission::Utilization
//!   ├── peek()              → PoolMetrics (p50/p99, counters)
//!   ├── snapshot()          → same, then resets latencies
//!   ├── subscribe()         → broadcast::Receiver<Emission>
//!   └── run()               → periodic sampling loop
//!
//! Prometheus exposition
//!   └── render_prometheus() → text for a scrape endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{Emission, MetricsCollector, PoolMetrics, SampleSource};
pub use prometheus::render_prometheus;
