//! Metrics collector: latency, counters and pool samples.
//!
//! Counters are atomics; the latency window and sample history sit behind
//! short-lived mutexes that are never held across an await.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use taskgrid_state::{AgentId, MetricsSample, ScalingDecision, StateStore, TaskId, epoch_ms};

/// Buffered emissions per subscriber before the slowest one lags.
const EMISSION_BUFFER: usize = 256;

/// Most recent assignment latencies kept for percentiles.
const LATENCY_WINDOW: usize = 4096;

/// One timestamped observation, broadcast to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Emission {
    Utilization {
        sample: MetricsSample,
    },
    Assignment {
        at: u64,
        task_id: TaskId,
        agent_id: AgentId,
        strategy: &'static str,
        latency_ms: u64,
    },
    Scaling {
        decision: ScalingDecision,
    },
    HealthSweep {
        at: u64,
        unhealthy: Vec<AgentId>,
        requeued: usize,
    },
}

impl Emission {
    pub fn at(&self) -> u64 {
        match self {
            Emission::Utilization { sample } => sample.at,
            Emission::Assignment { at, .. } | Emission::HealthSweep { at, .. } => *at,
            Emission::Scaling { decision } => decision.at,
        }
    }
}

/// Point-in-time view of the pool, as rendered for scraping.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub at: u64,
    pub utilization: f64,
    pub queue_depth: u64,
    pub agents: u32,
    pub schedulable_agents: u32,
    pub assignments_total: u64,
    pub completions_total: u64,
    pub failures_total: u64,
    pub requeues_total: u64,
    pub unhealthy_total: u64,
    pub scaling_decisions_total: u64,
    /// Assignment latency over the current window.
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_samples: usize,
}

/// Produces the current pool sample on each tick of [`MetricsCollector::run`].
pub type SampleSource = Arc<dyn Fn(u64) -> MetricsSample + Send + Sync>;

#[derive(Default)]
struct Counters {
    assignments: AtomicU64,
    completions: AtomicU64,
    failures: AtomicU64,
    requeues: AtomicU64,
    unhealthy: AtomicU64,
    scaling_decisions: AtomicU64,
}

pub struct MetricsCollector {
    counters: Counters,
    /// Assignment latencies (ms) since the last snapshot, newest last.
    latencies: Mutex<VecDeque<u64>>,
    history: Mutex<VecDeque<MetricsSample>>,
    history_len: usize,
    events: broadcast::Sender<Emission>,
    state: Option<StateStore>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MetricsCollector {
    /// A collector keeping the last `history_len` samples in memory.
    pub fn new(history_len: usize) -> Self {
        let (events, _) = broadcast::channel(EMISSION_BUFFER);
        Self {
            counters: Counters::default(),
            latencies: Mutex::new(VecDeque::new()),
            history: Mutex::new(VecDeque::with_capacity(history_len)),
            history_len: history_len.max(1),
            events,
            state: None,
        }
    }

    /// Like [`new`](Self::new), persisting every sample.
    pub fn with_store(state: StateStore, history_len: usize) -> Self {
        Self {
            state: Some(state),
            ..Self::new(history_len)
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Emission> {
        self.events.subscribe()
    }

    fn emit(&self, emission: Emission) {
        // No subscribers is fine.
        let _ = self.events.send(emission);
    }

    pub fn record_assignment(
        &self,
        task_id: &str,
        agent_id: &str,
        strategy: &'static str,
        latency_ms: u64,
        now: u64,
    ) {
        self.counters.assignments.fetch_add(1, Ordering::Relaxed);
        {
            let mut latencies = lock(&self.latencies);
            if latencies.len() == LATENCY_WINDOW {
                latencies.pop_front();
            }
            latencies.push_back(latency_ms);
        }
        self.emit(Emission::Assignment {
            at: now,
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            strategy,
            latency_ms,
        });
    }

    pub fn record_completion(&self) {
        self.counters.completions.fetch_add(1, Ordering::Relaxed);
    }

    /// A task reached terminal `failed`.
    pub fn record_failure(&self) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.counters.requeues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision(&self, decision: &ScalingDecision) {
        if decision.is_none() {
            return;
        }
        self.counters
            .scaling_decisions
            .fetch_add(1, Ordering::Relaxed);
        self.emit(Emission::Scaling {
            decision: decision.clone(),
        });
    }

    pub fn record_sweep(&self, unhealthy: &[AgentId], requeued: usize, now: u64) {
        self.counters
            .unhealthy
            .fetch_add(unhealthy.len() as u64, Ordering::Relaxed);
        self.emit(Emission::HealthSweep {
            at: now,
            unhealthy: unhealthy.to_vec(),
            requeued,
        });
    }

    /// Append a pool sample to the history, persist it and emit it.
    pub fn record_sample(&self, sample: MetricsSample) {
        {
            let mut history = lock(&self.history);
            if history.len() == self.history_len {
                history.pop_front();
            }
            history.push_back(sample.clone());
        }
        if let Some(state) = &self.state
            && let Err(e) = state.put_metrics(&sample)
        {
            warn!(error = %e, "failed to persist metrics sample");
        }
        self.emit(Emission::Utilization { sample });
    }

    /// Reload history persisted before a restart. `samples` may be in any
    /// order.
    pub fn restore_history(&self, mut samples: Vec<MetricsSample>) {
        samples.sort_by_key(|s| s.at);
        let skip = samples.len().saturating_sub(self.history_len);
        let mut history = lock(&self.history);
        history.clear();
        history.extend(samples.into_iter().skip(skip));
    }

    /// Samples taken at or after `since`, oldest first.
    pub fn window(&self, since: u64) -> Vec<MetricsSample> {
        lock(&self.history)
            .iter()
            .filter(|s| s.at >= since)
            .cloned()
            .collect()
    }

    pub fn latest_sample(&self) -> Option<MetricsSample> {
        lock(&self.history).back().cloned()
    }

    /// Counters, the latest sample and latency percentiles over the
    /// current window. Nothing is reset.
    pub fn peek(&self, now: u64) -> PoolMetrics {
        let latencies: Vec<u64> = lock(&self.latencies).iter().copied().collect();
        self.metrics(now, &latencies)
    }

    /// Like [`peek`](Self::peek), then starts a new latency window.
    pub fn snapshot(&self, now: u64) -> PoolMetrics {
        let latencies: Vec<u64> = std::mem::take(&mut *lock(&self.latencies)).into();
        self.metrics(now, &latencies)
    }

    fn metrics(&self, now: u64, latencies: &[u64]) -> PoolMetrics {
        let (p50, p99) = compute_percentiles(latencies);
        let latest = self.latest_sample().unwrap_or_default();
        let c = &self.counters;
        PoolMetrics {
            at: now,
            utilization: latest.utilization,
            queue_depth: latest.queue_depth,
            agents: latest.agents,
            schedulable_agents: latest.schedulable_agents,
            assignments_total: c.assignments.load(Ordering::Relaxed),
            completions_total: c.completions.load(Ordering::Relaxed),
            failures_total: c.failures.load(Ordering::Relaxed),
            requeues_total: c.requeues.load(Ordering::Relaxed),
            unhealthy_total: c.unhealthy.load(Ordering::Relaxed),
            scaling_decisions_total: c.scaling_decisions.load(Ordering::Relaxed),
            latency_p50_ms: p50,
            latency_p99_ms: p99,
            latency_samples: latencies.len(),
        }
    }

    /// Sample the pool every `every` until shutdown, pruning persisted
    /// samples that fell out of the in-memory history.
    pub async fn run(
        &self,
        every: Duration,
        source: SampleSource,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_ms = every.as_millis() as u64,
            "metrics collector started"
        );
        let retention = (every.as_millis() as u64).saturating_mul(self.history_len as u64);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(every) => {
                    let now = epoch_ms();
                    self.record_sample(source(now));
                    let m = self.peek(now);
                    debug!(
                        utilization = m.utilization,
                        queue_depth = m.queue_depth,
                        p99_ms = m.latency_p99_ms,
                        "metrics emitted"
                    );
                    if let Some(state) = &self.state
                        && let Err(e) = state.prune_metrics_before(now.saturating_sub(retention))
                    {
                        warn!(error = %e, "metrics prune failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("metrics collector shutting down");
                    break;
                }
            }
        }
    }
}

/// P50 and P99 of `latencies` (ms). `(0.0, 0.0)` when empty.
fn compute_percentiles(latencies: &[u64]) -> (f64, f64) {
    if latencies.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();

    let p50_idx = (sorted.len() as f64 * 0.50) as usize;
    let p99_idx = (sorted.len() as f64 * 0.99) as usize;

    let p50 = sorted[p50_idx.min(sorted.len() - 1)] as f64;
    let p99 = sorted[p99_idx.min(sorted.len() - 1)] as f64;

    (p50, p99)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgrid_state::{ScalingDirection, ScalingTrigger};

    fn sample(at: u64, utilization: f64) -> MetricsSample {
        MetricsSample {
            at,
            utilization,
            queue_depth: 2,
            agents: 3,
            schedulable_agents: 3,
        }
    }

    #[test]
    fn snapshot_reports_percentiles_and_resets_window() {
        let c = MetricsCollector::new(16);
        for ms in 1..=100 {
            c.record_assignment("t", "a", "round-robin", ms, 0);
        }
        let m = c.snapshot(1);
        assert_eq!(m.assignments_total, 100);
        assert_eq!(m.latency_samples, 100);
        assert!(m.latency_p50_ms >= 49.0 && m.latency_p50_ms <= 51.0);
        assert!(m.latency_p99_ms >= 98.0);

        let again = c.snapshot(2);
        assert_eq!(again.latency_samples, 0);
        assert_eq!(again.assignments_total, 100);
    }

    #[test]
    fn peek_leaves_the_window_alone() {
        let c = MetricsCollector::new(16);
        c.record_assignment("t1", "a", "priority", 10, 0);
        c.record_assignment("t2", "a", "priority", 30, 0);
        assert_eq!(c.peek(1).latency_samples, 2);
        assert_eq!(c.peek(2).latency_samples, 2);
        assert_eq!(c.snapshot(3).latency_samples, 2);
        assert_eq!(c.peek(4).latency_samples, 0);
    }

    #[test]
    fn latency_window_is_bounded() {
        let c = MetricsCollector::new(16);
        for ms in 0..(LATENCY_WINDOW as u64 + 10) {
            c.record_assignment("t", "a", "priority", ms, 0);
        }
        let m = c.peek(1);
        assert_eq!(m.latency_samples, LATENCY_WINDOW);
        assert_eq!(m.assignments_total, LATENCY_WINDOW as u64 + 10);
    }

    #[test]
    fn history_is_bounded_and_windowed() {
        let c = MetricsCollector::new(3);
        for at in 0..5 {
            c.record_sample(sample(at * 10, 0.5));
        }
        let all = c.window(0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].at, 20);
        assert_eq!(c.window(35).len(), 1);
        assert_eq!(c.latest_sample().unwrap().at, 40);
    }

    #[test]
    fn samples_persist_and_restore() {
        let state = StateStore::open_in_memory().unwrap();
        let c = MetricsCollector::with_store(state.clone(), 8);
        c.record_sample(sample(100, 0.4));
        c.record_sample(sample(200, 0.6));
        assert_eq!(state.list_metrics(10).unwrap().len(), 2);

        let fresh = MetricsCollector::new(8);
        fresh.restore_history(state.list_metrics(10).unwrap());
        let w = fresh.window(0);
        assert_eq!(w.iter().map(|s| s.at).collect::<Vec<_>>(), vec![100, 200]);
    }

    #[tokio::test]
    async fn emissions_are_broadcast() {
        let c = MetricsCollector::new(4);
        let mut rx = c.subscribe();

        c.record_assignment("t1", "a1", "priority", 12, 5);
        c.record_sweep(&["a2".to_string()], 1, 6);
        c.record_decision(&ScalingDecision::none(7, ScalingTrigger::default()));
        c.record_decision(&ScalingDecision {
            at: 8,
            direction: ScalingDirection::Up,
            magnitude: 1,
            trigger: ScalingTrigger::default(),
            cooldown_until: 100,
            drain: Vec::new(),
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Emission::Assignment { latency_ms: 12, .. }));
        assert_eq!(rx.recv().await.unwrap().at(), 6);
        // `none` decisions are not emitted.
        assert!(matches!(rx.recv().await.unwrap(), Emission::Scaling { .. }));
        assert_eq!(c.snapshot(9).unhealthy_total, 1);
    }

    #[tokio::test]
    async fn run_samples_until_shutdown() {
        let c = Arc::new(MetricsCollector::new(64));
        let source: SampleSource = Arc::new(|now| sample(now, 0.25));
        let (tx, rx) = watch::channel(false);

        let runner = c.clone();
        let handle = tokio::spawn(async move {
            runner.run(Duration::from_millis(5), source, rx).await;
        });
        c.record_assignment("t", "a", "priority", 42, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(!c.window(0).is_empty());
        // Ticks sample the pool without consuming latencies.
        assert_eq!(c.peek(1).latency_samples, 1);
    }

    #[test]
    fn percentiles_empty() {
        assert_eq!(compute_percentiles(&[]), (0.0, 0.0));
    }

    #[test]
    fn percentiles_single_value() {
        assert_eq!(compute_percentiles(&[5]), (5.0, 5.0));
    }
}
