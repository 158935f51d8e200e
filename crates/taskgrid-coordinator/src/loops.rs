//! Background control loops for a running pool.
//!
//! Four loops share one shutdown signal: assignment, health sweep,
//! scaling evaluation and metrics sampling. Each stops at its next
//! wakeup once the signal flips.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use taskgrid_health::{BoxFuture, SweepCallback, run_sweep_loop};
use taskgrid_metrics::SampleSource;
use taskgrid_state::{AgentId, epoch_ms};

use crate::pool::Pool;

/// Spawn every control loop for `pool` and wait for them to stop.
pub async fn run_loops(pool: Arc<Pool>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let config = pool.config();
    let cycle = config.cycle_interval()?;
    let sweep = config.sweep_interval()?;
    let evaluation = config.evaluation_interval()?;
    let emit = config.emit_interval()?;

    let assignment = tokio::spawn(run_assignment_loop(pool.clone(), cycle, shutdown.clone()));

    let sweep_pool = pool.clone();
    let on_unhealthy: SweepCallback = Arc::new(move |agents: Vec<AgentId>, now: u64| -> BoxFuture {
        let pool = sweep_pool.clone();
        Box::pin(async move {
            pool.recover_agents(&agents, now);
        })
    });
    let health = tokio::spawn(run_sweep_loop(
        pool.health().clone(),
        sweep,
        on_unhealthy,
        shutdown.clone(),
    ));

    let scaling = tokio::spawn(run_scaling_loop(pool.clone(), evaluation, shutdown.clone()));

    let sample_pool = pool.clone();
    let source: SampleSource = Arc::new(move |now: u64| sample_pool.metrics_sample(now));
    let collector = pool.metrics().clone();
    let metrics = tokio::spawn(async move { collector.run(emit, source, shutdown).await });

    let (a, h, s, m) = tokio::join!(assignment, health, scaling, metrics);
    for (name, result) in [("assignment", a), ("health", h), ("scaling", s), ("metrics", m)] {
        if let Err(e) = result {
            warn!(loop_name = name, error = %e, "control loop panicked");
        }
    }
    info!("control loops stopped");
    Ok(())
}

/// Run an assignment cycle every `every`.
pub async fn run_assignment_loop(pool: Arc<Pool>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(interval_ms = every.as_millis() as u64, "assignment loop starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                pool.assign_next_batch(epoch_ms());
            }
            _ = shutdown.changed() => {
                info!("assignment loop shutting down");
                break;
            }
        }
    }
}

/// Evaluate scaling and reap drained agents every `every`.
pub async fn run_scaling_loop(pool: Arc<Pool>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(interval_ms = every.as_millis() as u64, "scaling loop starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = epoch_ms();
                pool.evaluate_scaling(now);
                let reaped = pool.reap_drained(now);
                if !reaped.is_empty() {
                    info!(agents = ?reaped, "drained agents terminated");
                }
            }
            _ = shutdown.changed() => {
                info!("scaling loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use taskgrid_core::{GridConfig, Resources};
    use taskgrid_state::{TaskSpec, TaskStatus};

    use super::*;

    #[tokio::test]
    async fn loops_assign_and_stop_on_shutdown() {
        let mut config = GridConfig::default();
        config.coordinator.cycle_interval = "10ms".into();
        config.health.sweep_interval = "10ms".into();
        config.scaling.evaluation_interval = "10ms".into();
        config.metrics.emit_interval = "10ms".into();
        config.scaling.sustain_window = "500ms".into();
        let pool = Arc::new(Pool::in_memory(config).unwrap());

        let now = epoch_ms();
        pool.register("a", Resources::cpu(4), BTreeSet::new(), now).unwrap();
        pool.heartbeat("a", now).unwrap();
        let id = pool.submit(TaskSpec::new(1, Resources::cpu(1)), now).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_loops(pool.clone(), rx));

        let mut assigned = false;
        for _ in 0..100 {
            if pool.status(&id) == Some(TaskStatus::Assigned) {
                assigned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(assigned);
        for _ in 0..100 {
            if pool.metrics().latest_sample().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(pool.metrics().latest_sample().is_some());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
