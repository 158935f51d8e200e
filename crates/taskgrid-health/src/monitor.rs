//! Health monitor: liveness for every registered agent.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use taskgrid_core::{ConfigResult, GridConfig};
use taskgrid_state::{AgentId, epoch_ms};

use crate::checker::{Beat, HeartbeatTracker, Liveness};

/// Callback invoked with the agents a sweep newly marked unhealthy.
pub type SweepCallback = Arc<dyn Fn(Vec<AgentId>, u64) -> BoxFuture + Send + Sync>;

pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Point-in-time health of one agent, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHealth {
    pub agent_id: AgentId,
    pub liveness: Liveness,
    pub last_heartbeat: u64,
    pub missed_beats: u64,
}

/// Tracks heartbeats for all agents.
pub struct HealthMonitor {
    trackers: DashMap<AgentId, HeartbeatTracker>,
    interval_ms: u64,
    missed_threshold: u32,
}

impl HealthMonitor {
    pub fn new(heartbeat_interval: Duration, missed_threshold: u32) -> Self {
        Self {
            trackers: DashMap::new(),
            interval_ms: heartbeat_interval.as_millis() as u64,
            missed_threshold,
        }
    }

    pub fn from_config(config: &GridConfig) -> ConfigResult<Self> {
        Ok(Self::new(
            config.heartbeat_interval()?,
            config.health.missed_threshold,
        ))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Start tracking a newly registered agent; registration counts as its
    /// first heartbeat.
    pub fn track(&self, agent_id: &str, now: u64) {
        self.trackers.insert(
            agent_id.to_string(),
            HeartbeatTracker::new(now, self.interval_ms, self.missed_threshold),
        );
        debug!(%agent_id, "health tracking started");
    }

    /// Track an agent restored after a restart. It stays unconfirmed until
    /// it heartbeats, and fails if that has not happened by `now + interval`.
    pub fn restore(&self, agent_id: &str, last_heartbeat: u64, now: u64) {
        self.trackers.insert(
            agent_id.to_string(),
            HeartbeatTracker::unconfirmed(
                last_heartbeat,
                now,
                self.interval_ms,
                self.missed_threshold,
            ),
        );
        debug!(%agent_id, last_heartbeat, "health tracking restored, awaiting heartbeat");
    }

    pub fn untrack(&self, agent_id: &str) -> bool {
        self.trackers.remove(agent_id).is_some()
    }

    /// Record a heartbeat. `None` for an agent that is not tracked.
    pub fn record_heartbeat(&self, agent_id: &str, ts: u64) -> Option<Beat> {
        let beat = self.trackers.get_mut(agent_id)?.record(ts);
        if beat.revived() {
            info!(%agent_id, "agent healthy again");
        } else if beat.previous == Liveness::Unconfirmed && beat.current == Liveness::Healthy {
            info!(%agent_id, "agent confirmed after restart");
        }
        Some(beat)
    }

    /// Re-evaluate every agent at `now`, returning those that just became
    /// unhealthy, sorted by id.
    pub fn sweep(&self, now: u64) -> Vec<AgentId> {
        let mut failed: Vec<AgentId> = self
            .trackers
            .iter_mut()
            .filter_map(|mut entry| {
                let before = entry.liveness();
                let after = entry.check(now);
                (before != Liveness::Unhealthy && after == Liveness::Unhealthy)
                    .then(|| entry.key().clone())
            })
            .collect();
        failed.sort();

        for agent_id in &failed {
            warn!(
                %agent_id,
                missed = self.missed_beats(agent_id, now).unwrap_or(0),
                threshold = self.missed_threshold,
                "agent marked unhealthy"
            );
        }
        failed
    }

    pub fn liveness(&self, agent_id: &str) -> Option<Liveness> {
        self.trackers.get(agent_id).map(|t| t.liveness())
    }

    pub fn missed_beats(&self, agent_id: &str, now: u64) -> Option<u64> {
        self.trackers.get(agent_id).map(|t| t.missed_beats(now))
    }

    /// Health of every tracked agent, sorted by id.
    pub fn report(&self, now: u64) -> Vec<AgentHealth> {
        let mut out: Vec<AgentHealth> = self
            .trackers
            .iter()
            .map(|t| AgentHealth {
                agent_id: t.key().clone(),
                liveness: t.liveness(),
                last_heartbeat: t.last_heartbeat(),
                missed_beats: t.missed_beats(now),
            })
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    pub fn tracked(&self) -> usize {
        self.trackers.len()
    }
}

/// Sweep every `every` until `shutdown` fires, handing newly unhealthy
/// agents to `callback`.
pub async fn run_sweep_loop(
    monitor: Arc<HealthMonitor>,
    every: Duration,
    callback: SweepCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    debug!(interval_ms = every.as_millis() as u64, "health sweep loop starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = epoch_ms();
                let failed = monitor.sweep(now);
                if !failed.is_empty() {
                    callback(failed, now).await;
                }
            }
            _ = shutdown.changed() => {
                debug!("health sweep loop shutting down");
                break;
            }
        }
    }
}
