//! Per-agent heartbeat tracking.

use std::fmt;

use tracing::debug;

/// Liveness of one agent as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Restored after a restart, no heartbeat seen yet.
    Unconfirmed,
    Healthy,
    Unhealthy,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Liveness::Unconfirmed => "unconfirmed",
            Liveness::Healthy => "healthy",
            Liveness::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Liveness before and after a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beat {
    pub previous: Liveness,
    pub current: Liveness,
}

impl Beat {
    /// The heartbeat brought an unhealthy agent back.
    pub fn revived(&self) -> bool {
        self.previous == Liveness::Unhealthy && self.current == Liveness::Healthy
    }
}

/// Tracks heartbeats for a single agent.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    liveness: Liveness,
    /// Unix ms of the newest heartbeat seen.
    last_heartbeat: u64,
    /// While unconfirmed: the time by which a heartbeat must arrive.
    deadline: Option<u64>,
    interval_ms: u64,
    missed_threshold: u32,
}

impl HeartbeatTracker {
    /// A healthy tracker whose last heartbeat is `now`.
    pub fn new(now: u64, interval_ms: u64, missed_threshold: u32) -> Self {
        Self {
            liveness: Liveness::Healthy,
            last_heartbeat: now,
            deadline: None,
            interval_ms,
            missed_threshold,
        }
    }

    /// A tracker for an agent restored from the state store: it has until
    /// `now + interval` to heartbeat.
    pub fn unconfirmed(last_heartbeat: u64, now: u64, interval_ms: u64, missed_threshold: u32) -> Self {
        Self {
            liveness: Liveness::Unconfirmed,
            last_heartbeat,
            deadline: Some(now.saturating_add(interval_ms)),
            interval_ms,
            missed_threshold,
        }
    }

    /// Record a heartbeat sent at `ts`. Heartbeats older than the newest one
    /// already seen are ignored.
    pub fn record(&mut self, ts: u64) -> Beat {
        let previous = self.liveness;
        if ts < self.last_heartbeat {
            debug!(ts, last = self.last_heartbeat, "stale heartbeat ignored");
            return Beat {
                previous,
                current: previous,
            };
        }
        self.last_heartbeat = ts;
        self.deadline = None;
        self.liveness = Liveness::Healthy;
        if previous == Liveness::Unhealthy {
            debug!("agent heartbeat resumed");
        }
        Beat {
            previous,
            current: self.liveness,
        }
    }

    /// Re-evaluate liveness at `now`.
    pub fn check(&mut self, now: u64) -> Liveness {
        let failed = match self.liveness {
            Liveness::Healthy => now.saturating_sub(self.last_heartbeat) > self.silence_limit(),
            Liveness::Unconfirmed => self.deadline.is_some_and(|d| now > d),
            Liveness::Unhealthy => false,
        };
        if failed {
            debug!(
                missed = self.missed_beats(now),
                threshold = self.missed_threshold,
                previous = %self.liveness,
                "heartbeat deadline passed"
            );
            self.liveness = Liveness::Unhealthy;
            self.deadline = None;
        }
        self.liveness
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat
    }

    /// Whole heartbeat intervals elapsed since the last heartbeat.
    pub fn missed_beats(&self, now: u64) -> u64 {
        if self.interval_ms == 0 {
            return 0;
        }
        now.saturating_sub(self.last_heartbeat) / self.interval_ms
    }

    fn silence_limit(&self) -> u64 {
        self.interval_ms
            .saturating_mul(u64::from(self.missed_threshold))
    }
}
