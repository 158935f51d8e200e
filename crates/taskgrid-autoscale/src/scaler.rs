use std::time::Duration;

use tracing::{debug, info};

use taskgrid_core::{ConfigResult, GridConfig};
use taskgrid_state::{AgentId, MetricsSample, ScalingDecision, ScalingDirection, ScalingTrigger};

/// Thresholds and bounds for one pool, resolved from `[scaling]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub upper_threshold: f64,
    pub lower_threshold: f64,
    pub backlog_per_agent: f64,
    pub sustain_ms: u64,
    pub cooldown_ms: u64,
    pub min_agents: u32,
    pub max_agents: u32,
}

impl ScalingPolicy {
    pub fn from_config(config: &GridConfig) -> ConfigResult<Self> {
        let s = &config.scaling;
        Ok(Self {
            upper_threshold: s.upper_threshold,
            lower_threshold: s.lower_threshold,
            backlog_per_agent: s.backlog_per_agent,
            sustain_ms: millis(config.sustain_window()?),
            cooldown_ms: millis(config.cooldown()?),
            min_agents: s.min_agents,
            max_agents: s.max_agents,
        })
    }

    fn under_pressure(&self, s: &MetricsSample) -> bool {
        s.utilization >= self.upper_threshold || backlog_ratio(s) >= self.backlog_per_agent
    }

    fn has_slack(&self, s: &MetricsSample) -> bool {
        s.utilization <= self.lower_threshold && s.queue_depth == 0
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Pending eligible tasks per schedulable agent. Backlog with no
/// schedulable agent at all is unbounded pressure.
fn backlog_ratio(s: &MetricsSample) -> f64 {
    if s.queue_depth == 0 {
        0.0
    } else if s.schedulable_agents == 0 {
        f64::INFINITY
    } else {
        s.queue_depth as f64 / f64::from(s.schedulable_agents)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingPhase {
    Stable,
    ScalingUp,
    ScalingDown,
}

/// Agent counts at evaluation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSize {
    /// Registered agents that are not draining. Decisions are sized
    /// against this and never take it below `min_agents`.
    pub active: u32,
    /// Every registered agent, draining included. Bounded by `max_agents`.
    pub live: u32,
}

impl PoolSize {
    pub fn new(active: u32, live: u32) -> Self {
        Self { active, live }
    }

    /// A pool with nothing draining.
    pub fn settled(agents: u32) -> Self {
        Self::new(agents, agents)
    }
}

/// What the controller needs to know about an agent to pick drain targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainCandidate {
    pub agent_id: AgentId,
    pub utilization: f64,
    pub reservations: usize,
    pub draining: bool,
}

/// Scaling state for one pool.
///
/// Owns everything the controller remembers between evaluations, so
/// independent pools never share timers.
pub struct ScalingController {
    policy: ScalingPolicy,
    phase: ScalingPhase,
    cooldown_until: u64,
    last_decision: Option<ScalingDecision>,
    /// Agents reported unhealthy, in report order.
    removal_candidates: Vec<AgentId>,
}

impl ScalingController {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            phase: ScalingPhase::Stable,
            cooldown_until: 0,
            last_decision: None,
            removal_candidates: Vec::new(),
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn phase(&self) -> ScalingPhase {
        self.phase
    }

    pub fn cooldown_until(&self) -> u64 {
        self.cooldown_until
    }

    /// The most recent non-`none` decision.
    pub fn last_decision(&self) -> Option<&ScalingDecision> {
        self.last_decision.as_ref()
    }

    /// Resume from a persisted decision so a restart cannot cut a cooldown
    /// short.
    pub fn restore(&mut self, decision: ScalingDecision, now: u64) {
        if !decision.is_none() && decision.cooldown_until > now {
            self.cooldown_until = decision.cooldown_until;
            self.phase = match decision.direction {
                ScalingDirection::Up => ScalingPhase::ScalingUp,
                ScalingDirection::Down => ScalingPhase::ScalingDown,
                ScalingDirection::None => ScalingPhase::Stable,
            };
        }
        self.last_decision = Some(decision);
    }

    /// Decide whether the pool should change size, given recent samples
    /// and the pool as it stands now.
    ///
    /// A condition counts only once it has held on every sample for the
    /// whole sustain window. Agents already draining are not counted again.
    pub fn evaluate(&mut self, window: &[MetricsSample], size: PoolSize, now: u64) -> ScalingDecision {
        if now < self.cooldown_until {
            let trigger = ScalingTrigger {
                reason: format!("cooldown until {}", self.cooldown_until),
                ..Default::default()
            };
            return ScalingDecision::none(now, trigger);
        }
        if self.phase != ScalingPhase::Stable {
            debug!(phase = ?self.phase, "cooldown expired, scaler stable");
            self.phase = ScalingPhase::Stable;
        }

        let mut samples: Vec<&MetricsSample> = window.iter().filter(|s| s.at <= now).collect();
        samples.sort_by_key(|s| s.at);
        let Some(latest) = samples.last().copied() else {
            return ScalingDecision::none(now, trigger_for(&[], "no samples"));
        };

        let policy = &self.policy;
        if let Some(run) = self.sustained(&samples, |s| policy.under_pressure(s)) {
            return self.scale_up(&run, latest, size, now);
        }
        if let Some(run) = self.sustained(&samples, |s| policy.has_slack(s)) {
            return self.scale_down(&run, size, now);
        }
        ScalingDecision::none(now, trigger_for(&samples, "within thresholds"))
    }

    /// The trailing run of samples satisfying `cond`, if it spans the
    /// sustain window.
    fn sustained<'a>(
        &self,
        samples: &[&'a MetricsSample],
        cond: impl Fn(&MetricsSample) -> bool,
    ) -> Option<Vec<&'a MetricsSample>> {
        let start = samples
            .iter()
            .rposition(|s| !cond(s))
            .map(|i| i + 1)
            .unwrap_or(0);
        let run = &samples[start..];
        let (first, last) = (run.first()?, run.last()?);
        (last.at - first.at >= self.policy.sustain_ms).then(|| run.to_vec())
    }

    fn scale_up(
        &mut self,
        run: &[&MetricsSample],
        latest: &MetricsSample,
        size: PoolSize,
        now: u64,
    ) -> ScalingDecision {
        let agents = size.active;
        let max = self.policy.max_agents;
        if size.live >= max {
            return ScalingDecision::none(now, trigger_for(run, "at max_agents"));
        }
        let trigger = trigger_for(run, "sustained pressure");
        let by_util = ceil_u32(f64::from(agents) * trigger.utilization / self.policy.upper_threshold)
            .saturating_sub(agents);
        let by_backlog = ceil_u32(latest.queue_depth as f64 / self.policy.backlog_per_agent)
            .saturating_sub(agents);
        let magnitude = by_util.max(by_backlog).max(1).min(max - size.live);

        info!(
            agents,
            magnitude,
            utilization = trigger.utilization,
            queue_depth = trigger.queue_depth,
            "scaling up"
        );
        self.decide(ScalingDirection::Up, magnitude, trigger, now)
    }

    fn scale_down(
        &mut self,
        run: &[&MetricsSample],
        size: PoolSize,
        now: u64,
    ) -> ScalingDecision {
        let agents = size.active;
        let min = self.policy.min_agents;
        if agents <= min {
            return ScalingDecision::none(now, trigger_for(run, "at min_agents"));
        }
        let trigger = trigger_for(run, "sustained slack");
        let needed = ceil_u32(f64::from(agents) * trigger.utilization / self.policy.upper_threshold)
            .max(min);
        let magnitude = agents.saturating_sub(needed).max(1).min(agents - min);

        info!(
            agents,
            magnitude,
            utilization = trigger.utilization,
            "scaling down"
        );
        self.decide(ScalingDirection::Down, magnitude, trigger, now)
    }

    fn decide(
        &mut self,
        direction: ScalingDirection,
        magnitude: u32,
        trigger: ScalingTrigger,
        now: u64,
    ) -> ScalingDecision {
        self.cooldown_until = now.saturating_add(self.policy.cooldown_ms);
        self.phase = match direction {
            ScalingDirection::Up => ScalingPhase::ScalingUp,
            ScalingDirection::Down => ScalingPhase::ScalingDown,
            ScalingDirection::None => ScalingPhase::Stable,
        };
        let decision = ScalingDecision {
            at: now,
            direction,
            magnitude,
            trigger,
            cooldown_until: self.cooldown_until,
            drain: Vec::new(),
        };
        self.last_decision = Some(decision.clone());
        decision
    }

    /// Remember an agent the health monitor gave up on; it is drained first
    /// on the next scale-down.
    pub fn report_removal_candidate(&mut self, agent_id: &str) {
        if !self.removal_candidates.iter().any(|a| a == agent_id) {
            debug!(%agent_id, "removal candidate reported");
            self.removal_candidates.push(agent_id.to_string());
        }
    }

    /// Drop a candidate that recovered or left the pool.
    pub fn withdraw_candidate(&mut self, agent_id: &str) {
        self.removal_candidates.retain(|a| a != agent_id);
    }

    pub fn removal_candidates(&self) -> &[AgentId] {
        &self.removal_candidates
    }

    /// Pick up to `count` agents to drain: reported removal candidates
    /// first, then the least loaded. Agents already draining are skipped,
    /// and at least `min_agents` of the rest are left alone.
    ///
    /// The picks are attached to the last decision when it is a scale-down.
    pub fn select_for_drain(&mut self, count: u32, candidates: &[DrainCandidate]) -> Vec<AgentId> {
        let open: Vec<&DrainCandidate> = candidates.iter().filter(|c| !c.draining).collect();
        let spare = open.len().saturating_sub(self.policy.min_agents as usize);
        let count = (count as usize).min(spare);

        let mut picked: Vec<AgentId> = self
            .removal_candidates
            .iter()
            .filter(|id| open.iter().any(|c| &c.agent_id == *id))
            .cloned()
            .collect();

        let mut rest: Vec<&DrainCandidate> = open
            .into_iter()
            .filter(|c| !picked.contains(&c.agent_id))
            .collect();
        rest.sort_by(|a, b| {
            a.reservations
                .cmp(&b.reservations)
                .then(a.utilization.total_cmp(&b.utilization))
                .then(a.agent_id.cmp(&b.agent_id))
        });
        picked.extend(rest.into_iter().map(|c| c.agent_id.clone()));
        picked.truncate(count);

        for id in &picked {
            self.withdraw_candidate(id);
        }
        if let Some(last) = self.last_decision.as_mut()
            && last.direction == ScalingDirection::Down
            && last.drain.is_empty()
        {
            last.drain = picked.clone();
        }
        picked
    }
}

fn ceil_u32(x: f64) -> u32 {
    if x.is_finite() && x > 0.0 {
        x.ceil().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

fn trigger_for(run: &[&MetricsSample], reason: &str) -> ScalingTrigger {
    let Some(latest) = run.last() else {
        return ScalingTrigger {
            reason: reason.to_string(),
            ..Default::default()
        };
    };
    let n = run.len() as f64;
    let mean = run.iter().map(|s| s.utilization).sum::<f64>() / n;
    let min = run.iter().map(|s| s.utilization).fold(f64::INFINITY, f64::min);
    let max = run.iter().map(|s| s.utilization).fold(f64::NEG_INFINITY, f64::max);
    ScalingTrigger {
        utilization: mean,
        utilization_min: min,
        utilization_max: max,
        queue_depth: latest.queue_depth,
        agents: latest.agents,
        schedulable_agents: latest.schedulable_agents,
        samples: run.len(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000;

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            upper_threshold: 0.8,
            lower_threshold: 0.3,
            backlog_per_agent: 4.0,
            sustain_ms: 60 * SEC,
            cooldown_ms: 300 * SEC,
            min_agents: 1,
            max_agents: 10,
        }
    }

    /// One sample every 10s from `from` to `to` inclusive.
    fn series(from: u64, to: u64, utilization: f64, queue_depth: u64, agents: u32) -> Vec<MetricsSample> {
        (from..=to)
            .step_by(10 * SEC as usize)
            .map(|at| MetricsSample {
                at,
                utilization,
                queue_depth,
                agents,
                schedulable_agents: agents,
            })
            .collect()
    }

    #[test]
    fn sustained_high_utilization_scales_up() {
        let mut c = ScalingController::new(policy());
        let window = series(0, 60 * SEC, 0.9, 0, 3);
        let d = c.evaluate(&window, PoolSize::settled(3), 60 * SEC);
        assert!(matches!(d.direction, ScalingDirection::Up));
        assert_eq!(d.magnitude, 1);
        assert_eq!(d.cooldown_until, 360 * SEC);
        assert_eq!(d.trigger.samples, 7);
        assert!((d.trigger.utilization - 0.9).abs() < 1e-9);
        assert_eq!(c.phase(), ScalingPhase::ScalingUp);
    }

    #[test]
    fn short_spike_is_not_enough() {
        let mut c = ScalingController::new(policy());
        let mut window = series(0, 20 * SEC, 0.5, 0, 3);
        window.extend(series(30 * SEC, 60 * SEC, 0.95, 0, 3));
        assert!(c.evaluate(&window, PoolSize::settled(3), 60 * SEC).is_none());
        assert_eq!(c.phase(), ScalingPhase::Stable);
    }

    #[test]
    fn backlog_drives_magnitude() {
        let mut c = ScalingController::new(policy());
        // 40 queued over 2 agents: wants 10 agents, capped at max.
        let window = series(0, 60 * SEC, 0.5, 40, 2);
        let d = c.evaluate(&window, PoolSize::settled(2), 60 * SEC);
        assert!(matches!(d.direction, ScalingDirection::Up));
        assert_eq!(d.magnitude, 8);
    }

    #[test]
    fn no_scale_up_at_max_agents() {
        let mut c = ScalingController::new(policy());
        let window = series(0, 60 * SEC, 0.99, 100, 10);
        let d = c.evaluate(&window, PoolSize::settled(10), 60 * SEC);
        assert!(d.is_none());
        assert_eq!(d.trigger.reason, "at max_agents");
    }

    #[test]
    fn idle_pool_scales_down_to_min() {
        let mut c = ScalingController::new(policy());
        let window = series(0, 60 * SEC, 0.1, 0, 5);
        let d = c.evaluate(&window, PoolSize::settled(5), 60 * SEC);
        assert!(matches!(d.direction, ScalingDirection::Down));
        // ceil(5 * 0.1 / 0.8) = 1 agent still needed.
        assert_eq!(d.magnitude, 4);
    }

    #[test]
    fn backlog_blocks_scale_down() {
        let mut c = ScalingController::new(policy());
        let window = series(0, 60 * SEC, 0.1, 1, 5);
        assert!(c.evaluate(&window, PoolSize::settled(5), 60 * SEC).is_none());
    }

    #[test]
    fn cooldown_blocks_both_directions() {
        let mut c = ScalingController::new(policy());
        let up = c.evaluate(&series(0, 60 * SEC, 0.9, 0, 3), PoolSize::settled(3), 60 * SEC);
        assert!(!up.is_none());

        // Still hot, then idle: both blocked until the cooldown ends.
        let hot = series(70 * SEC, 200 * SEC, 0.95, 0, 4);
        assert!(c.evaluate(&hot, PoolSize::settled(4), 200 * SEC).is_none());
        let idle = series(200 * SEC, 350 * SEC, 0.05, 0, 4);
        assert!(c.evaluate(&idle, PoolSize::settled(4), 350 * SEC).is_none());

        let d = c.evaluate(&series(300 * SEC, 360 * SEC, 0.05, 0, 4), PoolSize::settled(4), 360 * SEC);
        assert!(matches!(d.direction, ScalingDirection::Down));
        assert!(d.at >= up.cooldown_until);
    }

    #[test]
    fn phase_returns_to_stable_after_cooldown() {
        let mut c = ScalingController::new(policy());
        c.evaluate(&series(0, 60 * SEC, 0.9, 0, 3), PoolSize::settled(3), 60 * SEC);
        assert_eq!(c.phase(), ScalingPhase::ScalingUp);
        c.evaluate(&series(300 * SEC, 400 * SEC, 0.5, 0, 4), PoolSize::settled(4), 400 * SEC);
        assert_eq!(c.phase(), ScalingPhase::Stable);
    }

    #[test]
    fn restore_resumes_cooldown() {
        let mut first = ScalingController::new(policy());
        let d = first.evaluate(&series(0, 60 * SEC, 0.9, 0, 3), PoolSize::settled(3), 60 * SEC);

        let mut c = ScalingController::new(policy());
        c.restore(d, 100 * SEC);
        assert_eq!(c.phase(), ScalingPhase::ScalingUp);
        assert!(c.evaluate(&series(40 * SEC, 100 * SEC, 0.9, 0, 4), PoolSize::settled(4), 100 * SEC).is_none());
        assert!(c.last_decision().is_some());
    }

    #[test]
    fn drain_prefers_removal_candidates_then_least_loaded() {
        let mut c = ScalingController::new(policy());
        c.report_removal_candidate("sick");
        c.report_removal_candidate("sick");
        assert_eq!(c.removal_candidates().len(), 1);

        let cand = |id: &str, util: f64, res: usize, draining: bool| DrainCandidate {
            agent_id: id.into(),
            utilization: util,
            reservations: res,
            draining,
        };
        let candidates = vec![
            cand("busy", 0.9, 3, false),
            cand("light", 0.1, 1, false),
            cand("empty", 0.0, 0, false),
            cand("sick", 0.5, 2, false),
            cand("leaving", 0.0, 0, true),
        ];
        let picked = c.select_for_drain(3, &candidates);
        assert_eq!(picked, vec!["sick", "empty", "light"]);
        assert!(c.removal_candidates().is_empty());
    }

    #[test]
    fn drain_picks_attach_to_scale_down() {
        let mut c = ScalingController::new(policy());
        let d = c.evaluate(&series(0, 60 * SEC, 0.0, 0, 2), PoolSize::settled(2), 60 * SEC);
        assert_eq!(d.magnitude, 1);
        let candidates = vec![
            DrainCandidate {
                agent_id: "a".into(),
                utilization: 0.0,
                reservations: 0,
                draining: false,
            },
            DrainCandidate {
                agent_id: "b".into(),
                utilization: 0.2,
                reservations: 2,
                draining: false,
            },
        ];
        c.select_for_drain(d.magnitude, &candidates);
        assert_eq!(c.last_decision().unwrap().drain, vec!["a".to_string()]);
    }

    #[test]
    fn draining_agents_do_not_count_toward_the_pool() {
        let mut c = ScalingController::new(ScalingPolicy {
            min_agents: 2,
            ..policy()
        });
        // Samples still report four agents, but two are already draining.
        let idle = series(0, 60 * SEC, 0.01, 0, 4);
        let d = c.evaluate(&idle, PoolSize::new(2, 4), 60 * SEC);
        assert!(d.is_none());
        assert_eq!(d.trigger.reason, "at min_agents");

        let d = c.evaluate(&idle, PoolSize::new(3, 4), 60 * SEC);
        assert_eq!(d.direction, ScalingDirection::Down);
        assert_eq!(d.magnitude, 1);
    }

    #[test]
    fn scale_up_room_counts_draining_agents() {
        let mut c = ScalingController::new(policy());
        // 9 registered, 3 of them draining: only one slot left under max.
        let hot = series(0, 60 * SEC, 0.5, 100, 6);
        let d = c.evaluate(&hot, PoolSize::new(6, 9), 60 * SEC);
        assert_eq!(d.direction, ScalingDirection::Up);
        assert_eq!(d.magnitude, 1);
    }

    #[test]
    fn drain_leaves_min_agents_untouched() {
        let mut c = ScalingController::new(ScalingPolicy {
            min_agents: 2,
            ..policy()
        });
        let cand = |id: &str, draining: bool| DrainCandidate {
            agent_id: id.into(),
            utilization: 0.0,
            reservations: 1,
            draining,
        };
        let candidates = vec![cand("a", true), cand("b", true), cand("c", false), cand("d", false)];
        assert!(c.select_for_drain(2, &candidates).is_empty());

        let candidates = vec![cand("a", true), cand("b", false), cand("c", false), cand("d", false)];
        assert_eq!(c.select_for_drain(2, &candidates), vec!["b".to_string()]);
    }

    #[test]
    fn policy_from_default_config() {
        let p = ScalingPolicy::from_config(&GridConfig::default()).unwrap();
        assert_eq!(p.sustain_ms, 60 * SEC);
        assert_eq!(p.cooldown_ms, 300 * SEC);
    }
}
