//! grid.toml configuration parser.
//!
//! Every section is optional; missing fields fall back to the defaults
//! below. Durations are written as human strings (`"500ms"`, `"5s"`, `"2m"`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{LimitFractions, StrategyKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridConfig {
    pub coordinator: CoordinatorConfig,
    pub scaling: ScalingSettings,
    pub health: HealthSettings,
    pub limits: LimitsConfig,
    pub adaptive: AdaptiveConfig,
    pub metrics: MetricsConfig,
}

/// What happens to dependents when a dependency fails terminally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyFailurePolicy {
    /// Dependents are cancelled (recursively).
    #[default]
    Cancel,
    /// Dependents stay pending until the dependency is resubmitted.
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub strategy: StrategyKind,
    /// Maximum candidates pulled from the queue per cycle.
    pub batch_size: usize,
    /// Minimum interval between assignment cycles.
    pub cycle_interval: String,
    /// Retries allowed before a task fails terminally.
    pub max_retries: u32,
    pub dependency_failure: DependencyFailurePolicy,
    /// Target time from eligible to assigned. Reported, not enforced.
    pub assignment_latency_target: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            batch_size: 64,
            cycle_interval: "100ms".to_string(),
            max_retries: 3,
            dependency_failure: DependencyFailurePolicy::default(),
            assignment_latency_target: "500ms".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingSettings {
    pub upper_threshold: f64,
    pub lower_threshold: f64,
    /// Pending eligible tasks per schedulable agent that counts as backlog pressure.
    pub backlog_per_agent: f64,
    /// How long a condition must hold before a decision is made.
    pub sustain_window: String,
    pub cooldown: String,
    pub min_agents: u32,
    pub max_agents: u32,
    pub evaluation_interval: String,
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            upper_threshold: 0.8,
            lower_threshold: 0.3,
            backlog_per_agent: 4.0,
            sustain_window: "60s".to_string(),
            cooldown: "5m".to_string(),
            min_agents: 1,
            max_agents: 10,
            evaluation_interval: "15s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSettings {
    pub heartbeat_interval: String,
    /// Consecutive missed heartbeats before an agent is unhealthy.
    pub missed_threshold: u32,
    pub sweep_interval: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: "10s".to_string(),
            missed_threshold: 3,
            sweep_interval: "5s".to_string(),
        }
    }
}

/// System-wide resource limits as a fraction of aggregate capacity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub disk_pct: f64,
    pub network_pct: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cpu_pct: 1.0,
            memory_pct: 1.0,
            disk_pct: 1.0,
            network_pct: 1.0,
        }
    }
}

impl LimitsConfig {
    pub fn fractions(&self) -> LimitFractions {
        LimitFractions {
            cpu: self.cpu_pct,
            memory: self.memory_pct,
            disk: self.disk_pct,
            network: self.network_pct,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Samples retained per agent and per strategy.
    pub window_size: usize,
    /// Minimum fraction of selections that explore.
    pub exploration_rate: f64,
    /// Score penalty per second of observed latency.
    pub latency_weight: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window_size: 32,
            exploration_rate: 0.1,
            latency_weight: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub emit_interval: String,
    /// Samples kept in memory for the scaling window.
    pub history: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            emit_interval: "10s".to_string(),
            history: 120,
        }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: GridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn cycle_interval(&self) -> ConfigResult<Duration> {
        duration_field("coordinator.cycle_interval", &self.coordinator.cycle_interval)
    }

    pub fn assignment_latency_target(&self) -> ConfigResult<Duration> {
        duration_field(
            "coordinator.assignment_latency_target",
            &self.coordinator.assignment_latency_target,
        )
    }

    pub fn sustain_window(&self) -> ConfigResult<Duration> {
        duration_field("scaling.sustain_window", &self.scaling.sustain_window)
    }

    pub fn cooldown(&self) -> ConfigResult<Duration> {
        duration_field("scaling.cooldown", &self.scaling.cooldown)
    }

    pub fn evaluation_interval(&self) -> ConfigResult<Duration> {
        duration_field("scaling.evaluation_interval", &self.scaling.evaluation_interval)
    }

    pub fn heartbeat_interval(&self) -> ConfigResult<Duration> {
        duration_field("health.heartbeat_interval", &self.health.heartbeat_interval)
    }

    pub fn sweep_interval(&self) -> ConfigResult<Duration> {
        duration_field("health.sweep_interval", &self.health.sweep_interval)
    }

    pub fn emit_interval(&self) -> ConfigResult<Duration> {
        duration_field("metrics.emit_interval", &self.metrics.emit_interval)
    }

    /// Reject configurations no control loop can run with.
    pub fn validate(&self) -> ConfigResult<()> {
        let s = &self.scaling;
        if s.min_agents > s.max_agents {
            return Err(invalid(format!(
                "min_agents ({}) > max_agents ({})",
                s.min_agents, s.max_agents
            )));
        }
        if s.max_agents == 0 {
            return Err(invalid("max_agents must be at least 1".to_string()));
        }
        for (name, value) in [
            ("scaling.upper_threshold", s.upper_threshold),
            ("scaling.lower_threshold", s.lower_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(format!("{name} must be in (0, 1], got {value}")));
            }
        }
        if s.lower_threshold >= s.upper_threshold {
            return Err(invalid(format!(
                "lower_threshold ({}) must be below upper_threshold ({})",
                s.lower_threshold, s.upper_threshold
            )));
        }
        if s.backlog_per_agent <= 0.0 {
            return Err(invalid("scaling.backlog_per_agent must be positive".to_string()));
        }

        if self.health.missed_threshold == 0 {
            return Err(invalid("health.missed_threshold must be at least 1".to_string()));
        }
        if self.coordinator.batch_size == 0 {
            return Err(invalid("coordinator.batch_size must be at least 1".to_string()));
        }

        let l = &self.limits;
        for (name, value) in [
            ("limits.cpu_pct", l.cpu_pct),
            ("limits.memory_pct", l.memory_pct),
            ("limits.disk_pct", l.disk_pct),
            ("limits.network_pct", l.network_pct),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(format!("{name} must be in (0, 1], got {value}")));
            }
        }

        let a = &self.adaptive;
        if !(0.0..=1.0).contains(&a.exploration_rate) {
            return Err(invalid(format!(
                "adaptive.exploration_rate must be in [0, 1], got {}",
                a.exploration_rate
            )));
        }
        if a.window_size == 0 {
            return Err(invalid("adaptive.window_size must be at least 1".to_string()));
        }
        if self.metrics.history == 0 {
            return Err(invalid("metrics.history must be at least 1".to_string()));
        }

        self.assignment_latency_target()?;
        self.cooldown()?;
        let emit = self.emit_interval()?;
        for (name, interval) in [
            ("coordinator.cycle_interval", self.cycle_interval()?),
            ("scaling.evaluation_interval", self.evaluation_interval()?),
            ("health.heartbeat_interval", self.heartbeat_interval()?),
            ("health.sweep_interval", self.sweep_interval()?),
            ("metrics.emit_interval", self.emit_interval()?),
        ] {
            if interval.is_zero() {
                return Err(invalid(format!("{name} must be non-zero")));
            }
        }

        // Scaling reads only the retained samples; they must be able to
        // span the sustain window or no decision is ever made.
        let sustain = self.sustain_window()?;
        let gaps = u32::try_from(self.metrics.history - 1).unwrap_or(u32::MAX);
        let retained = emit.saturating_mul(gaps);
        if retained < sustain {
            return Err(invalid(format!(
                "metrics.history ({}) samples at metrics.emit_interval ({}) span {:?}, \
                 shorter than scaling.sustain_window ({})",
                self.metrics.history, self.metrics.emit_interval, retained, s.sustain_window
            )));
        }

        Ok(())
    }
}

fn invalid(msg: String) -> ConfigError {
    ConfigError::Invalid(msg)
}

fn duration_field(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "2m", "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = GridConfig::from_toml_str("").unwrap();
        assert_eq!(config, GridConfig::default());
        assert_eq!(config.scaling.upper_threshold, 0.8);
        assert_eq!(config.scaling.lower_threshold, 0.3);
        assert_eq!(config.health.missed_threshold, 3);
        assert_eq!(config.coordinator.strategy, StrategyKind::ResourceAware);
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[coordinator]
strategy = "adaptive"
batch_size = 8
dependency_failure = "wait"

[scaling]
min_agents = 2
max_agents = 4
cooldown = "30s"

[limits]
cpu_pct = 0.9
"#;
        let config = GridConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.coordinator.strategy, StrategyKind::Adaptive);
        assert_eq!(config.coordinator.batch_size, 8);
        assert_eq!(
            config.coordinator.dependency_failure,
            DependencyFailurePolicy::Wait
        );
        assert_eq!(config.scaling.min_agents, 2);
        assert_eq!(config.cooldown().unwrap(), Duration::from_secs(30));
        assert_eq!(config.limits.fractions().cpu, 0.9);
        assert_eq!(config.limits.memory_pct, 1.0);
    }

    #[test]
    fn min_above_max_is_invalid() {
        let toml_str = r#"
[scaling]
min_agents = 5
max_agents = 2
"#;
        let err = GridConfig::from_toml_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("min_agents")));
    }

    #[test]
    fn inverted_thresholds_are_invalid() {
        let mut config = GridConfig::default();
        config.scaling.lower_threshold = 0.9;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_missed_threshold_is_invalid() {
        let mut config = GridConfig::default();
        config.health.missed_threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn limit_outside_unit_interval_is_invalid() {
        let mut config = GridConfig::default();
        config.limits.disk_pct = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_loop_interval_is_invalid() {
        let mut config = GridConfig::default();
        config.coordinator.cycle_interval = "0ms".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("cycle_interval")));
    }

    #[test]
    fn history_must_span_the_sustain_window() {
        let mut config = GridConfig::default();
        config.metrics.history = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("sustain_window")
        ));

        // Seven samples 10s apart span exactly 60s.
        config.metrics.history = 7;
        config.validate().unwrap();

        config.metrics.history = 120;
        config.metrics.emit_interval = "100ms".to_string();
        assert!(config.validate().is_err());
        config.scaling.sustain_window = "5s".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn bad_duration_is_reported_with_field() {
        let mut config = GridConfig::default();
        config.health.heartbeat_interval = "soon".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Duration { field: "health.heartbeat_interval", .. }
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = GridConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("[scaling]"));
        let parsed = GridConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("later"), None);
    }
}
