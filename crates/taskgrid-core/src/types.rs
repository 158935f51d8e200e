//! Shared types used across TaskGrid crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One dimension of the resource vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Disk,
        ResourceKind::Network,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::Network => "network",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A resource vector: capacity, demand, or usage.
///
/// CPU is expressed in millicores so that fractional cores stay integral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub network_mbps: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu_millis: 0,
        memory_mb: 0,
        disk_mb: 0,
        network_mbps: 0,
    };

    pub fn new(cpu_millis: u64, memory_mb: u64, disk_mb: u64, network_mbps: u64) -> Self {
        Self {
            cpu_millis,
            memory_mb,
            disk_mb,
            network_mbps,
        }
    }

    /// Whole cores only, everything else zero.
    pub fn cpu(cores: u64) -> Self {
        Self {
            cpu_millis: cores * 1000,
            ..Self::ZERO
        }
    }

    pub fn get(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Cpu => self.cpu_millis,
            ResourceKind::Memory => self.memory_mb,
            ResourceKind::Disk => self.disk_mb,
            ResourceKind::Network => self.network_mbps,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, value: u64) {
        match kind {
            ResourceKind::Cpu => self.cpu_millis = value,
            ResourceKind::Memory => self.memory_mb = value,
            ResourceKind::Disk => self.disk_mb = value,
            ResourceKind::Network => self.network_mbps = value,
        }
    }

    pub fn is_zero(&self) -> bool {
        ResourceKind::ALL.iter().all(|k| self.get(*k) == 0)
    }

    /// True when every dimension of `self` is `<=` the same dimension of `other`.
    pub fn fits_within(&self, other: &Resources) -> bool {
        ResourceKind::ALL.iter().all(|k| self.get(*k) <= other.get(*k))
    }

    /// The first dimension where `self` exceeds `other`, if any.
    pub fn first_exceeding(&self, other: &Resources) -> Option<ResourceKind> {
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| self.get(*k) > other.get(*k))
    }

    pub fn checked_add(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu_millis: self.cpu_millis.checked_add(other.cpu_millis)?,
            memory_mb: self.memory_mb.checked_add(other.memory_mb)?,
            disk_mb: self.disk_mb.checked_add(other.disk_mb)?,
            network_mbps: self.network_mbps.checked_add(other.network_mbps)?,
        })
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            disk_mb: self.disk_mb.saturating_add(other.disk_mb),
            network_mbps: self.network_mbps.saturating_add(other.network_mbps),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
            network_mbps: self.network_mbps.saturating_sub(other.network_mbps),
        }
    }

    /// Scale each dimension by `fraction` (rounded down).
    pub fn scaled(&self, fraction: &LimitFractions) -> Resources {
        Resources {
            cpu_millis: (self.cpu_millis as f64 * fraction.cpu).floor() as u64,
            memory_mb: (self.memory_mb as f64 * fraction.memory).floor() as u64,
            disk_mb: (self.disk_mb as f64 * fraction.disk).floor() as u64,
            network_mbps: (self.network_mbps as f64 * fraction.network).floor() as u64,
        }
    }

    /// `used / capacity` for one dimension, clamped to `[0, 1]`.
    ///
    /// Returns `None` when the capacity for that dimension is zero.
    pub fn utilization_of(used: &Resources, capacity: &Resources, kind: ResourceKind) -> Option<f64> {
        let cap = capacity.get(kind);
        if cap == 0 {
            return None;
        }
        Some((used.get(kind) as f64 / cap as f64).clamp(0.0, 1.0))
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m mem={}MB disk={}MB net={}Mbps",
            self.cpu_millis, self.memory_mb, self.disk_mb, self.network_mbps
        )
    }
}

/// Per-dimension fractions in `(0, 1]`, used for system-wide limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitFractions {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network: f64,
}

impl LimitFractions {
    pub fn uniform(value: f64) -> Self {
        Self {
            cpu: value,
            memory: value,
            disk: value,
            network: value,
        }
    }

    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
            ResourceKind::Disk => self.disk,
            ResourceKind::Network => self.network,
        }
    }
}

impl Default for LimitFractions {
    fn default() -> Self {
        Self::uniform(1.0)
    }
}

/// Placement policy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    RoundRobin,
    Priority,
    #[default]
    ResourceAware,
    TaskAffinity,
    Adaptive,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round-robin",
            StrategyKind::Priority => "priority",
            StrategyKind::ResourceAware => "resource-aware",
            StrategyKind::TaskAffinity => "task-affinity",
            StrategyKind::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_checks_every_dimension() {
        let cap = Resources::new(4000, 1024, 100, 10);
        assert!(Resources::new(4000, 1024, 100, 10).fits_within(&cap));
        assert!(!Resources::new(4001, 0, 0, 0).fits_within(&cap));
        assert!(!Resources::new(0, 0, 0, 11).fits_within(&cap));
    }

    #[test]
    fn first_exceeding_reports_dimension() {
        let cap = Resources::cpu(2);
        let demand = Resources::new(1000, 1, 0, 0);
        assert_eq!(demand.first_exceeding(&cap), Some(ResourceKind::Memory));
        assert_eq!(Resources::cpu(2).first_exceeding(&cap), None);
    }

    #[test]
    fn saturating_sub_never_underflows() {
        let a = Resources::cpu(1);
        let b = Resources::cpu(3);
        assert_eq!(a.saturating_sub(&b), Resources::ZERO);
    }

    #[test]
    fn utilization_ignores_zero_capacity() {
        let cap = Resources::cpu(4);
        let used = Resources::cpu(1);
        assert_eq!(
            Resources::utilization_of(&used, &cap, ResourceKind::Cpu),
            Some(0.25)
        );
        assert_eq!(
            Resources::utilization_of(&used, &cap, ResourceKind::Memory),
            None
        );
    }

    #[test]
    fn scaled_applies_fractions() {
        let cap = Resources::new(1000, 1000, 1000, 1000);
        let limit = cap.scaled(&LimitFractions {
            cpu: 0.5,
            memory: 1.0,
            disk: 0.25,
            network: 0.1,
        });
        assert_eq!(limit, Resources::new(500, 1000, 250, 100));
    }

    #[test]
    fn strategy_kind_parses_kebab_case() {
        let kind: StrategyKind = serde_json::from_str("\"task-affinity\"").unwrap();
        assert_eq!(kind, StrategyKind::TaskAffinity);
        assert_eq!(StrategyKind::default(), StrategyKind::ResourceAware);
    }
}
