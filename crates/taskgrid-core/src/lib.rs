pub mod config;
pub mod error;
pub mod types;

pub use config::{
    AdaptiveConfig, CoordinatorConfig, DependencyFailurePolicy, GridConfig, HealthSettings,
    LimitsConfig, MetricsConfig, ScalingSettings, parse_duration,
};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
