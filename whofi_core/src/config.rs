//! Engine configuration.
//!
//! Every section has defaults, so a partial JSON document such as
//! `{ "epoch": { "window_s": 0.5 } }` is a valid configuration.

use crate::confidence::ConfidenceConfig;
use crate::epoch::EpochConfig;
use crate::estimator::EstimatorConfig;
use crate::filter::FilterConfig;
use crate::ingest::IngestConfig;
use crate::solver::SolverConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Pending entries the latest-wins feed holds
    pub capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ingest: IngestConfig,
    pub estimator: EstimatorConfig,
    pub epoch: EpochConfig,
    pub solver: SolverConfig,
    pub filter: FilterConfig,
    pub confidence: ConfidenceConfig,
    pub output: OutputConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Rejects values that would stall or destabilise the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("epoch.window_s", self.epoch.window_s),
            ("filter.expected_interval_s", self.filter.expected_interval_s),
            ("filter.staleness_timeout_s", self.filter.staleness_timeout_s),
            ("filter.gating_sigma", self.filter.gating_sigma),
            ("filter.process_noise", self.filter.process_noise),
            ("ingest.online_window_s", self.ingest.online_window_s),
            ("ingest.pair_retention_s", self.ingest.pair_retention_s),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive, got {value}")));
            }
        }
        if self.ingest.pair_retention_s < self.ingest.stale_tolerance_s {
            return Err(ConfigError::Invalid(
                "ingest.pair_retention_s must cover ingest.stale_tolerance_s".to_string(),
            ));
        }
        if self.ingest.rssi_min_dbm >= self.ingest.rssi_max_dbm {
            return Err(ConfigError::Invalid("ingest RSSI bounds are empty".to_string()));
        }
        if self.output.capacity == 0 {
            return Err(ConfigError::Invalid("output.capacity must be at least 1".to_string()));
        }
        if self.epoch.max_samples_per_node == 0 {
            return Err(ConfigError::Invalid(
                "epoch.max_samples_per_node must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.ingest.stale_tolerance_s, 2.0);
        assert_eq!(config.epoch.window_s, 0.3);
        assert_eq!(config.filter.staleness_timeout_s, 10.0);
        assert_eq!(config.confidence.residual_weight, 0.4);
        assert_eq!(config.output.capacity, 256);
        assert!(matches!(config.estimator, EstimatorConfig::PathLoss(_)));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json() {
        let config = EngineConfig::from_json_str(
            r#"{ "epoch": { "window_s": 0.5 }, "filter": { "gating_sigma": 4.0 } }"#,
        )
        .unwrap();
        assert_eq!(config.epoch.window_s, 0.5);
        assert_eq!(config.epoch.max_samples_per_node, 10);
        assert_eq!(config.filter.gating_sigma, 4.0);
        assert_eq!(config.filter.coast_multiplier, 3.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            EngineConfig::from_json_str(r#"{ "epoch": { "window_s": 0.0 } }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str(r#"{ "output": { "capacity": 0 } }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str(r#"{ "ingest": { "pair_retention_s": 1.0 } }"#),
            Err(ConfigError::Invalid(_))
        ));
    }
}
