//! Distance Estimator
//!
//! Converts a signal measurement into a range from its node plus a range
//! variance. One estimator is chosen per deployment from [`EstimatorConfig`].
//!
//! # Models
//!
//! - **Path loss**: log-distance model `d = 10^((P_ref - rssi) / (10 n))`
//! - **Fingerprint**: k-nearest calibrated feature lookup
//! - **Regressor**: linear model over signal features, optionally predicting
//!   `log10(d)`

use crate::calibration::{Node, NodeTable};
use crate::types::{Measurement, RangeEstimate, Signal};
use serde::{Deserialize, Serialize};
use std::f64::consts::LN_10;
use std::sync::Arc;
use thiserror::Error;
use whofi_env::NodeId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimateError {
    #[error("model needs an RSSI reading")]
    MissingRssi,

    #[error("model needs a signal feature vector")]
    MissingFeatures,

    #[error("feature dimension mismatch: expected {expected}, got {got}")]
    FeatureDimension { expected: usize, got: usize },

    #[error("no calibrated reference matches node {0}")]
    NoReference(NodeId),

    #[error("model produced a non-finite range")]
    NonFinite,

    #[error("invalid estimator configuration: {0}")]
    InvalidConfig(String),
}

/// Pluggable range model.
pub trait DistanceEstimator: Send + Sync {
    /// Short model name for logs.
    fn name(&self) -> &'static str;

    /// Estimates the range between `node` and the measured entity.
    fn estimate(
        &self,
        measurement: &Measurement,
        node: &Node,
        table: &NodeTable,
    ) -> Result<RangeEstimate, EstimateError>;
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Estimator selection, tagged by `kind` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimatorConfig {
    PathLoss(PathLossConfig),
    Fingerprint(FingerprintConfig),
    Regressor(RegressorConfig),
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig::PathLoss(PathLossConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathLossConfig {
    /// Ranges are clamped into `[min_distance_m, max_distance_m]`
    pub min_distance_m: f64,
    pub max_distance_m: f64,

    /// Smallest margin above the noise floor used for the variance (dB)
    pub min_margin_db: f64,
}

impl Default for PathLossConfig {
    fn default() -> Self {
        Self {
            min_distance_m: 0.1,
            max_distance_m: 100.0,
            min_margin_db: 1.0,
        }
    }
}

/// One calibrated fingerprint sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintPoint {
    /// Restricts the sample to one node; `None` applies to every node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub features: Vec<f64>,
    pub distance_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintConfig {
    #[serde(default = "default_k")]
    pub k: usize,

    /// Variance floor (m²)
    #[serde(default = "default_min_variance")]
    pub min_variance: f64,

    pub reference: Vec<FingerprintPoint>,
}

fn default_k() -> usize {
    3
}

fn default_min_variance() -> f64 {
    0.25
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressorConfig {
    pub weights: Vec<f64>,
    #[serde(default)]
    pub bias: f64,

    /// Model output is `log10(distance)` rather than meters
    #[serde(default)]
    pub log_space: bool,

    /// Residual standard deviation in model output units
    #[serde(default = "default_residual_sigma")]
    pub residual_sigma: f64,

    #[serde(default = "default_min_distance")]
    pub min_distance_m: f64,
}

fn default_residual_sigma() -> f64 {
    1.0
}

fn default_min_distance() -> f64 {
    0.1
}

/// Builds the configured estimator.
pub fn build_estimator(
    config: &EstimatorConfig,
) -> Result<Arc<dyn DistanceEstimator>, EstimateError> {
    Ok(match config {
        EstimatorConfig::PathLoss(c) => Arc::new(PathLossEstimator::new(c.clone())?),
        EstimatorConfig::Fingerprint(c) => Arc::new(FingerprintEstimator::new(c.clone())?),
        EstimatorConfig::Regressor(c) => Arc::new(LinearRegressorEstimator::new(c.clone())?),
    })
}

/// Features used by the lookup models: channel features when present,
/// otherwise the RSSI as a one-element vector.
fn signal_features(signal: &Signal) -> Result<Vec<f64>, EstimateError> {
    match (&signal.csi, signal.rssi_dbm) {
        (Some(csi), _) => Ok(csi.clone()),
        (None, Some(rssi)) => Ok(vec![rssi]),
        (None, None) => Err(EstimateError::MissingFeatures),
    }
}

fn range(measurement: &Measurement, distance_m: f64, variance: f64) -> Result<RangeEstimate, EstimateError> {
    if !distance_m.is_finite() || !variance.is_finite() {
        return Err(EstimateError::NonFinite);
    }
    Ok(RangeEstimate {
        node_id: measurement.node_id.clone(),
        entity_id: measurement.entity_id.clone(),
        distance_m,
        variance,
        timestamp: measurement.timestamp,
    })
}

// ============================================================================
// LOG-DISTANCE PATH LOSS
// ============================================================================

/// Log-distance path-loss model with shadowing-derived variance.
///
/// Shadowing of σ dB maps to a range standard deviation of
/// `d · ln(10) / (10 n) · σ`. That variance is then scaled by
/// `margin_ref / margin`, where margin is the distance above the noise floor,
/// so weak signals are trusted less.
#[derive(Debug, Clone)]
pub struct PathLossEstimator {
    config: PathLossConfig,
}

impl PathLossEstimator {
    pub fn new(config: PathLossConfig) -> Result<Self, EstimateError> {
        if config.min_distance_m <= 0.0 || config.max_distance_m <= config.min_distance_m {
            return Err(EstimateError::InvalidConfig(format!(
                "distance bounds [{}, {}] are invalid",
                config.min_distance_m, config.max_distance_m
            )));
        }
        if config.min_margin_db <= 0.0 {
            return Err(EstimateError::InvalidConfig(
                "min_margin_db must be positive".to_string(),
            ));
        }
        Ok(Self { config })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: PathLossConfig::default(),
        }
    }

    /// Range for a given RSSI, reference signal and exponent.
    pub fn distance(&self, rssi_dbm: f64, reference_rssi_dbm: f64, exponent: f64) -> f64 {
        let d = 10f64.powf((reference_rssi_dbm - rssi_dbm) / (10.0 * exponent));
        d.clamp(self.config.min_distance_m, self.config.max_distance_m)
    }
}

impl DistanceEstimator for PathLossEstimator {
    fn name(&self) -> &'static str {
        "path_loss"
    }

    fn estimate(
        &self,
        measurement: &Measurement,
        node: &Node,
        table: &NodeTable,
    ) -> Result<RangeEstimate, EstimateError> {
        let rssi = measurement.signal.rssi_dbm.ok_or(EstimateError::MissingRssi)?;
        let params = table.params();
        let p_ref = table.reference_rssi(node);
        let n = table.path_loss_exponent(node);

        let distance = self.distance(rssi, p_ref, n);

        let sigma_d = distance * LN_10 / (10.0 * n) * params.shadowing_sigma_db;
        let reference_margin = (p_ref - params.noise_floor_dbm).max(self.config.min_margin_db);
        let margin = (rssi - params.noise_floor_dbm).max(self.config.min_margin_db);
        let variance = sigma_d * sigma_d * (reference_margin / margin);

        range(measurement, distance, variance)
    }
}

// ============================================================================
// FINGERPRINT LOOKUP
// ============================================================================

/// k-nearest-neighbour lookup over calibrated feature vectors.
#[derive(Debug, Clone)]
pub struct FingerprintEstimator {
    config: FingerprintConfig,
}

impl FingerprintEstimator {
    pub fn new(config: FingerprintConfig) -> Result<Self, EstimateError> {
        if config.k == 0 {
            return Err(EstimateError::InvalidConfig("k must be at least 1".to_string()));
        }
        if config.reference.is_empty() {
            return Err(EstimateError::InvalidConfig(
                "fingerprint reference set is empty".to_string(),
            ));
        }
        if config
            .reference
            .iter()
            .any(|p| p.features.is_empty() || p.distance_m <= 0.0 || !p.distance_m.is_finite())
        {
            return Err(EstimateError::InvalidConfig(
                "fingerprint points need features and a positive distance".to_string(),
            ));
        }
        Ok(Self { config })
    }
}

impl DistanceEstimator for FingerprintEstimator {
    fn name(&self) -> &'static str {
        "fingerprint"
    }

    fn estimate(
        &self,
        measurement: &Measurement,
        node: &Node,
        _table: &NodeTable,
    ) -> Result<RangeEstimate, EstimateError> {
        let features = signal_features(&measurement.signal)?;

        let mut candidates: Vec<(f64, f64)> = self
            .config
            .reference
            .iter()
            .filter(|p| p.node_id.as_ref().map_or(true, |id| *id == node.id))
            .filter(|p| p.features.len() == features.len())
            .map(|p| {
                let dist2: f64 = p
                    .features
                    .iter()
                    .zip(&features)
                    .map(|(a, b)| (a - b).powi(2))
                    .sum();
                (dist2.sqrt(), p.distance_m)
            })
            .collect();

        if candidates.is_empty() {
            return Err(EstimateError::NoReference(node.id.clone()));
        }

        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        candidates.truncate(self.config.k);

        // Inverse feature-distance weights; an exact match dominates
        let weights: Vec<f64> = candidates.iter().map(|(fd, _)| 1.0 / (fd + 1e-6)).collect();
        let total: f64 = weights.iter().sum();
        let mean = candidates
            .iter()
            .zip(&weights)
            .map(|((_, d), w)| d * w)
            .sum::<f64>()
            / total;
        let spread = candidates
            .iter()
            .zip(&weights)
            .map(|((_, d), w)| w * (d - mean).powi(2))
            .sum::<f64>()
            / total;

        range(measurement, mean, spread.max(self.config.min_variance))
    }
}

// ============================================================================
// LINEAR REGRESSOR
// ============================================================================

/// Linear model `y = bias + w · features`.
#[derive(Debug, Clone)]
pub struct LinearRegressorEstimator {
    config: RegressorConfig,
}

impl LinearRegressorEstimator {
    pub fn new(config: RegressorConfig) -> Result<Self, EstimateError> {
        if config.weights.is_empty() {
            return Err(EstimateError::InvalidConfig(
                "regressor needs at least one weight".to_string(),
            ));
        }
        if config.residual_sigma <= 0.0 || config.min_distance_m <= 0.0 {
            return Err(EstimateError::InvalidConfig(
                "residual_sigma and min_distance_m must be positive".to_string(),
            ));
        }
        Ok(Self { config })
    }
}

impl DistanceEstimator for LinearRegressorEstimator {
    fn name(&self) -> &'static str {
        "regressor"
    }

    fn estimate(
        &self,
        measurement: &Measurement,
        _node: &Node,
        _table: &NodeTable,
    ) -> Result<RangeEstimate, EstimateError> {
        let features = signal_features(&measurement.signal)?;
        if features.len() != self.config.weights.len() {
            return Err(EstimateError::FeatureDimension {
                expected: self.config.weights.len(),
                got: features.len(),
            });
        }

        let y = self.config.bias
            + self
                .config
                .weights
                .iter()
                .zip(&features)
                .map(|(w, x)| w * x)
                .sum::<f64>();

        let sigma = self.config.residual_sigma;
        let (distance, variance) = if self.config.log_space {
            let d = 10f64.powf(y).max(self.config.min_distance_m);
            (d, (d * LN_10 * sigma).powi(2))
        } else {
            (y.max(self.config.min_distance_m), sigma * sigma)
        };

        range(measurement, distance, variance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationParams;
    use approx::assert_relative_eq;
    use whofi_env::EntityId;

    fn table() -> NodeTable {
        NodeTable::new(
            vec![
                Node::new("a", 0.0, 0.0),
                Node::new("b", 10.0, 0.0),
                Node::new("c", 5.0, 8.66),
            ],
            CalibrationParams::default(),
        )
        .unwrap()
    }

    fn measurement(node: &str, signal: Signal) -> Measurement {
        Measurement {
            node_id: NodeId::from(node),
            entity_id: EntityId::from("phone"),
            signal,
            timestamp: 1.0,
            sequence_no: 1,
        }
    }

    #[test]
    fn test_path_loss_inverts_model() {
        let table = table();
        let node = table.get(&NodeId::from("a")).unwrap();
        let est = PathLossEstimator::with_defaults();

        // -30 - 20 log10(5.83) = -45.31 dBm
        let rssi = -30.0 - 20.0 * 5.83f64.log10();
        let r = est
            .estimate(&measurement("a", Signal::rssi(rssi)), node, &table)
            .unwrap();
        assert_relative_eq!(r.distance_m, 5.83, epsilon = 1e-9);
        assert!(r.variance > 0.0);
    }

    #[test]
    fn test_path_loss_variance_grows_with_weak_signal() {
        let table = table();
        let node = table.get(&NodeId::from("a")).unwrap();
        let est = PathLossEstimator::with_defaults();

        let near = est.estimate(&measurement("a", Signal::rssi(-50.0)), node, &table).unwrap();
        let far = est.estimate(&measurement("a", Signal::rssi(-85.0)), node, &table).unwrap();
        assert!(far.distance_m > near.distance_m);
        assert!(far.variance / far.distance_m.powi(2) > near.variance / near.distance_m.powi(2));
    }

    #[test]
    fn test_path_loss_requires_rssi() {
        let table = table();
        let node = table.get(&NodeId::from("a")).unwrap();
        let err = PathLossEstimator::with_defaults()
            .estimate(&measurement("a", Signal::csi(vec![1.0])), node, &table)
            .unwrap_err();
        assert_eq!(err, EstimateError::MissingRssi);
    }

    #[test]
    fn test_path_loss_uses_node_override() {
        let mut nodes = vec![
            Node::new("a", 0.0, 0.0),
            Node::new("b", 10.0, 0.0),
            Node::new("c", 5.0, 8.66),
        ];
        nodes[0].overrides.path_loss_exponent = Some(3.0);
        let table = NodeTable::new(nodes, CalibrationParams::default()).unwrap();
        let node = table.get(&NodeId::from("a")).unwrap();

        let r = PathLossEstimator::with_defaults()
            .estimate(&measurement("a", Signal::rssi(-60.0)), node, &table)
            .unwrap();
        assert_relative_eq!(r.distance_m, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fingerprint_nearest_reference() {
        let config = FingerprintConfig {
            k: 1,
            min_variance: 0.25,
            reference: vec![
                FingerprintPoint { node_id: None, features: vec![10.0, 10.0], distance_m: 1.0 },
                FingerprintPoint { node_id: None, features: vec![5.0, 4.0], distance_m: 4.0 },
                FingerprintPoint {
                    node_id: Some(NodeId::from("b")),
                    features: vec![5.0, 4.1],
                    distance_m: 9.0,
                },
            ],
        };
        let est = FingerprintEstimator::new(config).unwrap();
        let table = table();
        let node = table.get(&NodeId::from("a")).unwrap();

        let r = est
            .estimate(&measurement("a", Signal::csi(vec![5.1, 4.1])), node, &table)
            .unwrap();
        assert_relative_eq!(r.distance_m, 4.0);
        assert_relative_eq!(r.variance, 0.25);

        let err = est
            .estimate(&measurement("a", Signal::csi(vec![1.0])), node, &table)
            .unwrap_err();
        assert_eq!(err, EstimateError::NoReference(NodeId::from("a")));
    }

    #[test]
    fn test_regressor_log_space() {
        let config = RegressorConfig {
            weights: vec![-0.05],
            bias: -1.5,
            log_space: true,
            residual_sigma: 0.1,
            min_distance_m: 0.1,
        };
        let est = LinearRegressorEstimator::new(config).unwrap();
        let table = table();
        let node = table.get(&NodeId::from("a")).unwrap();

        // log10(d) = -1.5 + 0.05 * 50 = 1.0
        let r = est
            .estimate(&measurement("a", Signal::rssi(-50.0)), node, &table)
            .unwrap();
        assert_relative_eq!(r.distance_m, 10.0, epsilon = 1e-9);

        let err = est
            .estimate(&measurement("a", Signal::csi(vec![1.0, 2.0])), node, &table)
            .unwrap_err();
        assert_eq!(err, EstimateError::FeatureDimension { expected: 1, got: 2 });
    }

    #[test]
    fn test_build_from_json_config() {
        let config: EstimatorConfig = serde_json::from_str(r#"{ "kind": "path_loss" }"#).unwrap();
        assert_eq!(build_estimator(&config).unwrap().name(), "path_loss");

        let config: EstimatorConfig =
            serde_json::from_str(r#"{ "kind": "fingerprint", "reference": [] }"#).unwrap();
        assert!(build_estimator(&config).is_err());
    }
}
