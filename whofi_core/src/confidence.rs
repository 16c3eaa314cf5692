//! Fusion & Confidence Engine
//! ==========================
//!
//! Scores a fused position in `[0, 1]` from three components:
//! - **Residual**: how well the ranges agree at the solver solution
//! - **Coverage**: contributing nodes over online nodes
//! - **Stability**: how settled the track's filter covariance is
//!
//! The reported position is always the filtered one; consumers see this
//! score rather than the raw residual.

use crate::calibration::Dimensions;
use crate::types::PositionEstimate;
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Weight for the inverse residual component
    pub residual_weight: f64,
    /// Weight for the node coverage component
    pub coverage_weight: f64,
    /// Weight for the filter stability component
    pub stability_weight: f64,
    /// RMS range error (m) at which the residual component halves
    pub residual_scale_m: f64,
    /// Position covariance trace (m²) at which the stability component halves
    pub stability_scale_m2: f64,
    /// Upper bound of the coverage ratio
    pub coverage_cap: f64,
    /// Multiplier applied to low-confidence solves
    pub low_confidence_penalty: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            residual_weight: 0.4,
            coverage_weight: 0.3,
            stability_weight: 0.3,
            residual_scale_m: 1.0,
            stability_scale_m2: 10.0,
            coverage_cap: 1.0,
            low_confidence_penalty: 0.5,
        }
    }
}

/// Inputs to a confidence score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceInputs {
    /// Solver residual (m²)
    pub residual: f64,
    pub contributing_nodes: usize,
    pub online_nodes: usize,
    /// Trace of the filter position covariance over the solved axes (m²)
    pub position_trace: f64,
    pub low_confidence: bool,
}

/// Per-component breakdown, useful for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub residual: f64,
    pub coverage: f64,
    pub stability: f64,
    pub score: f64,
}

// =============================================================================
// SCORING
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    config: ConfidenceConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// Scores a raw estimate against the filter that absorbed it.
    pub fn score(
        &self,
        estimate: &PositionEstimate,
        filter_position_covariance: &Matrix3<f64>,
        dimensions: Dimensions,
        online_nodes: usize,
    ) -> f64 {
        self.breakdown(&ConfidenceInputs {
            residual: estimate.residual,
            contributing_nodes: estimate.contributing_nodes.len(),
            online_nodes,
            position_trace: solved_trace(filter_position_covariance, dimensions),
            low_confidence: estimate.low_confidence,
        })
        .score
    }

    /// Component scores and the clamped weighted sum.
    ///
    /// # Formula
    /// ```text
    /// S = clamp(w_r / (1 + rms / s_r) + w_c · min(n_c / n_o, cap) + w_s / (1 + tr(P) / s_s))
    /// ```
    /// with `rms = sqrt(residual / n_c)`, multiplied by the penalty for
    /// low-confidence solves.
    pub fn breakdown(&self, inputs: &ConfidenceInputs) -> ConfidenceBreakdown {
        let c = &self.config;

        let residual = if inputs.contributing_nodes > 0 && inputs.residual.is_finite() {
            let rms = (inputs.residual.max(0.0) / inputs.contributing_nodes as f64).sqrt();
            1.0 / (1.0 + rms / c.residual_scale_m.max(f64::EPSILON))
        } else {
            0.0
        };

        // Contributing nodes are online by definition
        let online = inputs.online_nodes.max(inputs.contributing_nodes);
        let coverage = if online > 0 {
            (inputs.contributing_nodes as f64 / online as f64).min(c.coverage_cap)
                / c.coverage_cap.max(f64::EPSILON)
        } else {
            0.0
        };

        let stability = if inputs.position_trace.is_finite() {
            1.0 / (1.0 + inputs.position_trace.max(0.0) / c.stability_scale_m2.max(f64::EPSILON))
        } else {
            0.0
        };

        let mut score = c.residual_weight * residual
            + c.coverage_weight * coverage
            + c.stability_weight * stability;
        if inputs.low_confidence {
            score *= c.low_confidence_penalty;
        }
        if !score.is_finite() {
            score = 0.0;
        }

        ConfidenceBreakdown {
            residual,
            coverage,
            stability,
            score: score.clamp(0.0, 1.0),
        }
    }
}

/// Trace of the position covariance over the axes the deployment solves.
pub fn solved_trace(covariance: &Matrix3<f64>, dimensions: Dimensions) -> f64 {
    (0..dimensions.count()).map(|i| covariance[(i, i)]).sum()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inputs(residual: f64, contributing: usize, online: usize, trace: f64) -> ConfidenceInputs {
        ConfidenceInputs {
            residual,
            contributing_nodes: contributing,
            online_nodes: online,
            position_trace: trace,
            low_confidence: false,
        }
    }

    #[test]
    fn test_perfect_solve_scores_high() {
        let scorer = ConfidenceScorer::default();
        let b = scorer.breakdown(&inputs(0.0, 3, 3, 0.0));
        assert!((b.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_components_decrease() {
        let scorer = ConfidenceScorer::default();
        let good = scorer.breakdown(&inputs(0.1, 4, 4, 1.0)).score;
        assert!(scorer.breakdown(&inputs(30.0, 4, 4, 1.0)).score < good);
        assert!(scorer.breakdown(&inputs(0.1, 3, 6, 1.0)).score < good);
        assert!(scorer.breakdown(&inputs(0.1, 4, 4, 50.0)).score < good);
    }

    #[test]
    fn test_low_confidence_penalty() {
        let scorer = ConfidenceScorer::default();
        let mut i = inputs(0.0, 3, 3, 0.0);
        i.low_confidence = true;
        assert!((scorer.breakdown(&i).score - 0.5).abs() < 1e-12);
    }

    fn estimate(residual: f64, nodes: &[&str], low_confidence: bool) -> PositionEstimate {
        PositionEstimate {
            entity_id: whofi_env::EntityId::from("e"),
            position: nalgebra::Vector3::new(1.0, 2.0, 0.0),
            covariance: Matrix3::identity(),
            residual,
            contributing_nodes: nodes.iter().map(|n| whofi_env::NodeId::from(*n)).collect(),
            timestamp: 10.0,
            method: crate::types::SolveMethod::LeastSquares,
            dimensions: Dimensions::Planar,
            low_confidence,
            condition_number: 2.0,
        }
    }

    #[test]
    fn test_score_matches_breakdown_of_estimate() {
        let scorer = ConfidenceScorer::default();
        let cov = Matrix3::from_diagonal(&nalgebra::Vector3::new(0.5, 0.5, 9.0));
        let est = estimate(0.3, &["a", "b", "c"], false);

        let score = scorer.score(&est, &cov, Dimensions::Planar, 4);
        let expected = scorer.breakdown(&ConfidenceInputs {
            residual: 0.3,
            contributing_nodes: 3,
            online_nodes: 4,
            position_trace: 1.0,
            low_confidence: false,
        });
        assert!((score - expected.score).abs() < 1e-12);
        assert!(score > 0.0 && score < 1.0);
    }

    #[test]
    fn test_score_penalises_low_confidence_estimates() {
        let scorer = ConfidenceScorer::default();
        let cov = Matrix3::identity() * 0.1;
        let clean = scorer.score(&estimate(0.0, &["a", "b", "c"], false), &cov, Dimensions::Planar, 3);
        let flagged = scorer.score(&estimate(0.0, &["a", "b", "c"], true), &cov, Dimensions::Planar, 3);
        assert!((flagged - clean * ConfidenceConfig::default().low_confidence_penalty).abs() < 1e-12);
    }

    #[test]
    fn test_solved_trace_ignores_fixed_height() {
        let cov = Matrix3::from_diagonal(&nalgebra::Vector3::new(1.0, 2.0, 100.0));
        assert_eq!(solved_trace(&cov, Dimensions::Planar), 3.0);
        assert_eq!(solved_trace(&cov, Dimensions::Spatial), 103.0);
    }

    proptest! {
        #[test]
        fn prop_confidence_bounded(
            residual in prop_oneof![Just(f64::NAN), Just(f64::INFINITY), -10.0f64..1e6],
            contributing in 0usize..20,
            online in 0usize..20,
            trace in prop_oneof![Just(f64::NAN), -5.0f64..1e6],
            low in any::<bool>(),
            w_r in -1.0f64..2.0,
            w_c in -1.0f64..2.0,
            w_s in -1.0f64..2.0,
        ) {
            let scorer = ConfidenceScorer::new(ConfidenceConfig {
                residual_weight: w_r,
                coverage_weight: w_c,
                stability_weight: w_s,
                ..ConfidenceConfig::default()
            });
            let score = scorer.breakdown(&ConfidenceInputs {
                residual,
                contributing_nodes: contributing,
                online_nodes: online,
                position_trace: trace,
                low_confidence: low,
            }).score;
            prop_assert!((0.0..=1.0).contains(&score));
        }
    }
}
