//! Multilateration Solver
//!
//! Weighted non-linear least squares over `|pos - node_i| = d_i` with weights
//! `1 / variance_i`, minimised by Levenberg-Marquardt from several starting
//! points.
//!
//! # Degraded geometry
//!
//! Two condition numbers guard the solve:
//! - the anchor geometry (SVD of the centred node positions), checked before
//!   solving; collinear or coplanar anchors admit mirror solutions
//! - the weighted normal matrix `JᵀWJ` at the solution
//!
//! When either is too large the result is flagged `low_confidence`. Without a
//! prior position to disambiguate, the solver falls back to an
//! inverse-distance weighted centroid.
//!
//! Anchors mounted at a single height cannot resolve height, so a spatial
//! deployment whose anchors are level is solved in their common plane.

use crate::calibration::{Dimensions, NodeTable};
use crate::epoch::fuse;
use crate::types::{PositionEstimate, RangeEstimate, SolveMethod};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;
use whofi_env::{EntityId, NodeId};

/// Minimum number of distinct nodes for any solve.
pub const MIN_SOLVE_NODES: usize = 3;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error("insufficient nodes: {available} distinct, {required} required")]
    InsufficientNodes { available: usize, required: usize },
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Anchor geometry condition number above which the solve is degraded
    pub geometry_condition_limit: f64,

    /// Normal-matrix condition number above which the solve is degraded
    pub normal_condition_limit: f64,

    /// Levenberg-Marquardt iteration cap per start
    pub max_iterations: usize,

    /// Range variance floor (m²)
    pub min_variance: f64,

    /// Relative cost difference under which two minima count as equivalent
    pub equivalence_tolerance: f64,

    /// Minima closer than this are the same solution (m)
    pub distinct_solution_m: f64,

    /// Upper bound on any reported position variance (m²)
    pub max_position_variance: f64,

    /// Height variance for a planar solve in a spatial deployment (m²)
    pub degraded_z_variance: f64,

    /// Anchors whose heights span less than this are solved in their common plane (m)
    pub coplanar_height_tolerance_m: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            geometry_condition_limit: 50.0,
            normal_condition_limit: 1e8,
            max_iterations: 100,
            min_variance: 1e-4,
            equivalence_tolerance: 1e-3,
            distinct_solution_m: 0.05,
            max_position_variance: 1e4,
            degraded_z_variance: 4.0,
            coplanar_height_tolerance_m: 0.05,
        }
    }
}

// ============================================================================
// PROBLEM
// ============================================================================

#[derive(Debug, Clone)]
struct Anchor {
    node_id: NodeId,
    position: Vector3<f64>,
    distance: f64,
    sigma: f64,
}

/// Least-squares problem in `dims` free coordinates.
///
/// Planar problems hold `z` fixed at `z_fixed`.
struct RangeProblem<'a> {
    anchors: &'a [Anchor],
    dims: usize,
    z_fixed: f64,
}

impl RangeProblem<'_> {
    fn point(&self, x: &DVector<f64>) -> Vector3<f64> {
        if self.dims == 2 {
            Vector3::new(x[0], x[1], self.z_fixed)
        } else {
            Vector3::new(x[0], x[1], x[2])
        }
    }

    fn state(&self, p: &Vector3<f64>) -> DVector<f64> {
        DVector::from_iterator(self.dims, p.iter().copied().take(self.dims))
    }

    /// Weighted residuals `(|p - a_i| - d_i) / σ_i`.
    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let p = self.point(x);
        DVector::from_iterator(
            self.anchors.len(),
            self.anchors
                .iter()
                .map(|a| ((p - a.position).norm() - a.distance) / a.sigma),
        )
    }

    fn cost(&self, x: &DVector<f64>) -> f64 {
        self.residuals(x).norm_squared()
    }

    /// Analytic Jacobian of the weighted residuals.
    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let p = self.point(x);
        let mut jacobian = DMatrix::zeros(self.anchors.len(), self.dims);
        for (i, a) in self.anchors.iter().enumerate() {
            let delta = p - a.position;
            let range = delta.norm();
            if range < 1e-12 {
                continue;
            }
            for j in 0..self.dims {
                jacobian[(i, j)] = delta[j] / range / a.sigma;
            }
        }
        jacobian
    }

    /// Unweighted sum of squared range errors (m²).
    fn range_residual(&self, p: &Vector3<f64>) -> f64 {
        self.anchors
            .iter()
            .map(|a| ((p - a.position).norm() - a.distance).powi(2))
            .sum()
    }
}

// ============================================================================
// SOLVER
// ============================================================================

#[derive(Debug, Clone)]
struct Candidate {
    x: DVector<f64>,
    cost: f64,
}

pub struct MultilaterationSolver {
    config: SolverConfig,
}

impl MultilaterationSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(SolverConfig::default())
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Solves for the entity position.
    ///
    /// Ranges for nodes missing from `table` are ignored. `prior` is the
    /// entity's last known position, used to break mirror ambiguities.
    pub fn solve(
        &self,
        entity_id: &EntityId,
        ranges: &[RangeEstimate],
        table: &NodeTable,
        prior: Option<&Vector3<f64>>,
    ) -> Result<PositionEstimate, SolveError> {
        let anchors = self.merge_ranges(ranges, table);
        if anchors.len() < MIN_SOLVE_NODES {
            return Err(SolveError::InsufficientNodes {
                available: anchors.len(),
                required: MIN_SOLVE_NODES,
            });
        }

        let timestamp = ranges
            .iter()
            .map(|r| r.timestamp)
            .fold(f64::NEG_INFINITY, f64::max);

        // Height is unobservable from anchors mounted at one level
        let (z_min, z_max) = anchors.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), a| {
            (lo.min(a.position.z), hi.max(a.position.z))
        });
        let level = z_max - z_min < self.config.coplanar_height_tolerance_m;

        // A spatial deployment with only three anchors is solved in their plane
        let degraded = table.dimensions() == Dimensions::Spatial
            && !level
            && anchors.len() < Dimensions::Spatial.required_nodes();
        let dims = if table.dimensions() == Dimensions::Planar || level || degraded {
            2
        } else {
            3
        };
        let mean_z = anchors.iter().map(|a| a.position.z).sum::<f64>() / anchors.len() as f64;
        let z_fixed = match (degraded, prior) {
            (true, Some(p)) => p.z,
            _ => mean_z,
        };
        let problem = RangeProblem {
            anchors: &anchors,
            dims,
            z_fixed,
        };

        let (condition_number, weak_direction) = anchor_geometry(&anchors, dims);
        let ill_geometry = condition_number > self.config.geometry_condition_limit;
        let centroid = weighted_centroid(&anchors, dims, z_fixed);

        let ctx = SolveContext {
            entity_id,
            problem: &problem,
            timestamp,
            condition_number,
            degraded,
        };

        if ill_geometry && prior.is_none() {
            debug!(
                entity = %entity_id,
                condition = condition_number,
                "ill-conditioned anchor geometry without prior, using centroid"
            );
            return Ok(self.centroid_estimate(&ctx, &centroid));
        }

        // Starting points: centroid, prior, and either side of the weakest axis
        let mut starts = Vec::new();
        if let Some(p) = prior {
            let mut p = *p;
            if dims == 2 {
                p.z = z_fixed;
            }
            starts.push(problem.state(&p));
        }
        if !ill_geometry {
            let c = problem.state(&centroid);
            let spread = (anchors.iter().map(|a| a.distance.powi(2)).sum::<f64>()
                / anchors.len() as f64)
                .sqrt()
                .max(1.0);
            if let Some(w) = weak_direction {
                starts.push(&c + &w * spread);
                starts.push(&c - &w * spread);
            }
            starts.push(c);
        }

        let mut candidates: Vec<Candidate> = starts
            .into_iter()
            .map(|start| {
                let x = self.levenberg_marquardt(&problem, start);
                let cost = problem.cost(&x);
                Candidate { x, cost }
            })
            .filter(|c| c.cost.is_finite() && c.x.iter().all(|v| v.is_finite()))
            .collect();
        candidates.sort_by(|a, b| a.cost.total_cmp(&b.cost));

        let Some(best) = candidates.first().cloned() else {
            return Ok(self.centroid_estimate(&ctx, &centroid));
        };

        let tolerance = 1e-9 + self.config.equivalence_tolerance * best.cost;
        let mut equivalent: Vec<&Candidate> = vec![&best];
        for c in &candidates[1..] {
            let distinct = equivalent
                .iter()
                .all(|e| (&e.x - &c.x).norm() > self.config.distinct_solution_m);
            if c.cost <= best.cost + tolerance && distinct {
                equivalent.push(c);
            }
        }

        let mut low_confidence = ill_geometry || degraded;
        let chosen = if equivalent.len() > 1 {
            match prior {
                Some(p) => {
                    low_confidence = true;
                    let prior_state = problem.state(p);
                    equivalent
                        .into_iter()
                        .min_by(|a, b| {
                            (&a.x - &prior_state)
                                .norm()
                                .total_cmp(&(&b.x - &prior_state).norm())
                        })
                        .map(|c| c.x.clone())
                        .unwrap_or_else(|| best.x.clone())
                }
                None => {
                    debug!(entity = %entity_id, "mirror ambiguity without prior, using centroid");
                    return Ok(self.centroid_estimate(&ctx, &centroid));
                }
            }
        } else {
            best.x.clone()
        };

        let jacobian = problem.jacobian(&chosen);
        let normal = jacobian.transpose() * &jacobian;
        if normal_condition(&normal) > self.config.normal_condition_limit {
            if prior.is_none() {
                debug!(entity = %entity_id, "singular normal matrix, using centroid");
                return Ok(self.centroid_estimate(&ctx, &centroid));
            }
            low_confidence = true;
        }

        let position = problem.point(&chosen);
        let covariance = self.solution_covariance(&normal, dims, degraded);
        let method = if degraded {
            SolveMethod::PlanarLeastSquares
        } else {
            SolveMethod::LeastSquares
        };

        Ok(PositionEstimate {
            entity_id: entity_id.clone(),
            position,
            covariance,
            residual: problem.range_residual(&position),
            contributing_nodes: contributing(&anchors),
            timestamp,
            method,
            dimensions: solved_dimensions(dims),
            low_confidence,
            condition_number,
        })
    }

    /// One anchor per known node; duplicates merged by inverse variance.
    fn merge_ranges(&self, ranges: &[RangeEstimate], table: &NodeTable) -> Vec<Anchor> {
        let mut by_node: BTreeMap<&NodeId, Vec<&RangeEstimate>> = BTreeMap::new();
        for r in ranges {
            if r.distance_m.is_finite() && r.variance.is_finite() && table.contains(&r.node_id) {
                by_node.entry(&r.node_id).or_default().push(r);
            }
        }

        by_node
            .into_iter()
            .filter_map(|(id, group)| {
                let node = table.get(id)?;
                let fused = fuse(group.into_iter())?;
                Some(Anchor {
                    node_id: id.clone(),
                    position: node.position,
                    distance: fused.distance_m.max(0.0),
                    sigma: fused.variance.max(self.config.min_variance).sqrt(),
                })
            })
            .collect()
    }

    /// Damped Gauss-Newton iteration `(JᵀJ + λ diag(JᵀJ)) Δx = -Jᵀr`.
    fn levenberg_marquardt(&self, problem: &RangeProblem<'_>, start: DVector<f64>) -> DVector<f64> {
        let mut x = start;
        let mut cost = problem.cost(&x);
        let mut lambda = 1e-3;

        for _ in 0..self.config.max_iterations {
            if cost < 1e-24 {
                break;
            }

            let residuals = problem.residuals(&x);
            let jacobian = problem.jacobian(&x);
            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let jtr = &jt * &residuals;

            let mut accepted = None;
            for _ in 0..10 {
                let mut damped = jtj.clone();
                for i in 0..problem.dims {
                    damped[(i, i)] += lambda * (jtj[(i, i)] + 1e-9);
                }

                match damped.lu().solve(&(-&jtr)) {
                    Some(step) => {
                        let candidate = &x + &step;
                        let candidate_cost = problem.cost(&candidate);
                        if candidate_cost < cost {
                            lambda = (lambda * 0.1).max(1e-12);
                            accepted = Some((candidate, candidate_cost, step.norm()));
                            break;
                        }
                        lambda *= 10.0;
                    }
                    None => lambda *= 10.0,
                }
                if lambda > 1e12 {
                    break;
                }
            }

            let Some((next, next_cost, step_norm)) = accepted else {
                break;
            };
            let gain = cost - next_cost;
            x = next;
            cost = next_cost;

            if step_norm < 1e-12 * (1.0 + x.norm()) || gain < 1e-15 * cost.max(1e-30) {
                break;
            }
        }

        x
    }

    /// `(JᵀWJ)⁻¹` embedded in 3×3, ridge-bounded by `max_position_variance`.
    fn solution_covariance(&self, normal: &DMatrix<f64>, dims: usize, degraded: bool) -> Matrix3<f64> {
        let ridge = DMatrix::identity(dims, dims) / self.config.max_position_variance;
        let inverse = (normal + ridge)
            .try_inverse()
            .unwrap_or_else(|| DMatrix::identity(dims, dims) * self.config.max_position_variance);

        let mut cov = Matrix3::zeros();
        for i in 0..dims {
            for j in 0..dims {
                cov[(i, j)] = inverse[(i, j)];
            }
        }
        if dims == 2 {
            cov[(2, 2)] = if degraded {
                self.config.degraded_z_variance
            } else {
                0.5 * (cov[(0, 0)] + cov[(1, 1)])
            };
        }
        cov
    }

    fn centroid_estimate(&self, ctx: &SolveContext<'_, '_>, centroid: &Vector3<f64>) -> PositionEstimate {
        let anchors = ctx.problem.anchors;
        let residual = ctx.problem.range_residual(centroid);
        let mean_variance =
            anchors.iter().map(|a| a.sigma * a.sigma).sum::<f64>() / anchors.len() as f64;
        let variance = (mean_variance + residual / anchors.len() as f64)
            .min(self.config.max_position_variance);

        let mut covariance = Matrix3::identity() * variance;
        if ctx.degraded {
            covariance[(2, 2)] = self.config.degraded_z_variance;
        }

        PositionEstimate {
            entity_id: ctx.entity_id.clone(),
            position: *centroid,
            covariance,
            residual,
            contributing_nodes: contributing(anchors),
            timestamp: ctx.timestamp,
            method: SolveMethod::WeightedCentroid,
            dimensions: solved_dimensions(ctx.problem.dims),
            low_confidence: true,
            condition_number: ctx.condition_number,
        }
    }
}

struct SolveContext<'a, 'p> {
    entity_id: &'a EntityId,
    problem: &'a RangeProblem<'p>,
    timestamp: f64,
    condition_number: f64,
    degraded: bool,
}

fn solved_dimensions(dims: usize) -> Dimensions {
    if dims == 2 {
        Dimensions::Planar
    } else {
        Dimensions::Spatial
    }
}

fn contributing(anchors: &[Anchor]) -> BTreeSet<NodeId> {
    anchors.iter().map(|a| a.node_id.clone()).collect()
}

/// Condition number of the centred anchor positions and the weakest axis.
fn anchor_geometry(anchors: &[Anchor], dims: usize) -> (f64, Option<DVector<f64>>) {
    let n = anchors.len();
    let mean = anchors.iter().map(|a| a.position).sum::<Vector3<f64>>() / n as f64;
    let centred = DMatrix::from_fn(n, dims, |i, j| anchors[i].position[j] - mean[j]);

    let svd = centred.svd(false, true);
    let values = &svd.singular_values;
    let (mut min_idx, mut max_idx) = (0, 0);
    for i in 1..values.len() {
        if values[i] < values[min_idx] {
            min_idx = i;
        }
        if values[i] > values[max_idx] {
            max_idx = i;
        }
    }

    let (s_min, s_max) = (values[min_idx], values[max_idx]);
    let condition = if s_max <= 0.0 || s_min <= 1e-9 * s_max {
        f64::INFINITY
    } else {
        s_max / s_min
    };
    let weak = svd
        .v_t
        .map(|v_t| v_t.row(min_idx).transpose().into_owned());

    (condition, weak)
}

/// Condition number of a symmetric positive semi-definite matrix.
fn normal_condition(normal: &DMatrix<f64>) -> f64 {
    let eigenvalues = normal.clone().symmetric_eigenvalues();
    let max = eigenvalues.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    if min.is_nan() || min <= 0.0 || !max.is_finite() {
        f64::INFINITY
    } else {
        max / min
    }
}

/// Inverse-distance weighted centroid of the anchors.
fn weighted_centroid(anchors: &[Anchor], dims: usize, z_fixed: f64) -> Vector3<f64> {
    let mut sum = Vector3::zeros();
    let mut total = 0.0;
    for a in anchors {
        let w = 1.0 / a.distance.max(0.1);
        sum += a.position * w;
        total += w;
    }
    let mut c = sum / total;
    if dims == 2 {
        c.z = z_fixed;
    }
    c
}
