//! Constant-velocity Kalman filter for a single track.
//!
//! State is `[x, y, z, vx, vy, vz]`; the solver supplies position-only
//! measurements (`H = [I₃ | 0]`). Updates are gated on the Mahalanobis
//! distance of the innovation and a rejected update leaves the filter
//! exactly as it was.

use nalgebra::{Matrix3, Matrix3x6, Matrix6, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Expected interval between updates (s)
    pub expected_interval_s: f64,

    /// Coasting predicts for at most `coast_multiplier × expected_interval_s`
    pub coast_multiplier: f64,

    /// A track with no accepted update for this long expires (s)
    pub staleness_timeout_s: f64,

    /// Mahalanobis gate (σ)
    pub gating_sigma: f64,

    /// White-noise acceleration spectral density ((m/s²)²·s)
    pub process_noise: f64,

    /// Position variance floor at initialisation (m²)
    pub initial_position_variance: f64,

    /// Velocity variance at initialisation ((m/s)²)
    pub initial_velocity_variance: f64,

    /// Measurement variance floor (m²)
    pub min_measurement_variance: f64,

    /// Diagonal covariance used when the innovation matrix degrades
    pub reset_variance: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            expected_interval_s: 0.5,
            coast_multiplier: 3.0,
            staleness_timeout_s: 10.0,
            gating_sigma: 3.0,
            process_noise: 0.5,
            initial_position_variance: 1.0,
            initial_velocity_variance: 4.0,
            min_measurement_variance: 0.01,
            reset_variance: 1000.0,
        }
    }
}

impl FilterConfig {
    /// Longest predict-only horizon after the last update (s).
    pub fn coast_period_s(&self) -> f64 {
        self.expected_interval_s * self.coast_multiplier
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("gating rejected update: Mahalanobis distance {distance:.2} > {limit:.2}")]
    GatingRejected { distance: f64, limit: f64 },

    #[error("measurement is not finite")]
    NonFinite,
}

/// Result of an accepted update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateOutcome {
    Updated { mahalanobis: f64 },
    /// The innovation covariance was not positive definite; the filter reset
    /// its covariance and kept its state
    CovarianceReset,
}

// ============================================================================
// FILTER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantVelocityFilter {
    /// State vector [x, y, z, vx, vy, vz]
    pub state: Vector6<f64>,

    /// 6×6 state covariance
    pub covariance: Matrix6<f64>,

    /// Time the state refers to (s)
    pub time: f64,

    /// Process noise spectral density
    process_noise: f64,

    /// Diagonal variance applied on a covariance reset
    reset_variance: f64,
}

impl ConstantVelocityFilter {
    /// Starts a filter at `position` with zero velocity.
    pub fn new(
        position: Vector3<f64>,
        position_covariance: &Matrix3<f64>,
        time: f64,
        config: &FilterConfig,
    ) -> Self {
        let mut covariance = Matrix6::zeros();
        let pos = symmetrize(position_covariance);
        for i in 0..3 {
            for j in 0..3 {
                covariance[(i, j)] = pos[(i, j)];
            }
            covariance[(i, i)] = covariance[(i, i)].max(config.initial_position_variance);
            covariance[(i + 3, i + 3)] = config.initial_velocity_variance;
        }

        Self {
            state: Vector6::new(position.x, position.y, position.z, 0.0, 0.0, 0.0),
            covariance,
            time,
            process_noise: config.process_noise,
            reset_variance: config.reset_variance,
        }
    }

    #[inline]
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.state[0], self.state[1], self.state[2])
    }

    #[inline]
    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::new(self.state[3], self.state[4], self.state[5])
    }

    /// Position covariance (upper-left 3×3 block).
    #[inline]
    pub fn position_covariance(&self) -> Matrix3<f64> {
        self.covariance.fixed_view::<3, 3>(0, 0).into()
    }

    /// Prediction step: advance the state to `time`.
    ///
    /// Times at or before the current state time leave the filter unchanged.
    pub fn predict_to(&mut self, time: f64) {
        let dt = time - self.time;
        if dt <= 0.0 || !dt.is_finite() {
            return;
        }

        let f = motion_model(dt);
        let q = process_noise(dt, self.process_noise);

        self.state = f * self.state;
        self.covariance = f * self.covariance * f.transpose() + q;
        self.time = time;
    }

    /// Mahalanobis distance of a position measurement against the current
    /// state, or `None` if the innovation covariance is not positive definite.
    pub fn mahalanobis(&self, z: &Vector3<f64>, r: &Matrix3<f64>) -> Option<f64> {
        let h = measurement_matrix();
        let innovation = z - h * self.state;
        let s = h * self.covariance * h.transpose() + r;
        let chol = s.cholesky()?;
        let d2 = innovation.dot(&chol.solve(&innovation));
        Some(d2.max(0.0).sqrt())
    }

    /// Predicts to `time`, gates, and applies a position measurement.
    ///
    /// On `GatingRejected` the filter, including its time, is unchanged.
    pub fn update(
        &mut self,
        z: &Vector3<f64>,
        r: &Matrix3<f64>,
        time: f64,
        gate_sigma: f64,
    ) -> Result<UpdateOutcome, FilterError> {
        if z.iter().any(|v| !v.is_finite()) || r.iter().any(|v| !v.is_finite()) {
            return Err(FilterError::NonFinite);
        }

        let mut predicted = self.clone();
        predicted.predict_to(time);

        let h = measurement_matrix();
        let r = symmetrize(r);
        let innovation = z - h * predicted.state;
        let s = h * predicted.covariance * h.transpose() + r;

        // Self-healing reset when the innovation covariance degrades
        let Some(chol) = s.cholesky() else {
            predicted.reset_covariance();
            *self = predicted;
            return Ok(UpdateOutcome::CovarianceReset);
        };

        let d2 = innovation.dot(&chol.solve(&innovation));
        let distance = d2.max(0.0).sqrt();
        if distance > gate_sigma {
            return Err(FilterError::GatingRejected {
                distance,
                limit: gate_sigma,
            });
        }

        // K = P Hᵀ S⁻¹
        let pht = predicted.covariance * h.transpose();
        let k = chol.solve(&pht.transpose()).transpose();

        predicted.state += k * innovation;

        // Joseph form: P = (I - KH) P (I - KH)ᵀ + K R Kᵀ
        let ikh = Matrix6::identity() - k * h;
        predicted.covariance =
            ikh * predicted.covariance * ikh.transpose() + k * r * k.transpose();

        *self = predicted;
        Ok(UpdateOutcome::Updated {
            mahalanobis: distance,
        })
    }

    /// Reset covariance to a high-uncertainty diagonal so the filter can
    /// re-converge.
    fn reset_covariance(&mut self) {
        self.covariance = Matrix6::identity() * self.reset_variance;
    }
}

// ========== Private Helper Methods ==========

fn measurement_matrix() -> Matrix3x6<f64> {
    let mut h = Matrix3x6::zeros();
    h[(0, 0)] = 1.0;
    h[(1, 1)] = 1.0;
    h[(2, 2)] = 1.0;
    h
}

/// Constant velocity: p_new = p + v·dt
fn motion_model(dt: f64) -> Matrix6<f64> {
    let mut f = Matrix6::identity();
    f[(0, 3)] = dt;
    f[(1, 4)] = dt;
    f[(2, 5)] = dt;
    f
}

/// Discrete white-noise acceleration model.
fn process_noise(dt: f64, q: f64) -> Matrix6<f64> {
    let dt2 = dt * dt;
    let dt3 = dt2 * dt;
    let mut m = Matrix6::zeros();
    for i in 0..3 {
        m[(i, i)] = q * dt3 / 3.0;
        m[(i, i + 3)] = q * dt2 / 2.0;
        m[(i + 3, i)] = q * dt2 / 2.0;
        m[(i + 3, i + 3)] = q * dt;
    }
    m
}

fn symmetrize(m: &Matrix3<f64>) -> Matrix3<f64> {
    (m + m.transpose()) * 0.5
}
