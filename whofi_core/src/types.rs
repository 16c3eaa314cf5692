//! Data model shared by every stage of the positioning pipeline.

use crate::calibration::Dimensions;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use whofi_env::{EntityId, NodeId};

// ============================================================================
// INPUT
// ============================================================================

/// Radio observation carried by a measurement.
///
/// At least one of the two payloads must be present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Signal {
    /// Received signal strength in dBm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi_dbm: Option<f64>,

    /// Channel-state feature vector (e.g. per-subcarrier amplitudes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csi: Option<Vec<f64>>,
}

impl Signal {
    pub fn rssi(rssi_dbm: f64) -> Self {
        Self {
            rssi_dbm: Some(rssi_dbm),
            csi: None,
        }
    }

    pub fn csi(features: Vec<f64>) -> Self {
        Self {
            rssi_dbm: None,
            csi: Some(features),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rssi_dbm.is_none() && self.csi.is_none()
    }
}

/// A single per-node radio sample for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub node_id: NodeId,
    pub entity_id: EntityId,
    pub signal: Signal,
    /// Capture time, seconds since the Unix epoch
    pub timestamp: f64,
    /// Per-node sequence counter
    pub sequence_no: u64,
}

// ============================================================================
// INTERMEDIATE
// ============================================================================

/// Distance from one node to an entity, valid within one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeEstimate {
    pub node_id: NodeId,
    pub entity_id: EntityId,
    /// Estimated range in meters
    pub distance_m: f64,
    /// Range variance in m²
    pub variance: f64,
    pub timestamp: f64,
}

/// How a raw position was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveMethod {
    /// Weighted Levenberg-Marquardt least squares
    LeastSquares,
    /// Least squares constrained to the anchor plane (3D deployment, 3 nodes)
    PlanarLeastSquares,
    /// Inverse-distance weighted centroid of the contributing nodes
    WeightedCentroid,
}

/// Raw output of the multilateration solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEstimate {
    pub entity_id: EntityId,
    pub position: Vector3<f64>,
    /// Position covariance (m²)
    pub covariance: Matrix3<f64>,
    /// Sum of squared range errors at the solution (m²)
    pub residual: f64,
    pub contributing_nodes: BTreeSet<NodeId>,
    pub timestamp: f64,
    pub method: SolveMethod,
    /// Axes actually solved for
    pub dimensions: Dimensions,
    /// Degraded geometry or fallback solve
    pub low_confidence: bool,
    /// Condition number of the anchor geometry
    pub condition_number: f64,
}

// ============================================================================
// OUTPUT
// ============================================================================

/// Lifecycle state of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Uninitialized,
    Tracking,
    Coasting,
    Expired,
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackState::Uninitialized => "uninitialized",
            TrackState::Tracking => "tracking",
            TrackState::Coasting => "coasting",
            TrackState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Published view of a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub entity_id: EntityId,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    /// Fused confidence in [0, 1]
    pub confidence: f64,
    /// Time of the state this snapshot describes
    pub timestamp: f64,
    pub state: TrackState,
    /// Time of the last accepted update
    pub last_update: f64,
    /// Seconds since track creation
    pub age: f64,
    /// Trace of the position covariance (m²)
    pub position_uncertainty: f64,
    pub contributing_nodes: Vec<NodeId>,
    pub low_confidence: bool,
}

impl TrackSnapshot {
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }
}

/// Event delivered on the output feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    Position(TrackSnapshot),
    Expired { entity_id: EntityId, timestamp: f64 },
}

impl FeedEvent {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            FeedEvent::Position(snapshot) => &snapshot.entity_id,
            FeedEvent::Expired { entity_id, .. } => entity_id,
        }
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            FeedEvent::Position(snapshot) => snapshot.timestamp,
            FeedEvent::Expired { timestamp, .. } => *timestamp,
        }
    }
}
