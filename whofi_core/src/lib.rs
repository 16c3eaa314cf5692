//! WhoFi Core - Multi-node RF positioning engine
//!
//! Turns per-node radio observations of mobile entities into tracked
//! position estimates:
//! 1. **Ranging**: RSSI/CSI measurements become distance estimates with variance
//! 2. **Multilateration**: ranges from one epoch are solved into a position
//! 3. **Tracking**: a constant-velocity Kalman filter smooths, coasts and
//!    expires each entity, with a bounded confidence score per update
//!
//! [`PositioningEngine`] wires the stages together; [`agent_runtime`] drives
//! it from an environment clock and publishes to a latest-wins feed.

pub mod agent_runtime;
pub mod calibration;
pub mod confidence;
pub mod config;
pub mod engine;
pub mod epoch;
pub mod estimator;
pub mod filter;
pub mod ingest;
pub mod solver;
pub mod tracking;
pub mod types;

// Re-export key types for convenience
pub use agent_runtime::{AgentConfig, PositioningAgent};
pub use calibration::{CalibrationError, CalibrationParams, Dimensions, Node, NodeTable, NodeTableFile};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Accepted, EngineError, EngineStats, PositioningEngine};
pub use estimator::{DistanceEstimator, EstimateError, EstimatorConfig};
pub use ingest::{NodeReport, NodeStatus, RejectReason, Rejected};
pub use solver::SolveError;
pub use types::{
    FeedEvent, Measurement, PositionEstimate, RangeEstimate, Signal, SolveMethod, TrackSnapshot,
    TrackState,
};
pub use whofi_env::{EntityId, NodeId};
