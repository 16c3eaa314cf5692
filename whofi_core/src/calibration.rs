//! Calibration: deployment radio parameters and the node position table.
//!
//! A [`NodeTable`] is validated once and then treated as immutable. The
//! engine holds it behind an `Arc` and replaces it wholesale on reload.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;
use whofi_env::NodeId;

/// Minimum number of nodes a usable deployment needs.
pub const MIN_NODES: usize = 3;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Node table is empty")]
    Empty,

    #[error("Node table has {0} nodes, at least 3 are required")]
    TooFewNodes(usize),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Node {0} has a non-finite coordinate or parameter")]
    NonFinite(NodeId),

    #[error("Invalid path-loss exponent {exponent} for {scope}")]
    InvalidExponent { scope: String, exponent: f64 },

    #[error("Invalid calibration parameter: {0}")]
    InvalidParameter(String),

    #[error("Failed to read node table: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse node table: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// Deployment-wide radio propagation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationParams {
    /// Signal strength at 1 m (dBm)
    pub reference_rssi_dbm: f64,

    /// Log-distance path-loss exponent (2.0 = free space)
    pub path_loss_exponent: f64,

    /// Receiver noise floor (dBm); weaker signals carry no range information
    pub noise_floor_dbm: f64,

    /// Standard deviation of log-normal shadowing (dB)
    pub shadowing_sigma_db: f64,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            reference_rssi_dbm: -30.0,
            path_loss_exponent: 2.0,
            noise_floor_dbm: -95.0,
            shadowing_sigma_db: 4.0,
        }
    }
}

impl CalibrationParams {
    fn validate(&self) -> Result<(), CalibrationError> {
        let values = [
            self.reference_rssi_dbm,
            self.path_loss_exponent,
            self.noise_floor_dbm,
            self.shadowing_sigma_db,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::InvalidParameter(
                "non-finite deployment default".to_string(),
            ));
        }
        if self.path_loss_exponent <= 0.0 {
            return Err(CalibrationError::InvalidExponent {
                scope: "deployment defaults".to_string(),
                exponent: self.path_loss_exponent,
            });
        }
        if self.shadowing_sigma_db <= 0.0 {
            return Err(CalibrationError::InvalidParameter(format!(
                "shadowing sigma must be positive, got {}",
                self.shadowing_sigma_db
            )));
        }
        if self.noise_floor_dbm >= self.reference_rssi_dbm {
            return Err(CalibrationError::InvalidParameter(format!(
                "noise floor {} dBm must lie below the reference signal {} dBm",
                self.noise_floor_dbm, self.reference_rssi_dbm
            )));
        }
        Ok(())
    }
}

/// Per-node overrides of the deployment defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_rssi_dbm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_loss_exponent: Option<f64>,
}

// ============================================================================
// NODES
// ============================================================================

/// A fixed sensor node at a surveyed position.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    /// Position in meters; `z` is 0 for planar deployments
    pub position: Vector3<f64>,
    /// Whether the survey supplied a height
    pub has_z: bool,
    pub overrides: NodeOverrides,
}

impl Node {
    /// Planar node.
    pub fn new(id: impl Into<NodeId>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            position: Vector3::new(x, y, 0.0),
            has_z: false,
            overrides: NodeOverrides::default(),
        }
    }

    /// Node with a surveyed height.
    pub fn new_3d(id: impl Into<NodeId>, x: f64, y: f64, z: f64) -> Self {
        Self {
            id: id.into(),
            position: Vector3::new(x, y, z),
            has_z: true,
            overrides: NodeOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: NodeOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Dimensionality of the solve space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimensions {
    Planar,
    Spatial,
}

impl Dimensions {
    /// Nodes needed for a fully determined solve.
    pub fn required_nodes(self) -> usize {
        match self {
            Dimensions::Planar => 3,
            Dimensions::Spatial => 4,
        }
    }

    pub fn count(self) -> usize {
        match self {
            Dimensions::Planar => 2,
            Dimensions::Spatial => 3,
        }
    }
}

/// Validated, immutable node table plus deployment parameters.
#[derive(Debug, Clone)]
pub struct NodeTable {
    nodes: BTreeMap<NodeId, Node>,
    params: CalibrationParams,
    dimensions: Dimensions,
}

impl NodeTable {
    /// Validates and builds a table.
    ///
    /// The deployment is spatial when any node carries a surveyed height.
    pub fn new(nodes: Vec<Node>, params: CalibrationParams) -> Result<Self, CalibrationError> {
        if nodes.is_empty() {
            return Err(CalibrationError::Empty);
        }
        if nodes.len() < MIN_NODES {
            return Err(CalibrationError::TooFewNodes(nodes.len()));
        }
        params.validate()?;

        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.id.clone()) {
                return Err(CalibrationError::DuplicateNode(node.id.clone()));
            }
            let override_values = [
                node.overrides.reference_rssi_dbm,
                node.overrides.path_loss_exponent,
            ];
            if node.position.iter().any(|v| !v.is_finite())
                || override_values.iter().flatten().any(|v| !v.is_finite())
            {
                return Err(CalibrationError::NonFinite(node.id.clone()));
            }
            if let Some(exponent) = node.overrides.path_loss_exponent {
                if exponent <= 0.0 {
                    return Err(CalibrationError::InvalidExponent {
                        scope: format!("node {}", node.id),
                        exponent,
                    });
                }
            }
        }

        let dimensions = if nodes.iter().any(|n| n.has_z) {
            Dimensions::Spatial
        } else {
            Dimensions::Planar
        };

        Ok(Self {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            params,
            dimensions,
        })
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn params(&self) -> &CalibrationParams {
        &self.params
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Reference signal at 1 m for a node, falling back to the default.
    pub fn reference_rssi(&self, node: &Node) -> f64 {
        node.overrides
            .reference_rssi_dbm
            .unwrap_or(self.params.reference_rssi_dbm)
    }

    /// Path-loss exponent for a node, falling back to the default.
    pub fn path_loss_exponent(&self, node: &Node) -> f64 {
        node.overrides
            .path_loss_exponent
            .unwrap_or(self.params.path_loss_exponent)
    }
}

// ============================================================================
// FILE FORMAT
// ============================================================================

/// One entry of the node table document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_rssi_dbm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_loss_exponent: Option<f64>,
}

/// JSON node table document.
///
/// ```json
/// {
///   "defaults": { "reference_rssi_dbm": -30.0, "path_loss_exponent": 2.0 },
///   "nodes": {
///     "node-a": { "x": 0.0, "y": 0.0 },
///     "node-b": { "x": 10.0, "y": 0.0, "path_loss_exponent": 2.4 }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTableFile {
    #[serde(default)]
    pub defaults: CalibrationParams,
    pub nodes: BTreeMap<String, NodeEntry>,
}

impl NodeTableFile {
    pub fn from_json_str(json: &str) -> Result<Self, CalibrationError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Validates the document into a [`NodeTable`].
    pub fn into_table(self) -> Result<NodeTable, CalibrationError> {
        let nodes = self
            .nodes
            .into_iter()
            .map(|(id, entry)| Node {
                id: NodeId::new(id),
                position: Vector3::new(entry.x, entry.y, entry.z.unwrap_or(0.0)),
                has_z: entry.z.is_some(),
                overrides: NodeOverrides {
                    reference_rssi_dbm: entry.reference_rssi_dbm,
                    path_loss_exponent: entry.path_loss_exponent,
                },
            })
            .collect();
        NodeTable::new(nodes, self.defaults)
    }
}
