//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the simulated deployment:
//! - True positions of all entities and all nodes
//! - Kinematics (constant velocity)
//! - Radio observations generated from the log-distance path-loss model
//!   with log-normal shadowing, dropouts and occasional outliers

use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use whofi_core::{CalibrationParams, Measurement, Node, Signal};
use whofi_env::{EntityId, NodeId};

/// A ground truth entity in the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthEntity {
    pub id: EntityId,

    /// Position [x, y, z] in meters
    pub position: Vector3<f64>,

    /// Velocity [vx, vy, vz] in m/s
    pub velocity: Vector3<f64>,

    /// Entity is active (not removed)
    pub active: bool,
}

/// Radio impairments applied to generated observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioModel {
    /// Log-normal shadowing standard deviation (dB)
    pub shadowing_sigma_db: f64,

    /// Probability that a node misses an entity on a given step
    pub dropout_probability: f64,

    /// Probability that an observation is an outlier
    pub outlier_probability: f64,

    /// Offset applied to outlier observations (dB)
    pub outlier_offset_db: f64,
}

impl Default for RadioModel {
    fn default() -> Self {
        Self {
            shadowing_sigma_db: 2.0,
            dropout_probability: 0.0,
            outlier_probability: 0.0,
            outlier_offset_db: -25.0,
        }
    }
}

/// The Oracle - maintains ground truth and generates node observations.
pub struct Oracle {
    /// Radio noise stream, seeded from `SimContext::physics_seed`
    physics_rng: ChaCha8Rng,

    /// Surveyed node positions as they really are
    nodes: Vec<Node>,

    /// Propagation parameters the radio channel really follows
    params: CalibrationParams,

    radio: RadioModel,

    entities: BTreeMap<EntityId, GroundTruthEntity>,

    /// Next sequence number per (node, entity)
    sequences: HashMap<(NodeId, EntityId), u64>,

    /// Nodes that currently produce no observations
    silenced: HashSet<NodeId>,

    /// Current simulation time (seconds)
    current_time: f64,
}

impl Oracle {
    /// Creates a new Oracle with the given physics seed.
    ///
    /// Runs use `SimContext::physics_seed` so the noise stream is decorrelated
    /// from the master seed.
    pub fn new(physics_seed: u64, nodes: Vec<Node>, params: CalibrationParams) -> Self {
        Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            nodes,
            params,
            radio: RadioModel::default(),
            entities: BTreeMap::new(),
            sequences: HashMap::new(),
            silenced: HashSet::new(),
            current_time: 0.0,
        }
    }

    pub fn set_radio_model(&mut self, radio: RadioModel) {
        self.radio = radio;
    }

    pub fn radio_model(&self) -> &RadioModel {
        &self.radio
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Moves a node in the real world (the engine's table is not told).
    pub fn move_node(&mut self, id: &NodeId, position: Vector3<f64>) {
        if let Some(node) = self.nodes.iter_mut().find(|n| &n.id == id) {
            node.position = position;
        }
    }

    pub fn silence_node(&mut self, id: &NodeId) {
        self.silenced.insert(id.clone());
    }

    pub fn restore_node(&mut self, id: &NodeId) {
        self.silenced.remove(id);
    }

    /// Spawns a new entity.
    pub fn spawn_entity(&mut self, id: impl Into<EntityId>, position: Vector3<f64>, velocity: Vector3<f64>) -> EntityId {
        let id = id.into();
        self.entities.insert(
            id.clone(),
            GroundTruthEntity {
                id: id.clone(),
                position,
                velocity,
                active: true,
            },
        );
        id
    }

    pub fn remove_entity(&mut self, id: &EntityId) {
        if let Some(entity) = self.entities.get_mut(id) {
            entity.active = false;
        }
    }

    pub fn set_velocity(&mut self, id: &EntityId, velocity: Vector3<f64>) {
        if let Some(entity) = self.entities.get_mut(id) {
            entity.velocity = velocity;
        }
    }

    /// Advances kinematics by dt seconds.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;
        for entity in self.entities.values_mut().filter(|e| e.active) {
            entity.position += entity.velocity * dt;
        }
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn active_entities(&self) -> Vec<&GroundTruthEntity> {
        self.entities.values().filter(|e| e.active).collect()
    }

    pub fn entity(&self, id: &EntityId) -> Option<&GroundTruthEntity> {
        self.entities.get(id)
    }

    /// Noise-free RSSI a node observes from a point.
    pub fn ideal_rssi(&self, node: &Node, position: &Vector3<f64>) -> f64 {
        let reference = node
            .overrides
            .reference_rssi_dbm
            .unwrap_or(self.params.reference_rssi_dbm);
        let exponent = node
            .overrides
            .path_loss_exponent
            .unwrap_or(self.params.path_loss_exponent);
        let distance = (node.position - position).norm().max(0.1);
        reference - 10.0 * exponent * distance.log10()
    }

    /// One observation per (node, active entity), stamped with `timestamp`.
    pub fn generate_measurements(&mut self, timestamp: f64) -> Vec<Measurement> {
        let sigma = self.radio.shadowing_sigma_db;
        let shadowing = Normal::new(0.0, sigma).ok().filter(|_| sigma > 0.0);
        let mut out = Vec::new();

        for node in &self.nodes {
            if self.silenced.contains(&node.id) {
                continue;
            }
            for entity in self.entities.values().filter(|e| e.active) {
                if self.physics_rng.gen_bool(self.radio.dropout_probability.clamp(0.0, 1.0)) {
                    continue;
                }

                let mut rssi = self.ideal_rssi(node, &entity.position);
                if let Some(normal) = &shadowing {
                    rssi += normal.sample(&mut self.physics_rng);
                }
                if self.physics_rng.gen_bool(self.radio.outlier_probability.clamp(0.0, 1.0)) {
                    rssi += self.radio.outlier_offset_db;
                }

                let sequence = self
                    .sequences
                    .entry((node.id.clone(), entity.id.clone()))
                    .or_insert(0);
                *sequence += 1;

                out.push(Measurement {
                    node_id: node.id.clone(),
                    entity_id: entity.id.clone(),
                    signal: Signal::rssi(rssi),
                    timestamp,
                    sequence_no: *sequence,
                });
            }
        }
        out
    }

    /// Ground truth positions for error calculation.
    pub fn ground_truth_positions(&self) -> Vec<(EntityId, Vector3<f64>)> {
        self.entities
            .values()
            .filter(|e| e.active)
            .map(|e| (e.id.clone(), e.position))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn triangle() -> Vec<Node> {
        vec![
            Node::new("a", 0.0, 0.0),
            Node::new("b", 10.0, 0.0),
            Node::new("c", 5.0, 8.66),
        ]
    }

    #[test]
    fn test_oracle_physics_step() {
        let mut oracle = Oracle::new(42, triangle(), CalibrationParams::default());
        let id = oracle.spawn_entity("walker", Vector3::zeros(), Vector3::new(1.5, 0.0, 0.0));

        oracle.step(2.0);

        let entity = oracle.entity(&id).unwrap();
        assert_relative_eq!(entity.position.x, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_oracle_ideal_rssi_follows_path_loss() {
        let oracle = Oracle::new(42, triangle(), CalibrationParams::default());
        let node = &oracle.nodes()[0];
        let rssi = oracle.ideal_rssi(node, &Vector3::new(10.0, 0.0, 0.0));
        assert_relative_eq!(rssi, -50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_oracle_deterministic_noise() {
        let run = |seed| {
            let mut oracle = Oracle::new(seed, triangle(), CalibrationParams::default());
            oracle.spawn_entity("e", Vector3::new(5.0, 3.0, 0.0), Vector3::zeros());
            oracle
                .generate_measurements(1.0)
                .into_iter()
                .map(|m| m.signal.rssi_dbm)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }

    #[test]
    fn test_oracle_sequences_and_silencing() {
        let mut oracle = Oracle::new(1, triangle(), CalibrationParams::default());
        oracle.spawn_entity("e", Vector3::new(5.0, 3.0, 0.0), Vector3::zeros());
        oracle.silence_node(&NodeId::from("c"));

        oracle.generate_measurements(1.0);
        let second = oracle.generate_measurements(1.1);

        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|m| m.sequence_no == 2));
    }
}
