//! Positioning Engine - wires the pipeline stages together.
//!
//! ```text
//! ingest ─▶ estimator ─▶ epoch buffer ─tick─▶ solver ─▶ registry ─▶ FeedEvent
//! ```
//!
//! The engine is `Send + Sync`; measurements may be ingested from several
//! threads while another drives [`PositioningEngine::tick`]. The node table
//! lives behind an `Arc` that is swapped atomically on reload; epochs opened
//! under an older calibration are discarded.

use crate::calibration::{CalibrationError, NodeTable, NodeTableFile};
use crate::config::{ConfigError, EngineConfig};
use crate::epoch::EpochBuffer;
use crate::estimator::{build_estimator, DistanceEstimator, EstimateError};
use crate::ingest::{MeasurementIngestor, NodeReport, NodeStatus, RejectReason, Rejected};
use crate::solver::{MultilaterationSolver, SolveError};
use crate::tracking::{TrackRegistry, UpdateKind};
use crate::confidence::ConfidenceScorer;
use crate::types::{FeedEvent, Measurement, RangeEstimate, SolveMethod, TrackSnapshot};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use whofi_env::{EntityId, NodeId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid calibration: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Invalid estimator: {0}")]
    Estimator(#[from] EstimateError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// A measurement that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub range: RangeEstimate,
    /// The measurement opened a new epoch for its entity
    pub opened_epoch: bool,
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub accepted: u64,
    pub rejected: BTreeMap<RejectReason, u64>,
    pub epochs_closed: u64,
    pub solves: u64,
    pub insufficient_epochs: u64,
    pub invalidated_epochs: u64,
    pub fallback_solves: u64,
    pub low_confidence_solves: u64,
    pub gating_rejections: u64,
    pub covariance_resets: u64,
    pub tracks_created: u64,
    pub tracks_expired: u64,
    pub active_tracks: usize,
    pub open_epochs: usize,
    pub tracked_pairs: usize,
    pub calibration_generation: u64,
}

impl EngineStats {
    pub fn total_rejected(&self) -> u64 {
        self.rejected.values().sum()
    }

    pub fn rejected_for(&self, reason: RejectReason) -> u64 {
        self.rejected.get(&reason).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: [AtomicU64; RejectReason::ALL.len()],
    epochs_closed: AtomicU64,
    solves: AtomicU64,
    insufficient_epochs: AtomicU64,
    invalidated_epochs: AtomicU64,
    fallback_solves: AtomicU64,
    low_confidence_solves: AtomicU64,
    gating_rejections: AtomicU64,
    covariance_resets: AtomicU64,
    tracks_created: AtomicU64,
    tracks_expired: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Clone)]
struct Calibration {
    table: Arc<NodeTable>,
    generation: u64,
}

pub struct PositioningEngine {
    config: EngineConfig,
    calibration: RwLock<Calibration>,
    estimator: Arc<dyn DistanceEstimator>,
    ingestor: MeasurementIngestor,
    epochs: EpochBuffer,
    solver: MultilaterationSolver,
    registry: TrackRegistry,
    counters: Counters,
}

impl PositioningEngine {
    /// Builds an engine. Fails fast on an invalid configuration, estimator
    /// or node table.
    pub fn new(config: EngineConfig, table: NodeTable) -> Result<Self, EngineError> {
        config.validate()?;
        if table.is_empty() {
            return Err(CalibrationError::Empty.into());
        }
        let estimator = build_estimator(&config.estimator)?;

        info!(
            nodes = table.len(),
            dimensions = ?table.dimensions(),
            estimator = estimator.name(),
            "positioning engine ready"
        );

        Ok(Self {
            ingestor: MeasurementIngestor::new(config.ingest.clone()),
            epochs: EpochBuffer::new(config.epoch.clone()),
            solver: MultilaterationSolver::new(config.solver.clone()),
            registry: TrackRegistry::new(
                config.filter.clone(),
                ConfidenceScorer::new(config.confidence.clone()),
            ),
            calibration: RwLock::new(Calibration {
                table: Arc::new(table),
                generation: 0,
            }),
            estimator,
            counters: Counters::default(),
            config,
        })
    }

    /// Builds an engine from a node table document.
    pub fn from_file(config: EngineConfig, file: NodeTableFile) -> Result<Self, EngineError> {
        Self::new(config, file.into_table()?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The node table currently in force.
    pub fn calibration(&self) -> Arc<NodeTable> {
        Arc::clone(&self.calibration.read().table)
    }

    pub fn generation(&self) -> u64 {
        self.calibration.read().generation
    }

    pub fn estimator_name(&self) -> &'static str {
        self.estimator.name()
    }

    fn current(&self) -> Calibration {
        self.calibration.read().clone()
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Validates one measurement and adds its range to the entity's epoch.
    pub fn ingest(&self, measurement: &Measurement, now: f64) -> Result<Accepted, Rejected> {
        let Calibration { table, generation } = self.current();

        let result = self.ingestor.admit(measurement, now, &table, |m, node| {
            self.estimator.estimate(m, node, &table)
        });

        match result {
            Ok(range) => {
                bump(&self.counters.accepted);
                let opened_epoch = self.epochs.push(range.clone(), now, generation);
                Ok(Accepted {
                    range,
                    opened_epoch,
                })
            }
            Err(rejected) => {
                bump(&self.counters.rejected[rejected.reason().index()]);
                debug!(
                    node = %measurement.node_id,
                    entity = %measurement.entity_id,
                    reason = %rejected.reason(),
                    "measurement rejected: {}",
                    rejected
                );
                Err(rejected)
            }
        }
    }

    // ========================================================================
    // PERIODIC WORK
    // ========================================================================

    /// Closes due epochs and solves each of them.
    pub fn close_epochs(&self, now: f64) -> Vec<FeedEvent> {
        let mut events = Vec::new();

        for epoch in self.epochs.take_due(now) {
            bump(&self.counters.epochs_closed);

            let Calibration { table, generation } = self.current();
            if epoch.generation != generation {
                bump(&self.counters.invalidated_epochs);
                debug!(entity = %epoch.entity_id, "epoch predates calibration reload, discarded");
                continue;
            }

            let ranges = epoch.fused_ranges();
            let prior = self.registry.last_position(&epoch.entity_id);

            match self.solver.solve(&epoch.entity_id, &ranges, &table, prior.as_ref()) {
                Ok(estimate) => {
                    // A reload during the solve invalidates it
                    if self.generation() != generation {
                        bump(&self.counters.invalidated_epochs);
                        continue;
                    }

                    bump(&self.counters.solves);
                    if estimate.method == SolveMethod::WeightedCentroid {
                        bump(&self.counters.fallback_solves);
                    }
                    if estimate.low_confidence {
                        bump(&self.counters.low_confidence_solves);
                        warn!(
                            entity = %estimate.entity_id,
                            method = ?estimate.method,
                            condition = estimate.condition_number,
                            nodes = estimate.contributing_nodes.len(),
                            "degraded solve"
                        );
                    }

                    let online = self.ingestor.online_count(&table, now);
                    let update = self.registry.update(&estimate, now, online);
                    match update.kind {
                        UpdateKind::Created => bump(&self.counters.tracks_created),
                        UpdateKind::Rejected(_) => bump(&self.counters.gating_rejections),
                        UpdateKind::CovarianceReset => bump(&self.counters.covariance_resets),
                        UpdateKind::Updated => {}
                    }
                    events.push(FeedEvent::Position(update.snapshot));
                }
                Err(SolveError::InsufficientNodes {
                    available,
                    required,
                }) => {
                    bump(&self.counters.insufficient_epochs);
                    debug!(
                        entity = %epoch.entity_id,
                        available,
                        required,
                        "insufficient nodes for solve"
                    );
                    if let Some(snapshot) = self.registry.coast(&epoch.entity_id, now) {
                        events.push(FeedEvent::Position(snapshot));
                    }
                }
            }
        }

        events
    }

    /// Expires stale tracks and coasts idle ones.
    pub fn sweep(&self, now: f64) -> Vec<FeedEvent> {
        let expired = self.registry.expire_stale(now);
        self.counters
            .tracks_expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        for entity_id in &expired {
            self.ingestor.forget_entity(entity_id);
        }
        let pruned = self.ingestor.prune_idle(now);
        if pruned > 0 {
            debug!(pruned, "dropped idle pair state");
        }

        let mut events: Vec<FeedEvent> = self
            .registry
            .coast_idle(now)
            .into_iter()
            .map(FeedEvent::Position)
            .collect();
        events.extend(expired.into_iter().map(|entity_id| FeedEvent::Expired {
            entity_id,
            timestamp: now,
        }));
        events
    }

    /// `close_epochs` followed by `sweep`.
    pub fn tick(&self, now: f64) -> Vec<FeedEvent> {
        let mut events = self.close_epochs(now);
        events.extend(self.sweep(now));
        events
    }

    // ========================================================================
    // CONTROL SURFACE
    // ========================================================================

    /// Atomically replaces the node table. Open epochs are discarded.
    ///
    /// Returns the new calibration generation.
    pub fn reload_calibration(&self, table: NodeTable) -> u64 {
        let nodes = table.len();
        let generation = {
            let mut calibration = self.calibration.write();
            calibration.generation += 1;
            calibration.table = Arc::new(table);
            calibration.generation
        };

        let discarded = self.epochs.clear();
        self.counters
            .invalidated_epochs
            .fetch_add(discarded as u64, Ordering::Relaxed);
        self.ingestor.retain_nodes(&self.calibration());

        info!(nodes, generation, discarded_epochs = discarded, "calibration reloaded");
        generation
    }

    /// Validates a node table document and reloads it.
    pub fn reload_from_file(&self, file: NodeTableFile) -> Result<u64, EngineError> {
        Ok(self.reload_calibration(file.into_table()?))
    }

    /// Drops an entity's track and open epoch.
    pub fn expire_entity(&self, entity_id: &EntityId, now: f64) -> Option<FeedEvent> {
        self.epochs.discard(entity_id);
        self.ingestor.forget_entity(entity_id);
        if !self.registry.expire_entity(entity_id) {
            return None;
        }
        bump(&self.counters.tracks_expired);
        Some(FeedEvent::Expired {
            entity_id: entity_id.clone(),
            timestamp: now,
        })
    }

    pub fn get_active_tracks(&self, now: f64) -> Vec<TrackSnapshot> {
        self.registry.get_active(now)
    }

    pub fn node_status(&self, now: f64) -> Vec<NodeStatus> {
        self.ingestor.node_status(&self.calibration(), now)
    }

    /// Records a node's stats report. Unknown nodes are ignored.
    pub fn report_node(&self, node_id: &NodeId, report: NodeReport, now: f64) -> bool {
        let known = self.ingestor.report_node(node_id, report, now, &self.calibration());
        if !known {
            debug!(node = %node_id, "stats report from unknown node");
        } else if !report.enabled {
            info!(node = %node_id, "node reports capture disabled");
        }
        known
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            accepted: read(&c.accepted),
            rejected: RejectReason::ALL
                .iter()
                .map(|r| (*r, read(&c.rejected[r.index()])))
                .filter(|(_, n)| *n > 0)
                .collect(),
            epochs_closed: read(&c.epochs_closed),
            solves: read(&c.solves),
            insufficient_epochs: read(&c.insufficient_epochs),
            invalidated_epochs: read(&c.invalidated_epochs),
            fallback_solves: read(&c.fallback_solves),
            low_confidence_solves: read(&c.low_confidence_solves),
            gating_rejections: read(&c.gating_rejections),
            covariance_resets: read(&c.covariance_resets),
            tracks_created: read(&c.tracks_created),
            tracks_expired: read(&c.tracks_expired),
            active_tracks: self.registry.len(),
            open_epochs: self.epochs.open_count(),
            tracked_pairs: self.ingestor.pair_count(),
            calibration_generation: self.generation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationParams, Node};
    use crate::types::{Signal, TrackState};
    use nalgebra::Vector3;

    fn triangle_with(params: CalibrationParams) -> NodeTable {
        NodeTable::new(
            vec![
                Node::new("a", 0.0, 0.0),
                Node::new("b", 10.0, 0.0),
                Node::new("c", 5.0, 8.66),
            ],
            params,
        )
        .unwrap()
    }

    fn triangle() -> NodeTable {
        triangle_with(CalibrationParams::default())
    }

    fn engine() -> PositioningEngine {
        PositioningEngine::new(EngineConfig::default(), triangle()).unwrap()
    }

    /// RSSI a node at `node` would see from an entity at `target`.
    fn rssi_for(node: Vector3<f64>, target: Vector3<f64>) -> f64 {
        -30.0 - 20.0 * (node - target).norm().log10()
    }

    fn measurement(node: &str, rssi: f64, ts: f64, seq: u64) -> Measurement {
        Measurement {
            node_id: NodeId::from(node),
            entity_id: EntityId::from("phone"),
            signal: Signal::rssi(rssi),
            timestamp: ts,
            sequence_no: seq,
        }
    }

    fn feed_epoch(engine: &PositioningEngine, target: Vector3<f64>, nodes: &[&str], t: f64, seq: u64) {
        let table = engine.calibration();
        for id in nodes {
            let node = table.get(&NodeId::from(*id)).unwrap();
            engine
                .ingest(&measurement(id, rssi_for(node.position, target), t, seq), t)
                .unwrap();
        }
    }

    #[test]
    fn test_empty_node_table_fails_fast() {
        let err = PositioningEngine::from_file(EngineConfig::default(), NodeTableFile::default());
        assert!(matches!(
            err,
            Err(EngineError::Calibration(CalibrationError::Empty))
        ));
    }

    #[test]
    fn test_end_to_end_triangle() {
        let engine = engine();
        let target = Vector3::new(5.0, 3.0, 0.0);
        feed_epoch(&engine, target, &["a", "b", "c"], 100.0, 1);

        assert!(engine.close_epochs(100.1).is_empty());
        let events = engine.close_epochs(100.3);
        assert_eq!(events.len(), 1);

        let FeedEvent::Position(snapshot) = &events[0] else {
            panic!("expected a position event");
        };
        assert_eq!(snapshot.state, TrackState::Tracking);
        assert!((snapshot.position() - target).norm() < 0.3);
        assert!(snapshot.confidence > 0.7, "confidence {}", snapshot.confidence);

        let stats = engine.stats();
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.solves, 1);
        assert_eq!(stats.tracks_created, 1);
    }

    #[test]
    fn test_two_nodes_keep_track_coasting() {
        let engine = engine();
        let target = Vector3::new(5.0, 3.0, 0.0);
        feed_epoch(&engine, target, &["a", "b", "c"], 100.0, 1);
        engine.close_epochs(100.3);

        feed_epoch(&engine, target, &["a", "b"], 100.5, 2);
        let events = engine.close_epochs(100.8);

        assert_eq!(engine.stats().insufficient_epochs, 1);
        let FeedEvent::Position(snapshot) = &events[0] else {
            panic!("expected a coasting snapshot");
        };
        assert_eq!(snapshot.state, TrackState::Coasting);
        assert_eq!(engine.get_active_tracks(100.8).len(), 1);
    }

    #[test]
    fn test_outlier_epoch_is_gated() {
        let quiet = CalibrationParams {
            shadowing_sigma_db: 0.5,
            ..CalibrationParams::default()
        };
        let engine = PositioningEngine::new(EngineConfig::default(), triangle_with(quiet)).unwrap();
        let target = Vector3::new(5.0, 3.0, 0.0);
        feed_epoch(&engine, target, &["a", "b", "c"], 100.0, 1);
        engine.close_epochs(100.3);
        feed_epoch(&engine, target, &["a", "b", "c"], 100.5, 2);
        engine.close_epochs(100.8);
        let before = engine.get_active_tracks(100.8)[0].clone();

        // Every node suddenly reports a target 50 m away
        feed_epoch(&engine, Vector3::new(55.0, 3.0, 0.0), &["a", "b", "c"], 101.0, 3);
        engine.close_epochs(101.3);
        let after = engine.get_active_tracks(101.3)[0].clone();

        assert_eq!(engine.stats().gating_rejections, 1);
        assert_eq!((before.x, before.y), (after.x, after.y));
        assert_eq!(before.last_update, after.last_update);

        feed_epoch(&engine, target, &["a", "b", "c"], 101.5, 4);
        let events = engine.close_epochs(101.8);
        let FeedEvent::Position(resumed) = &events[0] else {
            panic!("expected a position event");
        };
        assert_eq!(resumed.state, TrackState::Tracking);
    }

    #[test]
    fn test_sweep_expires_idle_track() {
        let engine = engine();
        feed_epoch(&engine, Vector3::new(5.0, 3.0, 0.0), &["a", "b", "c"], 100.0, 1);
        engine.close_epochs(100.3);

        let coasting = engine.sweep(101.0);
        assert!(matches!(&coasting[0], FeedEvent::Position(s) if s.state == TrackState::Coasting));

        let events = engine.sweep(111.0);
        assert!(events.iter().any(|e| matches!(e, FeedEvent::Expired { .. })));
        assert!(engine.get_active_tracks(111.0).is_empty());
        let stats = engine.stats();
        assert_eq!(stats.tracks_expired, 1);
        assert_eq!(stats.tracked_pairs, 0);
    }

    #[test]
    fn test_sweep_prunes_one_shot_entities() {
        let engine = engine();
        for i in 0..500u64 {
            let mut m = measurement("a", -50.0, 100.0, 1);
            m.entity_id = EntityId::from(format!("rand-{i:04x}"));
            engine.ingest(&m, 100.0).unwrap();
        }
        assert_eq!(engine.stats().tracked_pairs, 500);

        engine.sweep(110.0);
        assert_eq!(engine.stats().tracked_pairs, 500);
        engine.sweep(131.0);
        assert_eq!(engine.stats().tracked_pairs, 0);
    }

    #[test]
    fn test_rejections_are_counted() {
        let engine = engine();
        let _ = engine.ingest(&measurement("zz", -50.0, 100.0, 1), 100.0);
        let _ = engine.ingest(&measurement("a", 10.0, 100.0, 1), 100.0);
        let _ = engine.ingest(&measurement("a", -50.0, 100.0, 2), 100.0);
        let _ = engine.ingest(&measurement("a", -50.0, 90.0, 3), 100.0);

        let stats = engine.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected_for(RejectReason::UnknownNode), 1);
        assert_eq!(stats.rejected_for(RejectReason::OutOfRange), 1);
        assert_eq!(stats.rejected_for(RejectReason::Stale), 1);
        assert_eq!(stats.total_rejected(), 3);
    }

    #[test]
    fn test_reload_discards_open_epochs() {
        let engine = engine();
        feed_epoch(&engine, Vector3::new(5.0, 3.0, 0.0), &["a", "b", "c"], 100.0, 1);

        let mut nodes: Vec<Node> = triangle().nodes().cloned().collect();
        nodes[0].position.x = 1.0;
        let generation = engine.reload_calibration(NodeTable::new(nodes, CalibrationParams::default()).unwrap());

        assert_eq!(generation, 1);
        assert!(engine.close_epochs(101.0).is_empty());
        assert_eq!(engine.stats().invalidated_epochs, 1);
        assert_eq!(engine.calibration().get(&NodeId::from("a")).unwrap().position.x, 1.0);
    }

    #[test]
    fn test_expire_entity_on_request() {
        let engine = engine();
        feed_epoch(&engine, Vector3::new(5.0, 3.0, 0.0), &["a", "b", "c"], 100.0, 1);
        engine.close_epochs(100.3);

        let event = engine.expire_entity(&EntityId::from("phone"), 100.4).unwrap();
        assert_eq!(event.entity_id().as_str(), "phone");
        assert_eq!(engine.stats().tracked_pairs, 0);
        assert!(engine.expire_entity(&EntityId::from("phone"), 100.5).is_none());
    }

    #[test]
    fn test_node_status_reports_liveness() {
        let engine = engine();
        feed_epoch(&engine, Vector3::new(5.0, 3.0, 0.0), &["a", "b"], 100.0, 1);
        let status = engine.node_status(101.0);
        assert_eq!(status.iter().filter(|s| s.online).count(), 2);
    }

    #[test]
    fn test_node_report_surfaces_in_status() {
        let engine = engine();
        feed_epoch(&engine, Vector3::new(5.0, 3.0, 0.0), &["a", "b"], 100.0, 1);
        let report = NodeReport {
            packets: 42,
            enabled: false,
            uptime_s: 12.0,
        };
        assert!(engine.report_node(&NodeId::from("b"), report, 100.5));
        assert!(!engine.report_node(&NodeId::from("zz"), report, 100.5));

        let status = engine.node_status(101.0);
        let b = status.iter().find(|s| s.node_id.as_str() == "b").unwrap();
        assert!(!b.online);
        assert_eq!(b.report.map(|r| r.packets), Some(42));
        assert_eq!(status.iter().filter(|s| s.online).count(), 1);
    }

    #[test]
    fn test_engine_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PositioningEngine>();
    }
}
