//! Measurement Ingestor
//!
//! Validates incoming per-node samples before they reach the distance
//! estimator. Ordering state is kept per `(node, entity)` pair in sharded
//! maps so that unrelated entities never contend on the same lock.

use crate::calibration::{Node, NodeTable};
use crate::estimator::EstimateError;
use crate::types::{Measurement, RangeEstimate};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use whofi_env::{EntityId, NodeId};

const SHARD_COUNT: usize = 16;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// How far a sample may lag the newest accepted sample of its pair (s)
    pub stale_tolerance_s: f64,

    /// How far a sample may lead the engine clock (s)
    pub future_tolerance_s: f64,

    /// Plausible RSSI bounds (dBm)
    pub rssi_min_dbm: f64,
    pub rssi_max_dbm: f64,

    /// A node is online if it delivered an accepted sample this recently (s)
    pub online_window_s: f64,

    /// Ordering state of a pair silent for longer than this is dropped (s)
    pub pair_retention_s: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            stale_tolerance_s: 2.0,
            future_tolerance_s: 1.0,
            rssi_min_dbm: -100.0,
            rssi_max_dbm: 0.0,
            online_window_s: 5.0,
            pair_retention_s: 30.0,
        }
    }
}

// ============================================================================
// REJECTIONS
// ============================================================================

/// Why a measurement was dropped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejected {
    #[error("stale measurement: {timestamp:.3} is {lag_s:.3}s behind the last accepted sample")]
    StaleMeasurement { timestamp: f64, lag_s: f64 },

    #[error("RSSI {0} dBm out of range")]
    OutOfRange(f64),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("timestamp {timestamp:.3} is {lead_s:.3}s in the future")]
    FutureTimestamp { timestamp: f64, lead_s: f64 },

    #[error("malformed measurement: {0}")]
    Malformed(&'static str),

    #[error("duplicate sequence number {0}")]
    DuplicateSequence(u64),

    #[error("estimation failed: {0}")]
    EstimationFailed(#[from] EstimateError),
}

impl Rejected {
    pub fn reason(&self) -> RejectReason {
        match self {
            Rejected::StaleMeasurement { .. } => RejectReason::Stale,
            Rejected::OutOfRange(_) => RejectReason::OutOfRange,
            Rejected::UnknownNode(_) => RejectReason::UnknownNode,
            Rejected::FutureTimestamp { .. } => RejectReason::FutureTimestamp,
            Rejected::Malformed(_) => RejectReason::Malformed,
            Rejected::DuplicateSequence(_) => RejectReason::DuplicateSequence,
            Rejected::EstimationFailed(_) => RejectReason::EstimationFailed,
        }
    }
}

/// Fieldless rejection kind, used as a counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Stale,
    OutOfRange,
    UnknownNode,
    FutureTimestamp,
    Malformed,
    DuplicateSequence,
    EstimationFailed,
}

impl RejectReason {
    pub const ALL: [RejectReason; 7] = [
        RejectReason::Stale,
        RejectReason::OutOfRange,
        RejectReason::UnknownNode,
        RejectReason::FutureTimestamp,
        RejectReason::Malformed,
        RejectReason::DuplicateSequence,
        RejectReason::EstimationFailed,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Stale => "stale",
            RejectReason::OutOfRange => "out_of_range",
            RejectReason::UnknownNode => "unknown_node",
            RejectReason::FutureTimestamp => "future_timestamp",
            RejectReason::Malformed => "malformed",
            RejectReason::DuplicateSequence => "duplicate_sequence",
            RejectReason::EstimationFailed => "estimation_failed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// NODE STATUS
// ============================================================================

/// Health a node reports about itself on its stats channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Packets captured since boot
    pub packets: u64,
    /// Whether capture is switched on
    pub enabled: bool,
    pub uptime_s: f64,
}

/// Liveness and counters for one calibrated node.
///
/// A node is online while it delivers accepted samples, unless its last
/// report says capture is disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub position: [f64; 3],
    pub last_seen: Option<f64>,
    pub online: bool,
    pub accepted: u64,
    pub rejected: u64,
    pub report: Option<NodeReport>,
    pub reported_at: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct NodeActivity {
    last_seen: Option<f64>,
    accepted: u64,
    rejected: u64,
    report: Option<(NodeReport, f64)>,
}

#[derive(Debug, Clone, Copy)]
struct PairState {
    last_timestamp: f64,
    last_sequence: u64,
}

type PairKey = (NodeId, EntityId);

// ============================================================================
// INGESTOR
// ============================================================================

pub struct MeasurementIngestor {
    config: IngestConfig,
    pairs: Vec<Mutex<HashMap<PairKey, PairState>>>,
    activity: RwLock<HashMap<NodeId, NodeActivity>>,
}

impl MeasurementIngestor {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            pairs: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            activity: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(IngestConfig::default())
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Validates a measurement and converts it to a range.
    ///
    /// The `estimate` closure runs while the pair's shard is locked, so a
    /// measurement only advances the pair's ordering state once it produced a
    /// range.
    pub fn admit<F>(
        &self,
        measurement: &Measurement,
        now: f64,
        table: &NodeTable,
        estimate: F,
    ) -> Result<RangeEstimate, Rejected>
    where
        F: FnOnce(&Measurement, &Node) -> Result<RangeEstimate, EstimateError>,
    {
        let result = self.admit_inner(measurement, now, table, estimate);
        if table.contains(&measurement.node_id) {
            self.record(&measurement.node_id, &result, measurement.timestamp);
        }
        result
    }

    fn admit_inner<F>(
        &self,
        measurement: &Measurement,
        now: f64,
        table: &NodeTable,
        estimate: F,
    ) -> Result<RangeEstimate, Rejected>
    where
        F: FnOnce(&Measurement, &Node) -> Result<RangeEstimate, EstimateError>,
    {
        self.check_payload(measurement)?;

        let node = table
            .get(&measurement.node_id)
            .ok_or_else(|| Rejected::UnknownNode(measurement.node_id.clone()))?;

        if let Some(rssi) = measurement.signal.rssi_dbm {
            if rssi < self.config.rssi_min_dbm || rssi > self.config.rssi_max_dbm {
                return Err(Rejected::OutOfRange(rssi));
            }
        }

        let lead = measurement.timestamp - now;
        if lead > self.config.future_tolerance_s {
            return Err(Rejected::FutureTimestamp {
                timestamp: measurement.timestamp,
                lead_s: lead,
            });
        }

        let key = (measurement.node_id.clone(), measurement.entity_id.clone());
        let mut shard = self.pairs[shard_index(&key)].lock();

        if let Some(prev) = shard.get(&key) {
            let lag = prev.last_timestamp - measurement.timestamp;
            if lag > self.config.stale_tolerance_s {
                return Err(Rejected::StaleMeasurement {
                    timestamp: measurement.timestamp,
                    lag_s: lag,
                });
            }
            if prev.last_sequence == measurement.sequence_no {
                return Err(Rejected::DuplicateSequence(measurement.sequence_no));
            }
        }

        let range = estimate(measurement, node)?;

        let entry = shard.entry(key).or_insert(PairState {
            last_timestamp: measurement.timestamp,
            last_sequence: measurement.sequence_no,
        });
        entry.last_timestamp = entry.last_timestamp.max(measurement.timestamp);
        entry.last_sequence = measurement.sequence_no;

        Ok(range)
    }

    fn check_payload(&self, measurement: &Measurement) -> Result<(), Rejected> {
        let signal = &measurement.signal;
        if signal.is_empty() {
            return Err(Rejected::Malformed("no signal payload"));
        }
        if !measurement.timestamp.is_finite() {
            return Err(Rejected::Malformed("non-finite timestamp"));
        }
        if let Some(rssi) = signal.rssi_dbm {
            if !rssi.is_finite() {
                return Err(Rejected::Malformed("non-finite RSSI"));
            }
        }
        if let Some(csi) = &signal.csi {
            if csi.is_empty() {
                return Err(Rejected::Malformed("empty channel feature vector"));
            }
            if csi.iter().any(|v| !v.is_finite()) {
                return Err(Rejected::Malformed("non-finite channel feature"));
            }
        }
        Ok(())
    }

    fn record(&self, node_id: &NodeId, result: &Result<RangeEstimate, Rejected>, timestamp: f64) {
        let mut activity = self.activity.write();
        let entry = activity.entry(node_id.clone()).or_default();
        match result {
            Ok(_) => {
                entry.accepted += 1;
                entry.last_seen = Some(entry.last_seen.map_or(timestamp, |t| t.max(timestamp)));
            }
            Err(_) => entry.rejected += 1,
        }
    }

    /// Liveness of every node in `table` as of `now`.
    pub fn node_status(&self, table: &NodeTable, now: f64) -> Vec<NodeStatus> {
        let activity = self.activity.read();
        table
            .nodes()
            .map(|node| {
                let a = activity.get(&node.id).copied().unwrap_or_default();
                NodeStatus {
                    node_id: node.id.clone(),
                    position: [node.position.x, node.position.y, node.position.z],
                    last_seen: a.last_seen,
                    online: self.is_online(&a, now),
                    accepted: a.accepted,
                    rejected: a.rejected,
                    report: a.report.map(|(report, _)| report),
                    reported_at: a.report.map(|(_, at)| at),
                }
            })
            .collect()
    }

    /// Number of calibrated nodes currently online.
    pub fn online_count(&self, table: &NodeTable, now: f64) -> usize {
        let activity = self.activity.read();
        table
            .nodes()
            .filter(|node| activity.get(&node.id).is_some_and(|a| self.is_online(a, now)))
            .count()
    }

    fn is_online(&self, activity: &NodeActivity, now: f64) -> bool {
        let enabled = activity.report.map_or(true, |(report, _)| report.enabled);
        enabled && activity.last_seen.is_some_and(|t| now - t <= self.config.online_window_s)
    }

    /// Records a node's self-reported health. Returns `false` for nodes
    /// missing from `table`.
    pub fn report_node(&self, node_id: &NodeId, report: NodeReport, now: f64, table: &NodeTable) -> bool {
        if !table.contains(node_id) {
            return false;
        }
        self.activity.write().entry(node_id.clone()).or_default().report = Some((report, now));
        true
    }

    /// Drops activity and pair state for nodes no longer present in `table`.
    pub fn retain_nodes(&self, table: &NodeTable) {
        self.activity.write().retain(|id, _| table.contains(id));
        for shard in &self.pairs {
            shard.lock().retain(|(node_id, _), _| table.contains(node_id));
        }
    }

    /// Drops every pair held for `entity_id`. Returns how many were removed.
    pub fn forget_entity(&self, entity_id: &EntityId) -> usize {
        self.pairs
            .iter()
            .map(|shard| {
                let mut shard = shard.lock();
                let before = shard.len();
                shard.retain(|(_, e), _| e != entity_id);
                before - shard.len()
            })
            .sum()
    }

    /// Drops pairs whose newest sample is older than `pair_retention_s`.
    pub fn prune_idle(&self, now: f64) -> usize {
        let horizon = now - self.config.pair_retention_s;
        self.pairs
            .iter()
            .map(|shard| {
                let mut shard = shard.lock();
                let before = shard.len();
                shard.retain(|_, state| state.last_timestamp >= horizon);
                before - shard.len()
            })
            .sum()
    }

    /// Number of `(node, entity)` pairs with ordering state.
    pub fn pair_count(&self) -> usize {
        self.pairs.iter().map(|shard| shard.lock().len()).sum()
    }
}

fn shard_index(key: &PairKey) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationParams;
    use crate::types::Signal;
    use proptest::prelude::*;

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

    fn sample(node: &str, ts: f64, seq: u64) -> Measurement {
        Measurement {
            node_id: NodeId::from(node),
            entity_id: EntityId::from("phone"),
            signal: Signal::rssi(-50.0),
            timestamp: ts,
            sequence_no: seq,
        }
    }

    fn unit_range(m: &Measurement, _node: &Node) -> Result<RangeEstimate, EstimateError> {
        Ok(RangeEstimate {
            node_id: m.node_id.clone(),
            entity_id: m.entity_id.clone(),
            distance_m: 1.0,
            variance: 1.0,
            timestamp: m.timestamp,
        })
    }

    #[test]
    fn test_accepts_valid_measurement() {
        let ingestor = MeasurementIngestor::with_defaults();
        let table = table();
        let range = ingestor
            .admit(&sample("a", 100.0, 1), 100.0, &table, unit_range)
            .unwrap();
        assert_eq!(range.node_id.as_str(), "a");
    }

    #[test]
    fn test_rejection_reasons() {
        let ingestor = MeasurementIngestor::with_defaults();
        let table = table();

        let unknown = sample("zz", 100.0, 1);
        assert_eq!(
            ingestor.admit(&unknown, 100.0, &table, unit_range).unwrap_err().reason(),
            RejectReason::UnknownNode
        );

        let mut loud = sample("a", 100.0, 1);
        loud.signal = Signal::rssi(5.0);
        assert_eq!(
            ingestor.admit(&loud, 100.0, &table, unit_range).unwrap_err().reason(),
            RejectReason::OutOfRange
        );

        let future = sample("a", 105.0, 1);
        assert_eq!(
            ingestor.admit(&future, 100.0, &table, unit_range).unwrap_err().reason(),
            RejectReason::FutureTimestamp
        );

        let mut empty = sample("a", 100.0, 1);
        empty.signal = Signal::default();
        assert_eq!(
            ingestor.admit(&empty, 100.0, &table, unit_range).unwrap_err().reason(),
            RejectReason::Malformed
        );

        let mut no_csi = sample("a", 100.0, 1);
        no_csi.signal = Signal::csi(vec![]);
        assert_eq!(
            ingestor.admit(&no_csi, 100.0, &table, unit_range).unwrap_err().reason(),
            RejectReason::Malformed
        );
    }

    #[test]
    fn test_stale_and_duplicate_rejection() {
        let ingestor = MeasurementIngestor::with_defaults();
        let table = table();

        ingestor.admit(&sample("a", 100.0, 10), 100.0, &table, unit_range).unwrap();

        // Slightly out of order but within tolerance
        ingestor.admit(&sample("a", 99.0, 11), 100.0, &table, unit_range).unwrap();

        let stale = ingestor.admit(&sample("a", 97.5, 12), 100.0, &table, unit_range);
        assert_eq!(stale.unwrap_err().reason(), RejectReason::Stale);

        let dup = ingestor.admit(&sample("a", 100.1, 11), 100.1, &table, unit_range);
        assert_eq!(dup.unwrap_err().reason(), RejectReason::DuplicateSequence);

        // Another node for the same entity has independent ordering
        ingestor.admit(&sample("b", 97.5, 12), 100.0, &table, unit_range).unwrap();
    }

    #[test]
    fn test_failed_estimate_does_not_advance_pair() {
        let ingestor = MeasurementIngestor::with_defaults();
        let table = table();

        let err = ingestor
            .admit(&sample("a", 100.0, 1), 100.0, &table, |_, _| {
                Err(EstimateError::MissingRssi)
            })
            .unwrap_err();
        assert_eq!(err.reason(), RejectReason::EstimationFailed);

        // Same sequence number is not a duplicate because nothing was accepted
        ingestor.admit(&sample("a", 100.0, 1), 100.0, &table, unit_range).unwrap();
    }

    #[test]
    fn test_pair_state_is_bounded_by_retention() {
        let ingestor = MeasurementIngestor::with_defaults();
        let table = table();
        for i in 0..1_000u64 {
            let mut m = sample("a", 100.0, i);
            m.entity_id = EntityId::from(format!("mac-{i}"));
            ingestor.admit(&m, 100.0, &table, unit_range).unwrap();
        }
        assert_eq!(ingestor.pair_count(), 1_000);

        assert_eq!(ingestor.prune_idle(120.0), 0);
        ingestor.admit(&sample("b", 125.0, 1), 125.0, &table, unit_range).unwrap();
        assert_eq!(ingestor.prune_idle(131.0), 1_000);
        assert_eq!(ingestor.pair_count(), 1);
    }

    #[test]
    fn test_forget_entity_drops_all_its_pairs() {
        let ingestor = MeasurementIngestor::with_defaults();
        let table = table();
        for node in ["a", "b", "c"] {
            ingestor.admit(&sample(node, 100.0, 1), 100.0, &table, unit_range).unwrap();
        }
        let mut other = sample("a", 100.0, 1);
        other.entity_id = EntityId::from("watch");
        ingestor.admit(&other, 100.0, &table, unit_range).unwrap();

        assert_eq!(ingestor.forget_entity(&EntityId::from("phone")), 3);
        assert_eq!(ingestor.pair_count(), 1);

        // A forgotten pair starts over, so an older sample is admitted again
        assert!(ingestor.admit(&sample("a", 95.0, 1), 100.0, &table, unit_range).is_ok());
    }

    #[test]
    fn test_retain_nodes_drops_removed_node_pairs() {
        let ingestor = MeasurementIngestor::with_defaults();
        let table = table();
        ingestor.admit(&sample("a", 100.0, 1), 100.0, &table, unit_range).unwrap();
        ingestor.admit(&sample("c", 100.0, 1), 100.0, &table, unit_range).unwrap();

        let reduced = NodeTable::new(
            vec![Node::new("a", 0.0, 0.0), Node::new("b", 10.0, 0.0), Node::new("d", 5.0, 5.0)],
            CalibrationParams::default(),
        )
        .unwrap();
        ingestor.retain_nodes(&reduced);
        assert_eq!(ingestor.pair_count(), 1);
    }

    #[test]
    fn test_node_status_tracks_liveness() {
        let ingestor = MeasurementIngestor::with_defaults();
        let table = table();
        ingestor.admit(&sample("a", 100.0, 1), 100.0, &table, unit_range).unwrap();
        let mut loud = sample("b", 100.0, 1);
        loud.signal = Signal::rssi(3.0);
        let _ = ingestor.admit(&loud, 100.0, &table, unit_range);

        let status = ingestor.node_status(&table, 102.0);
        let a = status.iter().find(|s| s.node_id.as_str() == "a").unwrap();
        let b = status.iter().find(|s| s.node_id.as_str() == "b").unwrap();
        assert!(a.online);
        assert_eq!(a.accepted, 1);
        assert!(!b.online);
        assert_eq!(b.rejected, 1);

        assert_eq!(ingestor.online_count(&table, 102.0), 1);
        assert_eq!(ingestor.online_count(&table, 200.0), 0);
    }

    #[test]
    fn test_disabled_report_takes_node_offline() {
        let ingestor = MeasurementIngestor::with_defaults();
        let table = table();
        ingestor.admit(&sample("a", 100.0, 1), 100.0, &table, unit_range).unwrap();

        let report = NodeReport {
            packets: 1200,
            enabled: true,
            uptime_s: 3600.0,
        };
        assert!(ingestor.report_node(&NodeId::from("a"), report, 101.0, &table));
        let status = ingestor.node_status(&table, 101.0);
        let a = status.iter().find(|s| s.node_id.as_str() == "a").unwrap();
        assert!(a.online);
        assert_eq!(a.report, Some(report));
        assert_eq!(a.reported_at, Some(101.0));

        let disabled = NodeReport { enabled: false, ..report };
        ingestor.report_node(&NodeId::from("a"), disabled, 102.0, &table);
        assert_eq!(ingestor.online_count(&table, 102.0), 0);

        assert!(!ingestor.report_node(&NodeId::from("zz"), report, 102.0, &table));
    }

    proptest! {
        #[test]
        fn prop_stale_rejection_is_monotonic(
            first in 1000.0f64..2000.0,
            lag in 2.01f64..500.0,
        ) {
            let ingestor = MeasurementIngestor::with_defaults();
            let table = table();
            ingestor.admit(&sample("c", first, 1), first, &table, unit_range).unwrap();
            let result = ingestor.admit(&sample("c", first - lag, 2), first, &table, unit_range);
            prop_assert_eq!(result.unwrap_err().reason(), RejectReason::Stale);
        }
    }
}
