//! Epoch aggregation.
//!
//! Ranges for an entity accumulate in an epoch that opens with the first
//! accepted measurement and is closed by the periodic tick once its window has
//! elapsed. Repeated samples from one node inside an epoch are fused by
//! inverse-variance weighting over the most recent few.

use crate::types::RangeEstimate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use whofi_env::{EntityId, NodeId};

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochConfig {
    /// Aggregation window (s)
    pub window_s: f64,

    /// Samples kept per node; older ones are discarded
    pub max_samples_per_node: usize,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            window_s: 0.3,
            max_samples_per_node: 10,
        }
    }
}

/// Ranges collected for one entity.
#[derive(Debug, Clone)]
pub struct Epoch {
    pub entity_id: EntityId,
    /// Engine time the epoch opened at
    pub opened_at: f64,
    /// Calibration generation the ranges were computed under
    pub generation: u64,
    samples: BTreeMap<NodeId, VecDeque<RangeEstimate>>,
}

impl Epoch {
    fn new(entity_id: EntityId, opened_at: f64, generation: u64) -> Self {
        Self {
            entity_id,
            opened_at,
            generation,
            samples: BTreeMap::new(),
        }
    }

    fn push(&mut self, range: RangeEstimate, max_samples: usize) {
        let queue = self.samples.entry(range.node_id.clone()).or_default();
        queue.push_back(range);
        while queue.len() > max_samples.max(1) {
            queue.pop_front();
        }
    }

    pub fn is_due(&self, now: f64, window_s: f64) -> bool {
        now - self.opened_at >= window_s
    }

    /// Number of distinct reporting nodes.
    pub fn node_count(&self) -> usize {
        self.samples.len()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.values().map(VecDeque::len).sum()
    }

    /// Latest sample time in the epoch.
    pub fn latest_timestamp(&self) -> f64 {
        self.samples
            .values()
            .flatten()
            .map(|r| r.timestamp)
            .fold(self.opened_at, f64::max)
    }

    /// One range per node, inverse-variance weighted.
    pub fn fused_ranges(&self) -> Vec<RangeEstimate> {
        self.samples
            .values()
            .filter_map(|queue| fuse(queue.iter()))
            .collect()
    }
}

/// Inverse-variance fusion of ranges for a single node.
pub fn fuse<'a>(ranges: impl Iterator<Item = &'a RangeEstimate>) -> Option<RangeEstimate> {
    let mut info = 0.0;
    let mut weighted = 0.0;
    let mut latest: Option<&RangeEstimate> = None;

    for r in ranges {
        let w = 1.0 / r.variance.max(f64::EPSILON);
        info += w;
        weighted += w * r.distance_m;
        if latest.map_or(true, |l| r.timestamp >= l.timestamp) {
            latest = Some(r);
        }
    }

    latest.map(|l| RangeEstimate {
        node_id: l.node_id.clone(),
        entity_id: l.entity_id.clone(),
        distance_m: weighted / info,
        variance: 1.0 / info,
        timestamp: l.timestamp,
    })
}

/// Open epochs for every entity, sharded by entity.
pub struct EpochBuffer {
    config: EpochConfig,
    shards: Vec<Mutex<HashMap<EntityId, Epoch>>>,
}

impl EpochBuffer {
    pub fn new(config: EpochConfig) -> Self {
        Self {
            config,
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn config(&self) -> &EpochConfig {
        &self.config
    }

    /// Adds a range to the entity's open epoch, opening one if needed.
    ///
    /// An epoch opened under an older calibration generation is replaced.
    /// Returns `true` when the range opened a new epoch.
    pub fn push(&self, range: RangeEstimate, now: f64, generation: u64) -> bool {
        let mut shard = self.shard(&range.entity_id).lock();
        let mut opened = false;
        let epoch = shard.entry(range.entity_id.clone()).or_insert_with(|| {
            opened = true;
            Epoch::new(range.entity_id.clone(), now, generation)
        });
        if epoch.generation != generation {
            *epoch = Epoch::new(range.entity_id.clone(), now, generation);
            opened = true;
        }
        epoch.push(range, self.config.max_samples_per_node);
        opened
    }

    /// Removes and returns every epoch whose window has elapsed.
    pub fn take_due(&self, now: f64) -> Vec<Epoch> {
        let mut due = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            let ids: Vec<EntityId> = shard
                .iter()
                .filter(|(_, e)| e.is_due(now, self.config.window_s))
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                if let Some(epoch) = shard.remove(&id) {
                    due.push(epoch);
                }
            }
        }
        due.sort_by(|a, b| a.opened_at.total_cmp(&b.opened_at));
        due
    }

    /// Drops the open epoch of one entity.
    pub fn discard(&self, entity_id: &EntityId) -> bool {
        self.shard(entity_id).lock().remove(entity_id).is_some()
    }

    /// Drops every open epoch, returning how many were discarded.
    pub fn clear(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                let mut s = s.lock();
                let n = s.len();
                s.clear();
                n
            })
            .sum()
    }

    pub fn open_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    fn shard(&self, entity_id: &EntityId) -> &Mutex<HashMap<EntityId, Epoch>> {
        let mut hasher = DefaultHasher::new();
        entity_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn range(node: &str, entity: &str, d: f64, var: f64, ts: f64) -> RangeEstimate {
        RangeEstimate {
            node_id: NodeId::from(node),
            entity_id: EntityId::from(entity),
            distance_m: d,
            variance: var,
            timestamp: ts,
        }
    }

    #[test]
    fn test_inverse_variance_fusion() {
        let samples = [range("a", "e", 4.0, 1.0, 1.0), range("a", "e", 6.0, 3.0, 1.1)];
        let fused = fuse(samples.iter()).unwrap();
        // weights 1 and 1/3
        assert_relative_eq!(fused.distance_m, 4.5, epsilon = 1e-12);
        assert_relative_eq!(fused.variance, 0.75, epsilon = 1e-12);
        assert_relative_eq!(fused.timestamp, 1.1);
    }

    #[test]
    fn test_epoch_caps_samples_per_node() {
        let buffer = EpochBuffer::new(EpochConfig {
            window_s: 0.3,
            max_samples_per_node: 2,
        });
        for i in 0..5 {
            buffer.push(range("a", "e", i as f64, 1.0, i as f64), 0.0, 0);
        }
        let epochs = buffer.take_due(1.0);
        assert_eq!(epochs.len(), 1);
        assert_eq!(epochs[0].sample_count(), 2);
        assert_relative_eq!(epochs[0].fused_ranges()[0].distance_m, 3.5);
    }

    #[test]
    fn test_epoch_closes_after_window() {
        let buffer = EpochBuffer::new(EpochConfig::default());
        assert!(buffer.push(range("a", "e1", 5.0, 1.0, 10.0), 10.0, 0));
        assert!(!buffer.push(range("b", "e1", 5.0, 1.0, 10.1), 10.1, 0));
        buffer.push(range("a", "e2", 5.0, 1.0, 10.2), 10.2, 0);

        assert!(buffer.take_due(10.2).is_empty());

        let due = buffer.take_due(10.35);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].entity_id.as_str(), "e1");
        assert_eq!(due[0].node_count(), 2);
        assert_eq!(buffer.open_count(), 1);
    }

    #[test]
    fn test_generation_change_restarts_epoch() {
        let buffer = EpochBuffer::new(EpochConfig::default());
        buffer.push(range("a", "e", 5.0, 1.0, 10.0), 10.0, 0);
        buffer.push(range("b", "e", 5.0, 1.0, 10.1), 10.1, 1);

        let due = buffer.take_due(11.0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].generation, 1);
        assert_eq!(due[0].node_count(), 1);
    }
}
