//! The "TRACKING" Engine - Track Registry
//!
//! Exclusive owner of `entity_id -> Track`. Every filter mutation goes through
//! the registry, and each track sits behind its own mutex so there is a single
//! writer per entity while unrelated entities proceed in parallel.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──first estimate──▶ Tracking ◀──gated update──┐
//!                                     │                       │
//!                        no update within interval            │
//!                                     ▼                       │
//!                                  Coasting ──────────────────┘
//!                                     │
//!                     staleness timeout (from either state)
//!                                     ▼
//!                                  Expired (removed)
//! ```

use crate::calibration::Dimensions;
use crate::confidence::{solved_trace, ConfidenceInputs, ConfidenceScorer};
use crate::filter::{ConstantVelocityFilter, FilterConfig, FilterError, UpdateOutcome};
use crate::types::{PositionEstimate, TrackSnapshot, TrackState};
use nalgebra::{Matrix3, Vector3};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use whofi_env::{EntityId, NodeId};

// ============================================================================
// UPDATE RESULT
// ============================================================================

/// What happened to a track on `update`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateKind {
    /// First estimate for the entity
    Created,
    /// Gated predict-then-update
    Updated,
    /// Innovation covariance degraded and was reset
    CovarianceReset,
    /// Estimate dropped; the filter is untouched
    Rejected(FilterError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackUpdate {
    pub snapshot: TrackSnapshot,
    pub kind: UpdateKind,
}

// ============================================================================
// TRACK
// ============================================================================

/// Per-entity filter state and metadata.
#[derive(Debug, Clone)]
pub struct Track {
    pub entity_id: EntityId,
    /// `None` while uninitialized
    filter: Option<ConstantVelocityFilter>,
    pub state: TrackState,
    /// Engine time of creation
    pub created_at: f64,
    /// Time of the last accepted update
    pub last_update: f64,
    pub confidence: f64,
    pub dimensions: Dimensions,
    pub contributing_nodes: Vec<NodeId>,
    pub low_confidence: bool,
    pub updates: u64,
    pub gating_rejections: u64,
    /// Inputs of the last accepted estimate, rescored while coasting
    last_inputs: Option<ConfidenceInputs>,
}

impl Track {
    fn new(entity_id: EntityId, now: f64) -> Self {
        Self {
            entity_id,
            filter: None,
            state: TrackState::Uninitialized,
            created_at: now,
            last_update: now,
            confidence: 0.0,
            dimensions: Dimensions::Planar,
            contributing_nodes: Vec::new(),
            low_confidence: false,
            updates: 0,
            gating_rejections: 0,
            last_inputs: None,
        }
    }

    pub fn position(&self) -> Option<Vector3<f64>> {
        self.filter.as_ref().map(ConstantVelocityFilter::position)
    }

    pub fn filter(&self) -> Option<&ConstantVelocityFilter> {
        self.filter.as_ref()
    }

    /// Idle for longer than the staleness timeout.
    pub fn is_stale(&self, now: f64, timeout_s: f64) -> bool {
        now - self.last_update > timeout_s
    }

    fn apply(
        &mut self,
        estimate: &PositionEstimate,
        now: f64,
        online_nodes: usize,
        config: &FilterConfig,
        scorer: &ConfidenceScorer,
    ) -> TrackUpdate {
        let r = measurement_covariance(&estimate.covariance, config.min_measurement_variance);

        let kind = match self.filter.as_mut() {
            None => {
                self.filter = Some(ConstantVelocityFilter::new(
                    estimate.position,
                    &r,
                    estimate.timestamp,
                    config,
                ));
                UpdateKind::Created
            }
            Some(filter) => {
                match filter.update(&estimate.position, &r, estimate.timestamp, config.gating_sigma) {
                    Ok(UpdateOutcome::Updated { .. }) => UpdateKind::Updated,
                    Ok(UpdateOutcome::CovarianceReset) => UpdateKind::CovarianceReset,
                    Err(e) => UpdateKind::Rejected(e),
                }
            }
        };

        if let UpdateKind::Rejected(_) = kind {
            // Gated-out estimates leave the filter and the coast timer alone
            self.gating_rejections += 1;
            if self.state == TrackState::Tracking {
                self.state = TrackState::Coasting;
            }
        } else {
            self.state = TrackState::Tracking;
            self.last_update = self.last_update.max(estimate.timestamp);
            self.updates += 1;
            self.dimensions = estimate.dimensions;
            self.contributing_nodes = estimate.contributing_nodes.iter().cloned().collect();
            self.low_confidence = estimate.low_confidence;
            self.last_inputs = Some(ConfidenceInputs {
                residual: estimate.residual,
                contributing_nodes: estimate.contributing_nodes.len(),
                online_nodes,
                position_trace: 0.0,
                low_confidence: estimate.low_confidence,
            });
            if let Some(filter) = &self.filter {
                self.confidence = scorer.score(
                    estimate,
                    &filter.position_covariance(),
                    self.dimensions,
                    online_nodes,
                );
            }
        }

        TrackUpdate {
            snapshot: self.snapshot(now),
            kind,
        }
    }

    /// Predict-only step. Returns whether anything changed.
    fn coast(&mut self, now: f64, force: bool, config: &FilterConfig, scorer: &ConfidenceScorer) -> bool {
        let Some(filter) = self.filter.as_mut() else {
            return false;
        };
        if self.state == TrackState::Expired {
            return false;
        }
        if !force && now - self.last_update <= config.expected_interval_s {
            return false;
        }

        let was_coasting = self.state == TrackState::Coasting;
        let before = filter.time;
        let horizon = now.min(self.last_update + config.coast_period_s());
        filter.predict_to(horizon);
        let advanced = filter.time > before;

        self.state = TrackState::Coasting;
        if advanced {
            self.rescore(scorer);
        }
        advanced || !was_coasting
    }

    fn rescore(&mut self, scorer: &ConfidenceScorer) {
        let (Some(filter), Some(mut inputs)) = (self.filter.as_ref(), self.last_inputs) else {
            return;
        };
        inputs.position_trace = solved_trace(&filter.position_covariance(), self.dimensions);
        self.confidence = scorer.breakdown(&inputs).score;
    }

    /// Published view; tracks without a filter report the origin.
    pub fn snapshot(&self, now: f64) -> TrackSnapshot {
        let (position, velocity, trace, timestamp) = match &self.filter {
            Some(f) => (
                f.position(),
                f.velocity(),
                solved_trace(&f.position_covariance(), self.dimensions),
                f.time,
            ),
            None => (Vector3::zeros(), Vector3::zeros(), f64::INFINITY, self.last_update),
        };

        TrackSnapshot {
            entity_id: self.entity_id.clone(),
            x: position.x,
            y: position.y,
            z: position.z,
            vx: velocity.x,
            vy: velocity.y,
            vz: velocity.z,
            confidence: self.confidence,
            timestamp,
            state: self.state,
            last_update: self.last_update,
            age: (now - self.created_at).max(0.0),
            position_uncertainty: trace,
            contributing_nodes: self.contributing_nodes.clone(),
            low_confidence: self.low_confidence,
        }
    }
}

/// Symmetric measurement covariance with a diagonal floor.
fn measurement_covariance(covariance: &Matrix3<f64>, floor: f64) -> Matrix3<f64> {
    let mut r = (covariance + covariance.transpose()) * 0.5;
    for i in 0..3 {
        r[(i, i)] = r[(i, i)].max(floor);
    }
    r
}

// ============================================================================
// REGISTRY
// ============================================================================

type TrackHandle = Arc<Mutex<Track>>;

pub struct TrackRegistry {
    config: FilterConfig,
    scorer: ConfidenceScorer,
    tracks: RwLock<HashMap<EntityId, TrackHandle>>,
}

impl TrackRegistry {
    pub fn new(config: FilterConfig, scorer: ConfidenceScorer) -> Self {
        Self {
            config,
            scorer,
            tracks: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FilterConfig::default(), ConfidenceScorer::default())
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    fn handle(&self, entity_id: &EntityId) -> Option<TrackHandle> {
        self.tracks.read().get(entity_id).cloned()
    }

    fn handle_or_create(&self, entity_id: &EntityId, now: f64) -> TrackHandle {
        if let Some(handle) = self.handle(entity_id) {
            return handle;
        }
        let mut tracks = self.tracks.write();
        Arc::clone(
            tracks
                .entry(entity_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Track::new(entity_id.clone(), now)))),
        )
    }

    /// Feeds a raw estimate to the entity's track, creating it if needed.
    ///
    /// `online_nodes` is the number of live nodes used for coverage scoring.
    pub fn update(&self, estimate: &PositionEstimate, now: f64, online_nodes: usize) -> TrackUpdate {
        loop {
            let handle = self.handle_or_create(&estimate.entity_id, now);
            let mut track = handle.lock();

            // Lost the race with an expiry sweep; the entry is gone, recreate it
            if track.state == TrackState::Expired {
                continue;
            }

            let update = track.apply(estimate, now, online_nodes, &self.config, &self.scorer);
            match &update.kind {
                UpdateKind::Created => info!(
                    entity = %estimate.entity_id,
                    x = update.snapshot.x,
                    y = update.snapshot.y,
                    "track created"
                ),
                UpdateKind::Rejected(e) => debug!(entity = %estimate.entity_id, error = %e, "estimate gated out"),
                UpdateKind::CovarianceReset => {
                    warn!(entity = %estimate.entity_id, "innovation covariance degraded, reset")
                }
                UpdateKind::Updated => {}
            }
            return update;
        }
    }

    /// Predict-only step for an entity whose epoch produced no solve.
    pub fn coast(&self, entity_id: &EntityId, now: f64) -> Option<TrackSnapshot> {
        let handle = self.handle(entity_id)?;
        let mut track = handle.lock();
        track
            .coast(now, true, &self.config, &self.scorer)
            .then(|| track.snapshot(now))
    }

    /// Moves idle tracks into Coasting and advances their prediction.
    ///
    /// Returns snapshots of the tracks that changed.
    pub fn coast_idle(&self, now: f64) -> Vec<TrackSnapshot> {
        let mut changed: Vec<TrackSnapshot> = self
            .handles()
            .into_iter()
            .filter_map(|(_, handle)| {
                let mut track = handle.lock();
                track
                    .coast(now, false, &self.config, &self.scorer)
                    .then(|| track.snapshot(now))
            })
            .collect();
        changed.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        changed
    }

    /// Evicts every track idle past the staleness timeout.
    pub fn expire_stale(&self, now: f64) -> Vec<EntityId> {
        let mut expired = Vec::new();
        for (entity_id, handle) in self.handles() {
            let mut track = handle.lock();
            if track.state == TrackState::Expired
                || !track.is_stale(now, self.config.staleness_timeout_s)
            {
                continue;
            }
            track.state = TrackState::Expired;
            {
                let mut tracks = self.tracks.write();
                if tracks
                    .get(&entity_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &handle))
                {
                    tracks.remove(&entity_id);
                }
            }
            info!(entity = %entity_id, idle_s = now - track.last_update, "track expired");
            expired.push(entity_id);
        }
        expired.sort();
        expired
    }

    /// Removes a track on request. Returns whether it existed.
    pub fn expire_entity(&self, entity_id: &EntityId) -> bool {
        let Some(handle) = self.tracks.write().remove(entity_id) else {
            return false;
        };
        handle.lock().state = TrackState::Expired;
        info!(entity = %entity_id, "track expired on request");
        true
    }

    /// Snapshots of every initialised track, ordered by entity.
    pub fn get_active(&self, now: f64) -> Vec<TrackSnapshot> {
        let mut active: Vec<TrackSnapshot> = self
            .handles()
            .into_iter()
            .filter_map(|(_, handle)| {
                let track = handle.lock();
                (track.filter.is_some() && track.state != TrackState::Expired)
                    .then(|| track.snapshot(now))
            })
            .collect();
        active.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        active
    }

    /// Last filtered position, used as the solver prior.
    pub fn last_position(&self, entity_id: &EntityId) -> Option<Vector3<f64>> {
        self.handle(entity_id)?.lock().position()
    }

    /// Copy of a track for inspection.
    pub fn get(&self, entity_id: &EntityId) -> Option<Track> {
        Some(self.handle(entity_id)?.lock().clone())
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handles(&self) -> Vec<(EntityId, TrackHandle)> {
        self.tracks
            .read()
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SolveMethod;
    use std::collections::BTreeSet;

    fn estimate(entity: &str, x: f64, y: f64, t: f64) -> PositionEstimate {
        PositionEstimate {
            entity_id: EntityId::from(entity),
            position: Vector3::new(x, y, 0.0),
            covariance: Matrix3::identity() * 0.5,
            residual: 0.01,
            contributing_nodes: ["a", "b", "c"].into_iter().map(NodeId::from).collect::<BTreeSet<_>>(),
            timestamp: t,
            method: SolveMethod::LeastSquares,
            dimensions: Dimensions::Planar,
            low_confidence: false,
            condition_number: 1.0,
        }
    }

    #[test]
    fn test_first_estimate_creates_tracking_track() {
        let registry = TrackRegistry::with_defaults();
        let update = registry.update(&estimate("e", 5.0, 3.0, 1.0), 1.0, 3);

        assert_eq!(update.kind, UpdateKind::Created);
        assert_eq!(update.snapshot.state, TrackState::Tracking);
        assert_eq!((update.snapshot.x, update.snapshot.y), (5.0, 3.0));
        assert_eq!((update.snapshot.vx, update.snapshot.vy), (0.0, 0.0));
        assert!(update.snapshot.confidence > 0.0 && update.snapshot.confidence <= 1.0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_outlier_is_gated_and_tracking_resumes() {
        let registry = TrackRegistry::with_defaults();
        registry.update(&estimate("e", 5.0, 3.0, 1.0), 1.0, 3);
        registry.update(&estimate("e", 5.1, 3.0, 1.5), 1.5, 3);
        let before = registry.get(&EntityId::from("e")).unwrap();

        let outlier = registry.update(&estimate("e", 55.0, 3.0, 2.0), 2.0, 3);
        assert!(matches!(outlier.kind, UpdateKind::Rejected(FilterError::GatingRejected { .. })));
        assert_eq!(outlier.snapshot.state, TrackState::Coasting);

        let after = registry.get(&EntityId::from("e")).unwrap();
        let (fb, fa) = (before.filter().unwrap(), after.filter().unwrap());
        assert_eq!(fb.state, fa.state);
        assert_eq!(fb.covariance, fa.covariance);
        assert_eq!(before.last_update, after.last_update);
        assert_eq!(after.gating_rejections, 1);

        let resumed = registry.update(&estimate("e", 5.15, 3.0, 2.5), 2.5, 3);
        assert_eq!(resumed.kind, UpdateKind::Updated);
        assert_eq!(resumed.snapshot.state, TrackState::Tracking);
    }

    #[test]
    fn test_coast_grows_uncertainty_within_coast_period() {
        let registry = TrackRegistry::with_defaults();
        let created = registry.update(&estimate("e", 5.0, 3.0, 1.0), 1.0, 3);
        let id = EntityId::from("e");

        // Within the expected interval nothing happens
        assert!(registry.coast_idle(1.3).is_empty());

        let coasted = registry.coast(&id, 2.0).unwrap();
        assert_eq!(coasted.state, TrackState::Coasting);
        assert!(coasted.position_uncertainty > created.snapshot.position_uncertainty);
        assert!(coasted.confidence < created.snapshot.confidence);

        // Prediction stops at last_update + 3 × 0.5 s
        let late = registry.coast(&id, 5.0).unwrap();
        assert_eq!(late.timestamp, 2.5);
        assert!(registry.coast(&id, 6.0).is_none());
    }

    #[test]
    fn test_idle_track_expires_after_timeout() {
        let registry = TrackRegistry::with_defaults();
        registry.update(&estimate("e", 5.0, 3.0, 1.0), 1.0, 3);

        assert!(registry.expire_stale(10.0).is_empty());
        assert_eq!(registry.expire_stale(11.5), vec![EntityId::from("e")]);
        assert!(registry.get_active(11.5).is_empty());
        assert!(registry.last_position(&EntityId::from("e")).is_none());
    }

    #[test]
    fn test_update_after_expiry_recreates_track() {
        let registry = TrackRegistry::with_defaults();
        registry.update(&estimate("e", 5.0, 3.0, 1.0), 1.0, 3);
        assert!(registry.expire_entity(&EntityId::from("e")));
        assert!(!registry.expire_entity(&EntityId::from("e")));

        let update = registry.update(&estimate("e", 1.0, 1.0, 2.0), 2.0, 3);
        assert_eq!(update.kind, UpdateKind::Created);
    }

    #[test]
    fn test_concurrent_updates_and_sweeps() {
        let registry = Arc::new(TrackRegistry::with_defaults());
        let workers: Vec<_> = (0..4)
            .map(|w| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let t = i as f64 * 0.1;
                        let entity = format!("e{}", i % 5);
                        if w == 0 {
                            registry.expire_stale(t + 20.0);
                        } else {
                            registry.update(&estimate(&entity, 5.0, 3.0, t), t, 3);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(registry.len() <= 5);
    }
}
