//! Scenario runner - executes the deterministic end-to-end scenarios.

use crate::agent::{planar_error, SimulatedAgent};
use crate::context::SimContext;
use crate::exporter::{EntityPosition, SimEvent, SimExport, SimFrame, TrackPosition};
use crate::oracle::{Oracle, RadioModel};
use crate::scenarios::ScenarioId;

use nalgebra::Vector3;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use whofi_core::{
    AgentConfig, CalibrationParams, EngineConfig, EngineError, FeedEvent, Measurement, Node, NodeTable,
    PositioningEngine, RejectReason, TrackState,
};
use whofi_env::{EntityId, NodeId};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    pub total_ticks: u64,
    pub final_time_secs: f64,

    /// Active tracks at the end of the run
    pub final_track_count: usize,

    pub failure_reason: Option<String>,
    pub metrics: ScenarioMetrics,

    /// Frame-by-frame capture, when requested
    pub export: Option<SimExport>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    pub measurements_sent: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub stale_rejections: u64,
    pub duplicate_rejections: u64,
    pub position_events: u64,
    pub expired_events: u64,
    pub solves: u64,
    pub gating_rejections: u64,
    pub low_confidence_solves: u64,
    pub insufficient_epochs: u64,
    pub fallback_solves: u64,

    /// RMS planar error over samples taken after warm-up (m)
    pub rms_error_m: f64,
    pub max_error_m: f64,
    pub mean_confidence: f64,
}

// ============================================================================
// HARNESS
// ============================================================================

/// Seconds excluded from error statistics while tracks converge.
const WARMUP_S: f64 = 2.0;

/// Ticks between exported frames.
const EXPORT_EVERY: u64 = 5;

/// One oracle, one engine and one virtual clock stepping together.
struct Harness {
    scenario: ScenarioId,
    seed: u64,
    context: Arc<SimContext>,
    oracle: Oracle,
    agent: SimulatedAgent,
    params: CalibrationParams,
    dt: f64,
    ticks: u64,
    sent: u64,
    errors: Vec<f64>,
    confidences: Vec<f64>,
    export: Option<SimExport>,
    pending_events: Vec<SimEvent>,
}

impl Harness {
    fn time(&self) -> f64 {
        self.oracle.time()
    }

    fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(scenario = %self.scenario, t = self.time(), "{}", message);
        if self.export.is_some() {
            self.pending_events.push(SimEvent::info(message));
        }
    }

    /// Moves the world forward one step and ingests its observations.
    fn advance(&mut self) -> Vec<Measurement> {
        self.context.advance_time(Duration::from_secs_f64(self.dt));
        self.oracle.step(self.dt);
        let readings = self.oracle.generate_measurements(self.agent.time_secs());
        self.ingest(&readings);
        readings
    }

    fn ingest(&mut self, readings: &[Measurement]) -> usize {
        self.sent += readings.len() as u64;
        self.agent.ingest_readings(readings)
    }

    /// Ticks the agent and records error samples.
    fn finish_step(&mut self) {
        if let Err(e) = self.agent.tick() {
            warn!(scenario = %self.scenario, error = %e, "agent tick failed");
        }
        self.ticks += 1;
        self.sample();

        if self.ticks % 10 == 0 {
            debug!(
                "  t={:.1}s | entities={} | tracks={}",
                self.time(),
                self.oracle.active_entities().len(),
                self.agent.track_count()
            );
        }
    }

    fn step(&mut self) {
        self.advance();
        self.finish_step();
    }

    fn run_for(&mut self, secs: f64) {
        let steps = (secs / self.dt).round().max(0.0) as u64;
        for _ in 0..steps {
            self.step();
        }
    }

    fn sample(&mut self) {
        let tracks = self.agent.active_tracks();
        let truth = self.oracle.ground_truth_positions();

        if self.time() >= WARMUP_S {
            for (id, position) in &truth {
                if let Some(track) = tracks.iter().find(|t| &t.entity_id == id) {
                    self.errors.push(planar_error(&track.position(), position));
                    self.confidences.push(track.confidence);
                }
            }
        }

        if self.export.is_some() && self.ticks % EXPORT_EVERY == 0 {
            let frame = SimFrame {
                time_sec: self.time(),
                ground_truth: truth
                    .iter()
                    .map(|(id, p)| EntityPosition::new(id.clone(), *p))
                    .collect(),
                tracks: tracks.iter().map(TrackPosition::from).collect(),
                rms_error: Some(self.agent.compute_position_error(&truth)),
                events: std::mem::take(&mut self.pending_events),
            };
            if let Some(export) = self.export.as_mut() {
                export.add_frame(frame);
            }
        }
    }

    fn final_error(&self) -> f64 {
        self.agent.compute_position_error(&self.oracle.ground_truth_positions())
    }

    fn track_state(&self, id: &EntityId) -> Option<TrackState> {
        self.agent
            .active_tracks()
            .into_iter()
            .find(|t| &t.entity_id == id)
            .map(|t| t.state)
    }

    fn finish(mut self, check: Result<(), String>) -> ScenarioResult {
        let stats = self.agent.stats();
        let events = self.agent.sink().events();

        let rms = if self.errors.is_empty() {
            0.0
        } else {
            (self.errors.iter().map(|e| e * e).sum::<f64>() / self.errors.len() as f64).sqrt()
        };
        let mean_confidence = if self.confidences.is_empty() {
            0.0
        } else {
            self.confidences.iter().sum::<f64>() / self.confidences.len() as f64
        };

        let metrics = ScenarioMetrics {
            measurements_sent: self.sent,
            accepted: stats.accepted,
            rejected: stats.total_rejected(),
            stale_rejections: stats.rejected_for(RejectReason::Stale),
            duplicate_rejections: stats.rejected_for(RejectReason::DuplicateSequence),
            position_events: events.iter().filter(|e| matches!(e, FeedEvent::Position(_))).count() as u64,
            expired_events: events.iter().filter(|e| matches!(e, FeedEvent::Expired { .. })).count() as u64,
            solves: stats.solves,
            gating_rejections: stats.gating_rejections,
            low_confidence_solves: stats.low_confidence_solves,
            insufficient_epochs: stats.insufficient_epochs,
            fallback_solves: stats.fallback_solves,
            rms_error_m: rms,
            max_error_m: self.errors.iter().copied().fold(0.0, f64::max),
            mean_confidence,
        };

        let passed = check.is_ok();
        if let Some(export) = self.export.as_mut() {
            export.finalize(passed, Some(rms));
        }

        info!(
            scenario = %self.scenario,
            passed,
            rms_error = rms,
            solves = metrics.solves,
            rejected = metrics.rejected,
            "scenario complete"
        );

        ScenarioResult {
            scenario: self.scenario,
            seed: self.seed,
            passed,
            total_ticks: self.ticks,
            final_time_secs: self.time(),
            final_track_count: self.agent.track_count(),
            failure_reason: check.err(),
            metrics,
            export: self.export,
        }
    }
}

// ============================================================================
// RUNNER
// ============================================================================

/// Runs scenarios.
pub struct ScenarioRunner {
    seed: u64,
    tick_rate_hz: u32,

    /// Nominal duration; scenarios that need longer extend it
    max_duration_secs: f64,

    export: bool,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_rate_hz: 10,
            max_duration_secs: 10.0,
            export: false,
        }
    }

    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Captures frames into [`ScenarioResult::export`].
    pub fn with_export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        match scenario {
            ScenarioId::StaticTriangle => self.run_static_triangle(),
            ScenarioId::Walking => self.run_walking(),
            ScenarioId::NodeDropout => self.run_node_dropout(),
            ScenarioId::OutlierSpike => self.run_outlier_spike(),
            ScenarioId::StaleFlood => self.run_stale_flood(),
            ScenarioId::Recalibration => self.run_recalibration(),
            ScenarioId::Crowd => self.run_crowd(),
            ScenarioId::Collinear => self.run_collinear(),
        }
    }

    fn harness(&self, scenario: ScenarioId, nodes: Vec<Node>, sigma_db: f64) -> Result<Harness, EngineError> {
        // The engine is calibrated to the channel it observes
        let params = CalibrationParams {
            shadowing_sigma_db: sigma_db,
            ..CalibrationParams::default()
        };
        let table = NodeTable::new(nodes.clone(), params.clone())?;
        let engine = PositioningEngine::new(EngineConfig::default(), table)?;

        let context = SimContext::shared(self.seed);
        let mut oracle = Oracle::new(context.physics_seed(), nodes, params.clone());
        oracle.set_radio_model(RadioModel {
            shadowing_sigma_db: sigma_db,
            ..RadioModel::default()
        });

        let agent = SimulatedAgent::new(
            Arc::clone(&context),
            engine,
            AgentConfig {
                name: format!("sim-{}", scenario.name()),
                tick_interval_ms: (1000 / self.tick_rate_hz) as u64,
                ..AgentConfig::default()
            },
        );

        Ok(Harness {
            scenario,
            seed: self.seed,
            context,
            oracle,
            agent,
            params,
            dt: 1.0 / self.tick_rate_hz as f64,
            ticks: 0,
            sent: 0,
            errors: Vec::new(),
            confidences: Vec::new(),
            export: self.export.then(|| SimExport::new(scenario.name(), self.seed)),
            pending_events: Vec::new(),
        })
    }

    fn setup_failed(&self, scenario: ScenarioId, error: EngineError) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            final_track_count: 0,
            failure_reason: Some(format!("engine setup failed: {error}")),
            metrics: ScenarioMetrics::default(),
            export: None,
        }
    }

    /// SIM-001: stationary entity, three nodes.
    fn run_static_triangle(&self) -> ScenarioResult {
        let mut h = match self.harness(ScenarioId::StaticTriangle, triangle(), 1.0) {
            Ok(h) => h,
            Err(e) => return self.setup_failed(ScenarioId::StaticTriangle, e),
        };
        let entity = h.oracle.spawn_entity("phone", Vector3::new(5.0, 3.0, 0.0), Vector3::zeros());

        h.run_for(self.max_duration_secs);

        let error = h.final_error();
        let check = match h.track_state(&entity) {
            None => Err("no track for the entity".to_string()),
            Some(_) if error > 1.5 => Err(format!("final error {error:.2}m exceeds 1.5m")),
            Some(_) => Ok(()),
        };
        h.finish(check)
    }

    /// SIM-002: entity walking through a square room.
    fn run_walking(&self) -> ScenarioResult {
        let mut h = match self.harness(ScenarioId::Walking, square_room(), 1.5) {
            Ok(h) => h,
            Err(e) => return self.setup_failed(ScenarioId::Walking, e),
        };
        let entity = h.oracle.spawn_entity("walker", Vector3::new(2.0, 6.0, 0.0), Vector3::new(0.8, 0.0, 0.0));

        let leg = self.max_duration_secs / 2.0;
        h.run_for(leg);
        h.oracle.set_velocity(&entity, Vector3::new(0.0, 0.6, 0.0));
        h.note("walker turns north");
        h.run_for(leg);

        let rms = rms(&h.errors);
        let check = if h.track_state(&entity).is_none() {
            Err("walker lost".to_string())
        } else if rms > 2.0 {
            Err(format!("RMS error {rms:.2}m exceeds 2.0m"))
        } else {
            Ok(())
        };
        h.finish(check)
    }

    /// SIM-003: two of three nodes go silent.
    fn run_node_dropout(&self) -> ScenarioResult {
        let mut h = match self.harness(ScenarioId::NodeDropout, triangle(), 1.0) {
            Ok(h) => h,
            Err(e) => return self.setup_failed(ScenarioId::NodeDropout, e),
        };
        let entity = h.oracle.spawn_entity("phone", Vector3::new(5.0, 3.0, 0.0), Vector3::zeros());

        h.run_for(3.0);
        h.oracle.silence_node(&NodeId::from("b"));
        h.oracle.silence_node(&NodeId::from("c"));
        h.note("nodes b and c silenced");

        // Staleness timeout plus a sweep interval
        h.run_for(self.max_duration_secs.max(15.0) - 3.0);

        let coasted = h
            .agent
            .sink()
            .positions_for(&entity)
            .iter()
            .any(|s| s.state == TrackState::Coasting);
        let expired = h.agent.sink().expired().contains(&entity);
        let insufficient = h.agent.stats().insufficient_epochs;

        let check = if insufficient == 0 {
            Err("no insufficient-node epochs recorded".to_string())
        } else if !coasted {
            Err("track never coasted".to_string())
        } else if !expired {
            Err("track never expired".to_string())
        } else {
            Ok(())
        };
        h.finish(check)
    }

    /// SIM-004: every node reports a spike for half a second.
    fn run_outlier_spike(&self) -> ScenarioResult {
        let mut h = match self.harness(ScenarioId::OutlierSpike, triangle(), 1.0) {
            Ok(h) => h,
            Err(e) => return self.setup_failed(ScenarioId::OutlierSpike, e),
        };
        let entity = h.oracle.spawn_entity("phone", Vector3::new(5.0, 3.0, 0.0), Vector3::zeros());

        h.run_for(3.0);
        let calm = h.oracle.radio_model().clone();
        h.oracle.set_radio_model(RadioModel {
            outlier_probability: 1.0,
            ..calm.clone()
        });
        h.note("outlier spike begins");
        h.run_for(0.6);
        h.oracle.set_radio_model(calm);
        h.note("outlier spike ends");
        h.run_for(self.max_duration_secs.max(8.0) - 3.6);

        let max_error = h.errors.iter().copied().fold(0.0, f64::max);
        let check = match h.track_state(&entity) {
            None => Err("track lost".to_string()),
            Some(state) if state != TrackState::Tracking => Err(format!("track left in {state}")),
            Some(_) if max_error > 3.0 => Err(format!("spike moved the track {max_error:.2}m")),
            Some(_) => Ok(()),
        };
        h.finish(check)
    }

    /// SIM-005: every step replays old frames and duplicates the new ones.
    fn run_stale_flood(&self) -> ScenarioResult {
        let mut h = match self.harness(ScenarioId::StaleFlood, triangle(), 1.0) {
            Ok(h) => h,
            Err(e) => return self.setup_failed(ScenarioId::StaleFlood, e),
        };
        let entity = h.oracle.spawn_entity("phone", Vector3::new(5.0, 3.0, 0.0), Vector3::zeros());

        let replay_lag = (3.0 / h.dt).round() as usize;
        let mut history: VecDeque<Vec<Measurement>> = VecDeque::new();
        let mut fresh = 0u64;

        let steps = (self.max_duration_secs / h.dt).round() as u64;
        for _ in 0..steps {
            let readings = h.advance();
            fresh += readings.len() as u64;

            if history.len() == replay_lag {
                if let Some(old) = history.pop_front() {
                    h.ingest(&old);
                }
            }
            h.ingest(&readings);
            history.push_back(readings);
            h.finish_step();
        }

        let stats = h.agent.stats();
        let error = h.final_error();
        let check = if stats.rejected_for(RejectReason::Stale) == 0 {
            Err("no stale rejections".to_string())
        } else if stats.rejected_for(RejectReason::DuplicateSequence) == 0 {
            Err("no duplicate rejections".to_string())
        } else if stats.accepted != fresh {
            Err(format!("accepted {} of {} fresh measurements", stats.accepted, fresh))
        } else if h.track_state(&entity).is_none() || error > 1.5 {
            Err(format!("track disturbed, final error {error:.2}m"))
        } else {
            Ok(())
        };
        h.finish(check)
    }

    /// SIM-006: node c is relocated, then the table is reloaded.
    fn run_recalibration(&self) -> ScenarioResult {
        let mut h = match self.harness(ScenarioId::Recalibration, triangle(), 1.0) {
            Ok(h) => h,
            Err(e) => return self.setup_failed(ScenarioId::Recalibration, e),
        };
        let entity = h.oracle.spawn_entity("phone", Vector3::new(5.0, 3.0, 0.0), Vector3::zeros());

        h.run_for(3.0);
        h.oracle.move_node(&NodeId::from("c"), Vector3::new(5.0, 12.0, 0.0));
        h.note("node c physically moved to (5, 12)");
        h.run_for(3.0);
        let error_before = h.final_error();

        let table = match NodeTable::new(h.oracle.nodes().to_vec(), h.params.clone()) {
            Ok(table) => table,
            Err(e) => return h.finish(Err(format!("surveyed table invalid: {e}"))),
        };
        let generation = h.agent.engine().reload_calibration(table);
        h.note(format!("calibration reloaded (generation {generation})"));
        h.run_for(self.max_duration_secs.max(20.0) - 6.0);

        let error = h.final_error();
        let check = if h.track_state(&entity).is_none() {
            Err("track lost".to_string())
        } else if error > 1.5 {
            Err(format!("error {error:.2}m after reload (was {error_before:.2}m)"))
        } else {
            Ok(())
        };
        h.finish(check)
    }

    /// SIM-007: twenty entities in a six-node hall.
    fn run_crowd(&self) -> ScenarioResult {
        let mut h = match self.harness(ScenarioId::Crowd, hall(), 1.5) {
            Ok(h) => h,
            Err(e) => return self.setup_failed(ScenarioId::Crowd, e),
        };
        for i in 0..20 {
            let position = Vector3::new(2.0 + (i % 5) as f64 * 4.0, 2.0 + (i / 5) as f64 * 2.0, 0.0);
            let heading = i as f64 * 0.7;
            let velocity = Vector3::new(0.2 * heading.cos(), 0.2 * heading.sin(), 0.0);
            h.oracle.spawn_entity(format!("tag-{i:02}"), position, velocity);
        }

        h.run_for(self.max_duration_secs);

        let tracks = h.agent.track_count();
        let rms = rms(&h.errors);
        let check = if tracks != 20 {
            Err(format!("{tracks} of 20 entities tracked"))
        } else if rms > 2.5 {
            Err(format!("RMS error {rms:.2}m exceeds 2.5m"))
        } else {
            Ok(())
        };
        h.finish(check)
    }

    /// SIM-008: all nodes on the x axis.
    fn run_collinear(&self) -> ScenarioResult {
        let nodes = (0..4).map(|i| Node::new(format!("n{i}"), i as f64 * 5.0, 0.0)).collect();
        let mut h = match self.harness(ScenarioId::Collinear, nodes, 1.0) {
            Ok(h) => h,
            Err(e) => return self.setup_failed(ScenarioId::Collinear, e),
        };
        let entity = h.oracle.spawn_entity("phone", Vector3::new(7.0, 4.0, 0.0), Vector3::zeros());

        h.run_for(self.max_duration_secs);

        let stats = h.agent.stats();
        let all_flagged = h.agent.sink().positions_for(&entity).iter().all(|s| s.low_confidence);
        let check = if stats.solves == 0 {
            Err("nothing solved".to_string())
        } else if stats.low_confidence_solves != stats.solves || !all_flagged {
            Err(format!(
                "{} of {} collinear solves flagged low confidence",
                stats.low_confidence_solves, stats.solves
            ))
        } else {
            Ok(())
        };
        h.finish(check)
    }
}

fn rms(errors: &[f64]) -> f64 {
    if errors.is_empty() {
        return 0.0;
    }
    (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
}

fn triangle() -> Vec<Node> {
    vec![
        Node::new("a", 0.0, 0.0),
        Node::new("b", 10.0, 0.0),
        Node::new("c", 5.0, 8.66),
    ]
}

fn square_room() -> Vec<Node> {
    vec![
        Node::new("sw", 0.0, 0.0),
        Node::new("se", 12.0, 0.0),
        Node::new("ne", 12.0, 12.0),
        Node::new("nw", 0.0, 12.0),
    ]
}

fn hall() -> Vec<Node> {
    [(0.0, 0.0), (10.0, 0.0), (20.0, 0.0), (0.0, 10.0), (10.0, 10.0), (20.0, 10.0)]
        .iter()
        .enumerate()
        .map(|(i, (x, y))| Node::new(format!("h{i}"), *x, *y))
        .collect()
}
