//! SimulatedAgent - runs a PositioningAgent against the virtual clock.
//!
//! Bridges `whofi_core::PositioningAgent` with the simulation infrastructure:
//! - Oracle observations are ingested with virtual-clock timestamps
//! - Published events land in a [`RecordingSink`]
//! - Position error is computed against ground truth

use crate::context::SimContext;
use crate::sink::RecordingSink;

use nalgebra::Vector3;
use std::collections::HashMap;
use std::sync::Arc;
use whofi_core::{
    AgentConfig, EngineStats, Measurement, PositioningAgent, PositioningEngine, Rejected, TrackSnapshot,
};
use whofi_env::{EngineContext, EntityId, EnvError};

/// A positioning agent running in the deterministic environment.
pub struct SimulatedAgent {
    inner: PositioningAgent<SimContext, RecordingSink>,
    sink: Arc<RecordingSink>,
    rejections: Vec<Rejected>,
}

impl SimulatedAgent {
    pub fn new(context: Arc<SimContext>, engine: PositioningEngine, config: AgentConfig) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let inner = PositioningAgent::new(context, Arc::new(engine), Arc::clone(&sink), config);
        Self {
            inner,
            sink,
            rejections: Vec::new(),
        }
    }

    /// Closes due epochs and sweeps; events go to the recording sink.
    pub fn tick(&mut self) -> Result<usize, EnvError> {
        self.inner.tick()
    }

    /// Ingests observations, keeping the rejections for inspection.
    ///
    /// Returns the number accepted.
    pub fn ingest_readings(&mut self, readings: &[Measurement]) -> usize {
        let mut accepted = 0;
        for m in readings {
            match self.inner.ingest(m) {
                Ok(_) => accepted += 1,
                Err(r) => self.rejections.push(r),
            }
        }
        accepted
    }

    pub fn engine(&self) -> &PositioningEngine {
        &self.inner.engine
    }

    pub fn sink(&self) -> &RecordingSink {
        &self.sink
    }

    pub fn rejections(&self) -> &[Rejected] {
        &self.rejections
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.engine.stats()
    }

    pub fn active_tracks(&self) -> Vec<TrackSnapshot> {
        self.inner.engine.get_active_tracks(self.time_secs())
    }

    pub fn track_count(&self) -> usize {
        self.active_tracks().len()
    }

    pub fn track_positions(&self) -> Vec<(EntityId, Vector3<f64>)> {
        self.active_tracks()
            .into_iter()
            .map(|t| (t.entity_id.clone(), t.position()))
            .collect()
    }

    pub fn tick_count(&self) -> u64 {
        self.inner.tick_count()
    }

    /// Engine time (virtual clock mapped onto the Unix epoch).
    pub fn time_secs(&self) -> f64 {
        self.inner.context.unix_secs()
    }

    /// RMS planar error of active tracks against ground truth.
    ///
    /// Entities without a track are ignored; returns 0 when nothing matched.
    pub fn compute_position_error(&self, ground_truth: &[(EntityId, Vector3<f64>)]) -> f64 {
        let tracks: HashMap<EntityId, Vector3<f64>> = self.track_positions().into_iter().collect();
        let errors: Vec<f64> = ground_truth
            .iter()
            .filter_map(|(id, truth)| tracks.get(id).map(|p| planar_error(p, truth)))
            .collect();
        if errors.is_empty() {
            return 0.0;
        }
        (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
    }
}

pub fn planar_error(estimate: &Vector3<f64>, truth: &Vector3<f64>) -> f64 {
    (estimate.xy() - truth.xy()).norm()
}
