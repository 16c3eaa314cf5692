//! JSON exporter for offline visualization.
//!
//! Exports simulation frames (ground truth next to published tracks) as a
//! single JSON document.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use whofi_core::{TrackSnapshot, TrackState};
use whofi_env::EntityId;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    pub ground_truth: Vec<EntityPosition>,

    pub tracks: Vec<TrackPosition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rms_error: Option<f64>,

    /// Events (node silenced, recalibration, etc.)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityPosition {
    pub id: EntityId,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl EntityPosition {
    pub fn new(id: EntityId, pos: Vector3<f64>) -> Self {
        Self {
            id,
            x: pos.x,
            y: pos.y,
            z: pos.z,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackPosition {
    pub entity_id: EntityId,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub confidence: f64,
    pub state: TrackState,
}

impl From<&TrackSnapshot> for TrackPosition {
    fn from(s: &TrackSnapshot) -> Self {
        Self {
            entity_id: s.entity_id.clone(),
            x: s.x,
            y: s.y,
            z: s.z,
            confidence: s.confidence,
            state: s.state,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    pub scenario: String,
    pub seed: u64,
    pub duration_sec: f64,
    pub frames: Vec<SimFrame>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_rms_error: Option<f64>,
}

impl SimExport {
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            final_rms_error: None,
        }
    }

    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    pub fn finalize(&mut self, passed: bool, rms_error: Option<f64>) {
        self.passed = passed;
        self.final_rms_error = rms_error;
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_tracks_duration() {
        let mut export = SimExport::new("static_triangle", 42);
        for t in [0.5, 1.0] {
            export.add_frame(SimFrame {
                time_sec: t,
                ground_truth: vec![EntityPosition::new(EntityId::from("e"), Vector3::new(5.0, 3.0, 0.0))],
                tracks: Vec::new(),
                rms_error: None,
                events: vec![SimEvent::info("tick")],
            });
        }
        export.finalize(true, Some(0.2));

        assert_eq!(export.duration_sec, 1.0);
        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["frames"][0]["ground_truth"][0]["id"], "e");
        assert_eq!(json["final_rms_error"], 0.2);
    }
}
