//! Node payloads - the JSON records a sensing node emits.
//!
//! A node publishes one record per observation and, periodically, a stats
//! record describing its own health.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use whofi_core::{Measurement, NodeReport, Signal};
use whofi_env::{EntityId, NodeId};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload carries neither rssi nor csi_data")]
    NoSignal,
}

/// One observation as delivered by a node.
///
/// `entity` also accepts `mac` and `csi_data` also accepts `amplitude`, the
/// names the firmware publishes under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePayload {
    pub node: String,

    #[serde(alias = "mac")]
    pub entity: String,

    #[serde(default)]
    pub rssi: Option<f64>,

    #[serde(default, alias = "amplitude")]
    pub csi_data: Option<Vec<f64>>,

    /// Seconds since the Unix epoch
    pub timestamp: f64,

    #[serde(default)]
    pub seq: u64,

    /// Informational only
    #[serde(default)]
    pub channel: Option<u8>,

    /// Informational only
    #[serde(default)]
    pub rate: Option<f64>,
}

/// Node health counters as published on the stats channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    #[serde(default)]
    pub packets: u64,

    /// Absent means the node did not confirm capture is on
    #[serde(default)]
    pub enabled: bool,

    /// Seconds since boot
    #[serde(default)]
    pub uptime: f64,
}

/// A stats record: `{"node":"n1","stats":{"packets":..,"enabled":..,"uptime":..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsPayload {
    pub node: String,
    pub stats: NodeStats,
}

impl StatsPayload {
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node.clone())
    }

    pub fn report(&self) -> NodeReport {
        NodeReport {
            packets: self.stats.packets,
            enabled: self.stats.enabled,
            uptime_s: self.stats.uptime,
        }
    }
}

/// Any record a node may send on the input stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeRecord {
    Stats(StatsPayload),
    Observation(NodePayload),
}

impl NodeRecord {
    pub fn parse(line: &str) -> Result<Self, PayloadError> {
        Ok(serde_json::from_str(line)?)
    }
}

impl NodePayload {
    pub fn into_measurement(self) -> Result<Measurement, PayloadError> {
        if self.rssi.is_none() && self.csi_data.is_none() {
            return Err(PayloadError::NoSignal);
        }
        Ok(Measurement {
            node_id: NodeId::new(self.node),
            entity_id: EntityId::new(self.entity),
            signal: Signal {
                rssi_dbm: self.rssi,
                csi: self.csi_data,
            },
            timestamp: self.timestamp,
            sequence_no: self.seq,
        })
    }
}
