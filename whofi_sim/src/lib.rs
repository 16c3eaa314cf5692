//! WhoFi Deterministic Simulation Harness
//!
//! A controlled environment where the whole positioning pipeline runs
//! reproducibly from a single 64-bit seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: a virtual clock advanced only by the harness
//! - **Radio**: path-loss observations with seeded shadowing, dropouts and outliers
//! - **Output**: a recording sink that keeps every published event
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                    ScenarioRunner                     │
//! │  ┌────────────┐   Measurements   ┌─────────────────┐  │
//! │  │   Oracle   │ ───────────────▶ │ SimulatedAgent  │  │
//! │  │ (truth +   │                  │  engine + clock │  │
//! │  │  radio)    │                  └────────┬────────┘  │
//! │  └────────────┘                           │ events    │
//! │        ▲ ground truth            ┌────────▼────────┐  │
//! │        └──────── error ───────── │  RecordingSink  │  │
//! │                                  └─────────────────┘  │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use whofi_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::StaticTriangle);
//! assert!(result.passed);
//! ```

mod agent;
mod context;
mod exporter;
mod oracle;
mod runner;
mod sink;
pub mod scenarios;

pub use agent::{planar_error, SimulatedAgent};
pub use context::SimContext;
pub use exporter::{EntityPosition, SimEvent, SimExport, SimFrame, TrackPosition};
pub use oracle::{GroundTruthEntity, Oracle, RadioModel};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use sink::RecordingSink;
