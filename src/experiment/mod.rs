//! Experiment
//!
//! The fixed power-sweep sequence:
//! - `plan`: target powers and their angles
//! - `orchestrator`: the move / sweep / read / persist loop
//! - `recorder`: run directory, manifest and trace files

pub mod orchestrator;
pub mod plan;
pub mod recorder;

pub use orchestrator::{RunSummary, SweepOrchestrator};
pub use plan::{PlannedPoint, SweepPlan};
pub use recorder::{RunContext, RunRecorder};
