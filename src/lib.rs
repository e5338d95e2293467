//! # Power Sweep
//!
//! Automates an optical power sweep: a motorized half-wave plate is rotated
//! through a sequence of angles, each corresponding to a target optical
//! power, and at every angle an optical spectrum analyzer captures a
//! wavelength/level trace that is written to disk.
//!
//! ## Crate Structure
//!
//! - **`conversion`**: power → angle → stage device units.
//! - **`measurement`**: captured traces and their metadata.
//! - **`hardware`**: device contracts (`MotorController`, `InstrumentChannel`),
//!   the stage controller, the analyzer sweep client, and their backends
//!   (Thorlabs APT, Prologix GPIB-USB, VISA, simulation).
//! - **`experiment`**: the sweep plan, the orchestrator loop and the run recorder.
//! - **`config`**: layered configuration (defaults, TOML, environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: the `SweepError` taxonomy.

pub mod config;
pub mod conversion;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod measurement;
