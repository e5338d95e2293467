//! Sweep orchestrator: the fixed experiment sequence.
//!
//! ```text
//! configure OSA -> connect stage -> begin run -> home -> conversion factor
//!   for each planned point:
//!     move (blocking, bounded) -> trigger sweep -> wait idle -> read trace -> persist
//! close stage
//! ```
//!
//! Stage settling strictly precedes the sweep trigger for every point. The
//! first error aborts the run; trace files already written stay on disk.

use crate::config::{InstrumentConfig, SweepConfig};
use crate::conversion::{angle_to_device_units, device_units_to_angle};
use crate::error::AppResult;
use crate::experiment::plan::{PlannedPoint, SweepPlan};
use crate::experiment::recorder::RunRecorder;
use crate::hardware::capabilities::{InstrumentChannel, MotorController};
use crate::hardware::osa::SweepClient;
use crate::hardware::stage::StageController;
use crate::measurement::CapturePoint;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Directory holding the manifest and trace files
    pub run_directory: PathBuf,
    /// Run number within the day
    pub run_number: u32,
    /// Number of trace files written
    pub points_captured: usize,
    /// Trace files in plan order
    pub trace_files: Vec<PathBuf>,
}

/// Drives one power sweep over a stage and a spectrum analyzer.
pub struct SweepOrchestrator<M: MotorController, C: InstrumentChannel> {
    stage: StageController<M>,
    osa: SweepClient<C>,
    recorder: RunRecorder,
    instrument: InstrumentConfig,
}

impl<M: MotorController, C: InstrumentChannel> SweepOrchestrator<M, C> {
    /// Take ownership of both devices. No I/O happens until a run starts.
    pub fn new(config: &SweepConfig, motor: M, channel: C) -> Self {
        Self {
            stage: StageController::new(motor, config.stage.clone()),
            osa: SweepClient::new(channel, config.instrument.decimal_digits),
            recorder: RunRecorder::new(
                config.storage.output_dir.clone(),
                config.storage.instrument_label.clone(),
            ),
            instrument: config.instrument.clone(),
        }
    }

    /// The stage controller.
    pub fn stage(&self) -> &StageController<M> {
        &self.stage
    }

    /// The run recorder.
    pub fn recorder(&self) -> &RunRecorder {
        &self.recorder
    }

    /// Configure the analyzer, connect and home the stage, and open the run
    /// directory. Returns the conversion factor in device units per degree.
    #[instrument(skip_all, fields(points = plan.len()))]
    pub async fn prepare(&mut self, plan: &SweepPlan) -> AppResult<f64> {
        self.osa.configure(self.instrument.sensitivity).await?;
        self.stage.connect().await?;
        self.recorder.begin_run(plan)?;
        self.stage.home().await?;
        let factor = self.stage.conversion_factor().await?;

        info!(
            estimated_s = estimated_duration(plan, &self.instrument).as_secs(),
            "Estimated time to finish (sweeps only)"
        );
        Ok(factor)
    }

    /// Move to one planned point and capture its trace.
    pub async fn capture_point(
        &mut self,
        point: &PlannedPoint,
        factor: f64,
    ) -> AppResult<CapturePoint> {
        let units = angle_to_device_units(point.angle_deg, factor)?;
        info!(
            point = point.index + 1,
            "Moving to {:.3} degrees ({} device units)",
            point.angle_deg,
            units
        );

        let settings = self.stage.settings();
        let (timeout, poll_interval, tolerance) = (
            settings.move_timeout,
            settings.move_poll_interval,
            settings.tolerance_units,
        );
        let achieved = self
            .stage
            .move_to(units, timeout, poll_interval, tolerance)
            .await?;

        self.osa.trigger_sweep().await?;
        self.osa
            .wait_for_completion(
                self.instrument.sweep_poll_interval,
                self.instrument.effective_sweep_timeout(),
            )
            .await?;
        let trace = self.osa.read_trace().await?;

        Ok(CapturePoint {
            index: point.index,
            target_power: point.power,
            target_angle: point.angle_deg,
            achieved_position_units: achieved,
            wavelengths: trace.wavelengths,
            levels: trace.levels,
            wavelength_text: trace.wavelength_text,
            level_text: trace.level_text,
            metadata: trace.metadata,
        })
    }

    /// Capture and persist every planned point in order.
    pub async fn execute(&mut self, plan: &SweepPlan, factor: f64) -> AppResult<Vec<PathBuf>> {
        let total = plan.len();
        let per_sweep = self.instrument.sensitivity.estimated_sweep_time();
        let mut trace_files = Vec::with_capacity(total);

        for point in plan.points() {
            let capture = self.capture_point(point, factor).await?;
            let path = self.recorder.persist(&capture)?;
            trace_files.push(path);

            let remaining = total - (point.index + 1);
            info!(
                achieved_deg = format_args!(
                    "{:.3}",
                    device_units_to_angle(capture.achieved_position_units, factor)
                ),
                remaining_s = (per_sweep * remaining as u32).as_secs(),
                "Saved trace {} out of {}",
                point.index + 1,
                total
            );
        }
        Ok(trace_files)
    }

    /// Run the whole sequence. The stage is closed on every exit path.
    pub async fn run(mut self, plan: &SweepPlan) -> AppResult<RunSummary> {
        let result = self.run_inner(plan).await;
        self.stage.close();
        if let Err(e) = &result {
            warn!(error = %e, "Sweep aborted");
        }
        result
    }

    async fn run_inner(&mut self, plan: &SweepPlan) -> AppResult<RunSummary> {
        let factor = self.prepare(plan).await?;
        let trace_files = self.execute(plan, factor).await?;

        let (run_directory, run_number) = self
            .recorder
            .context()
            .map(|c| (c.run_directory.clone(), c.run_number))
            .unwrap_or_default();
        info!(run = run_number, points = trace_files.len(), "Sweep complete");

        Ok(RunSummary {
            run_directory,
            run_number,
            points_captured: trace_files.len(),
            trace_files,
        })
    }
}

/// Estimated analyzer time for a plan, excluding stage moves.
pub fn estimated_duration(plan: &SweepPlan, instrument: &InstrumentConfig) -> Duration {
    instrument.sensitivity.estimated_sweep_time() * plan.len() as u32
}
