//! Simulated Hardware
//!
//! In-memory stand-ins for the rotation stage and the spectrum analyzer, used
//! by the test suite and by `power-sweep run --simulate`.
//!
//! Both simulators are cheap to clone: clones share state, so a test can hand
//! one clone to a controller and keep another to inspect what happened.
//!
//! # Available Simulators
//!
//! - `SimulatedStage` - stage that advances toward its target on every status request
//! - `SimulatedOsa` - ANDO AQ6315-style analyzer that answers the sweep command set

use crate::hardware::capabilities::{InstrumentChannel, MotorController, MotorParams};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Status word reported while a channel is enabled and idle.
const STATUS_ENABLED: u32 = 0x8000_0000;
/// Status bit set while homing is in progress.
const STATUS_HOMING: u32 = 0x0000_0200;
/// Status bit set once homing has completed.
const STATUS_HOMED: u32 = 0x0000_0400;
/// Status bits set while moving (clockwise / counter-clockwise).
const STATUS_MOVING: u32 = 0x0000_0030;

// =============================================================================
// SimulatedStage
// =============================================================================

struct StageSim {
    serials: Vec<String>,
    open: Option<String>,
    fail_open: bool,
    close_count: u32,
    polling: Option<Duration>,
    settings_loaded: bool,
    homing_polls: u32,
    homing_remaining: Option<u32>,
    never_homes: bool,
    homed: bool,
    position: i32,
    target: i32,
    units_per_update: i32,
    stuck: bool,
    moves_before_failure: Option<usize>,
    params: MotorParams,
    moves: Vec<i32>,
}

/// Simulated rotation stage.
///
/// Every `request_status` advances the simulation by one update: homing
/// counts down, and a move steps `units_per_update` toward its target.
///
/// # Example
///
/// ```rust,ignore
/// let sim = SimulatedStage::new().with_units_per_update(1_000);
/// let mut stage = StageController::new(sim.clone(), StageConfig::default());
/// stage.connect().await?;
/// assert!(sim.is_open());
/// ```
#[derive(Clone)]
pub struct SimulatedStage {
    state: Arc<Mutex<StageSim>>,
}

impl SimulatedStage {
    /// Serial number listed by a default simulated stage.
    pub const DEFAULT_SERIAL: &'static str = "55000001";

    /// Stage with one serial number, homing after three status updates and
    /// moving 250 000 units per update.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StageSim {
                serials: vec![Self::DEFAULT_SERIAL.to_string()],
                open: None,
                fail_open: false,
                close_count: 0,
                polling: None,
                settings_loaded: false,
                homing_polls: 3,
                homing_remaining: None,
                never_homes: false,
                homed: false,
                position: 0,
                target: 0,
                units_per_update: 250_000,
                stuck: false,
                moves_before_failure: None,
                params: MotorParams::default(),
                moves: Vec::new(),
            })),
        }
    }

    /// Replace the listed serial numbers (empty simulates no attached stage).
    pub fn with_serials(self, serials: Vec<String>) -> Self {
        self.lock().serials = serials;
        self
    }

    /// Set the distance covered per status update.
    pub fn with_units_per_update(self, units: i32) -> Self {
        self.lock().units_per_update = units.max(1);
        self
    }

    /// Set how many status updates homing takes.
    pub fn with_homing_polls(self, polls: u32) -> Self {
        self.lock().homing_polls = polls;
        self
    }

    /// Start from a non-zero position.
    pub fn with_position(self, position: i32) -> Self {
        {
            let mut sim = self.lock();
            sim.position = position;
            sim.target = position;
        }
        self
    }

    /// Report custom motor parameters.
    pub fn with_params(self, params: MotorParams) -> Self {
        self.lock().params = params;
        self
    }

    /// Accept move commands but never change position.
    pub fn stuck(self) -> Self {
        self.lock().stuck = true;
        self
    }

    /// Accept `moves` move commands, then fail every further one.
    pub fn fail_moves_after(self, moves: usize) -> Self {
        self.lock().moves_before_failure = Some(moves);
        self
    }

    /// Keep reporting "homing" forever.
    pub fn never_homes(self) -> Self {
        self.lock().never_homes = true;
        self
    }

    /// Fail every `open`.
    pub fn failing_open(self) -> Self {
        self.lock().fail_open = true;
        self
    }

    /// True while a handle is open.
    pub fn is_open(&self) -> bool {
        self.lock().open.is_some()
    }

    /// Number of times an open handle was closed.
    pub fn close_count(&self) -> u32 {
        self.lock().close_count
    }

    /// Polling interval requested by the controller.
    pub fn polling_interval(&self) -> Option<Duration> {
        self.lock().polling
    }

    /// True once settings were loaded on the open handle.
    pub fn settings_loaded(&self) -> bool {
        self.lock().settings_loaded
    }

    /// Every absolute move target received, in order.
    pub fn move_commands(&self) -> Vec<i32> {
        self.lock().moves.clone()
    }

    /// Simulated physical position.
    pub fn position_now(&self) -> i32 {
        self.lock().position
    }

    fn lock(&self) -> MutexGuard<'_, StageSim> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_guard(&self) -> Result<MutexGuard<'_, StageSim>> {
        let sim = self.lock();
        if sim.open.is_none() {
            bail!("simulated stage is not open");
        }
        Ok(sim)
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MotorController for SimulatedStage {
    async fn list_serial_numbers(&mut self) -> Result<Vec<String>> {
        Ok(self.lock().serials.clone())
    }

    async fn open(&mut self, serial: &str) -> Result<()> {
        let mut sim = self.lock();
        if sim.fail_open {
            bail!("simulated open failure for {serial}");
        }
        if !sim.serials.iter().any(|s| s == serial) {
            bail!("no simulated stage with serial {serial}");
        }
        sim.open = Some(serial.to_string());
        sim.homed = false;
        Ok(())
    }

    fn close(&mut self) {
        let mut sim = self.lock();
        if sim.open.take().is_some() {
            sim.close_count += 1;
            sim.polling = None;
            sim.settings_loaded = false;
        }
    }

    async fn start_polling(&mut self, interval: Duration) -> Result<()> {
        self.open_guard()?.polling = Some(interval);
        Ok(())
    }

    async fn load_settings(&mut self) -> Result<()> {
        self.open_guard()?.settings_loaded = true;
        Ok(())
    }

    async fn home(&mut self) -> Result<()> {
        let mut sim = self.open_guard()?;
        sim.homed = false;
        sim.homing_remaining = Some(sim.homing_polls);
        Ok(())
    }

    async fn request_status(&mut self) -> Result<()> {
        let mut sim = self.open_guard()?;

        if let Some(remaining) = sim.homing_remaining {
            if sim.never_homes {
                return Ok(());
            }
            if remaining <= 1 {
                sim.homing_remaining = None;
                sim.homed = true;
                sim.position = 0;
                sim.target = 0;
            } else {
                sim.homing_remaining = Some(remaining - 1);
            }
            return Ok(());
        }

        if !sim.stuck && sim.position != sim.target {
            let step = sim.units_per_update;
            let delta = (i64::from(sim.target) - i64::from(sim.position))
                .clamp(-i64::from(step), i64::from(step));
            sim.position = (i64::from(sim.position) + delta) as i32;
        }
        Ok(())
    }

    async fn status_bits(&mut self) -> Result<u32> {
        let sim = self.open_guard()?;
        let mut bits = STATUS_ENABLED;
        if sim.homing_remaining.is_some() {
            bits |= STATUS_HOMING;
        } else if sim.position != sim.target {
            bits |= STATUS_MOVING;
        }
        if sim.homed {
            bits |= STATUS_HOMED;
        }
        Ok(bits)
    }

    async fn move_to(&mut self, position: i32) -> Result<()> {
        let mut sim = self.open_guard()?;
        if sim.homing_remaining.is_some() {
            bail!("simulated stage is homing");
        }
        if sim.moves_before_failure.is_some_and(|limit| sim.moves.len() >= limit) {
            bail!("simulated motor fault");
        }
        sim.target = position;
        sim.moves.push(position);
        Ok(())
    }

    async fn position(&mut self) -> Result<i32> {
        Ok(self.open_guard()?.position)
    }

    async fn motor_params(&mut self) -> Result<MotorParams> {
        Ok(self.open_guard()?.params)
    }
}

// =============================================================================
// SimulatedOsa
// =============================================================================

struct OsaSim {
    replies: VecDeque<Vec<u8>>,
    commands: Vec<String>,
    busy_polls: u32,
    busy_remaining: u32,
    stays_busy: bool,
    sweeps: u32,
    active_trace: u8,
    sensitivity: String,
    samples: usize,
    level_samples: Option<usize>,
    center_nm: f64,
    span_nm: f64,
    decimal_digits: usize,
    log_scale: bool,
    density: bool,
    identity: Vec<u8>,
    failing_command: Option<String>,
    observed_stage: Option<SimulatedStage>,
    trigger_positions: Vec<i32>,
}

/// Simulated optical spectrum analyzer.
///
/// Understands the ANDO AQ6315 command subset used by the sweep client and
/// queues one reply per query. A sweep reports busy for a configurable number
/// of `SWEEP?` polls after each `SGL`.
#[derive(Clone)]
pub struct SimulatedOsa {
    state: Arc<Mutex<OsaSim>>,
}

impl SimulatedOsa {
    /// Analyzer with 101-sample traces around 1550 nm, busy for two polls
    /// per sweep, log scale, trace A active.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(OsaSim {
                replies: VecDeque::new(),
                commands: Vec::new(),
                busy_polls: 2,
                busy_remaining: 0,
                stays_busy: false,
                sweeps: 0,
                active_trace: 0,
                sensitivity: "SNAT".to_string(),
                samples: 101,
                level_samples: None,
                center_nm: 1550.0,
                span_nm: 20.0,
                decimal_digits: 3,
                log_scale: true,
                density: false,
                identity: b"ANDO\xb0ELECTRIC,AQ6315E,0,01.02\r\n".to_vec(),
                failing_command: None,
                observed_stage: None,
                trigger_positions: Vec::new(),
            })),
        }
    }

    /// Number of samples per trace.
    pub fn with_samples(self, samples: usize) -> Self {
        self.lock().samples = samples;
        self
    }

    /// Wavelength span in nm.
    pub fn with_span(self, span_nm: f64) -> Self {
        self.lock().span_nm = span_nm;
        self
    }

    /// Record the position of `stage` whenever a sweep is triggered.
    pub fn observing(self, stage: SimulatedStage) -> Self {
        self.lock().observed_stage = Some(stage);
        self
    }

    /// Return a level array of a different length than the wavelength array.
    pub fn with_level_samples(self, samples: usize) -> Self {
        self.lock().level_samples = Some(samples);
        self
    }

    /// Number of `SWEEP?` polls that report busy after each trigger.
    pub fn with_busy_polls(self, polls: u32) -> Self {
        self.lock().busy_polls = polls;
        self
    }

    /// Select the active trace (0 = A, 1 = B, 2 = C).
    pub fn with_active_trace(self, trace: u8) -> Self {
        self.lock().active_trace = trace;
        self
    }

    /// Report linear (W) levels instead of dBm.
    pub fn with_linear_scale(self) -> Self {
        self.lock().log_scale = false;
        self
    }

    /// Report levels as a per-nm density.
    pub fn with_density(self) -> Self {
        self.lock().density = true;
        self
    }

    /// Never finish a sweep.
    pub fn stays_busy(self) -> Self {
        self.lock().stays_busy = true;
        self
    }

    /// Fail writes of `command` as a broken bus would.
    pub fn failing_on(self, command: &str) -> Self {
        self.lock().failing_command = Some(command.to_string());
        self
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Number of sweeps triggered.
    pub fn sweeps(&self) -> u32 {
        self.lock().sweeps
    }

    /// Position of the observed stage at each `SGL`, in order.
    pub fn trigger_positions(&self) -> Vec<i32> {
        self.lock().trigger_positions.clone()
    }

    /// Last sensitivity code received.
    pub fn sensitivity(&self) -> String {
        self.lock().sensitivity.clone()
    }

    fn lock(&self) -> MutexGuard<'_, OsaSim> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimulatedOsa {
    fn default() -> Self {
        Self::new()
    }
}

impl OsaSim {
    fn trace_letter(&self) -> char {
        match self.active_trace {
            1 => 'B',
            2 => 'C',
            _ => 'A',
        }
    }

    fn wavelengths(&self) -> Vec<f64> {
        let n = self.samples.max(1);
        let start = self.center_nm - self.span_nm / 2.0;
        let step = if n > 1 {
            self.span_nm / (n - 1) as f64
        } else {
            0.0
        };
        (0..n).map(|i| start + step * i as f64).collect()
    }

    fn levels(&self) -> Vec<f64> {
        let mut rng = rand::thread_rng();
        let width = self.span_nm / 10.0;
        let mut wavelengths = self.wavelengths();
        wavelengths.resize(self.level_samples.unwrap_or(self.samples), self.center_nm);
        wavelengths
            .iter()
            .map(|wl| {
                let offset = (wl - self.center_nm) / width;
                let dbm = -60.0 + 50.0 * (-offset * offset / 2.0).exp() + rng.gen_range(-0.2..0.2);
                if self.log_scale {
                    dbm
                } else {
                    10f64.powf(dbm / 10.0) * 1e-3
                }
            })
            .collect()
    }

    // Wavelengths always carry three decimals; LDTDIG only affects levels.
    fn format_wavelengths(&self, values: &[f64]) -> Vec<u8> {
        array_reply(values.iter().map(|v| format!("{v:.3}")))
    }

    fn format_levels(&self, values: &[f64]) -> Vec<u8> {
        let digits = self.decimal_digits;
        if self.log_scale {
            array_reply(values.iter().map(|v| format!("{v:.digits$}")))
        } else {
            array_reply(values.iter().map(|v| format!("{v:.3E}")))
        }
    }

    fn handle(&mut self, command: &str) -> Result<Option<Vec<u8>>> {
        let text = |s: String| Some(format!("{s}\r\n").into_bytes());
        let trace = self.trace_letter();

        let reply = match command {
            "SNHD" | "SNAT" | "SHI1" | "SHI2" | "SHI3" => {
                self.sensitivity = command.to_string();
                None
            }
            "SGL" => {
                if let Some(stage) = &self.observed_stage {
                    self.trigger_positions.push(stage.position_now());
                }
                self.sweeps += 1;
                self.busy_remaining = self.busy_polls;
                None
            }
            "SWEEP?" => {
                if self.stays_busy {
                    text("1".to_string())
                } else if self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                    text("1".to_string())
                } else {
                    text("0".to_string())
                }
            }
            "ACTV?" => text(self.active_trace.to_string()),
            "*IDN?" => Some(self.identity.clone()),
            "LSCL?" => text(if self.log_scale { "10.0" } else { "0" }.to_string()),
            "LSUNT?" => text(if self.density { "1" } else { "0" }.to_string()),
            cmd if cmd.starts_with("LDTDIG") => {
                self.decimal_digits = cmd["LDTDIG".len()..]
                    .parse()
                    .map_err(|_| anyhow!("bad LDTDIG argument: {cmd}"))?;
                None
            }
            cmd if cmd == format!("ST{trace}?") => text(format!(
                "{:.2},{:.2},-10.0,10.0,0.05,1,{},{},SGL,TRACE",
                self.center_nm, self.span_nm, self.samples, self.sensitivity
            )),
            cmd if cmd == format!("WDAT{trace}") => {
                Some(self.format_wavelengths(&self.wavelengths()))
            }
            cmd if cmd == format!("LDAT{trace}") => Some(self.format_levels(&self.levels())),
            other => bail!("simulated OSA does not understand {other:?}"),
        };
        Ok(reply)
    }
}

fn array_reply(fields: impl ExactSizeIterator<Item = String>) -> Vec<u8> {
    let mut reply = fields.len().to_string();
    for field in fields {
        reply.push(',');
        reply.push_str(&field);
    }
    reply.push_str("\r\n");
    reply.into_bytes()
}

#[async_trait]
impl InstrumentChannel for SimulatedOsa {
    async fn write(&mut self, command: &str) -> Result<()> {
        let mut sim = self.lock();
        sim.commands.push(command.to_string());
        if sim.failing_command.as_deref() == Some(command) {
            bail!("simulated bus error writing {command}");
        }
        if let Some(reply) = sim.handle(command)? {
            sim.replies.push_back(reply);
        }
        Ok(())
    }

    async fn read_raw(&mut self) -> Result<Vec<u8>> {
        self.lock()
            .replies
            .pop_front()
            .ok_or_else(|| anyhow!("read timed out: no reply pending"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stage_homes_after_configured_polls() {
        let mut sim = SimulatedStage::new().with_homing_polls(2);
        sim.open(SimulatedStage::DEFAULT_SERIAL).await.unwrap();
        sim.home().await.unwrap();

        sim.request_status().await.unwrap();
        assert_eq!(sim.status_bits().await.unwrap(), STATUS_ENABLED | STATUS_HOMING);
        sim.request_status().await.unwrap();
        assert_eq!(sim.status_bits().await.unwrap(), 0x8000_0400);
    }

    #[tokio::test]
    async fn stage_steps_toward_target() {
        let mut sim = SimulatedStage::new().with_units_per_update(100);
        sim.open(SimulatedStage::DEFAULT_SERIAL).await.unwrap();
        sim.move_to(250).await.unwrap();

        sim.request_status().await.unwrap();
        assert_eq!(sim.position().await.unwrap(), 100);
        sim.request_status().await.unwrap();
        sim.request_status().await.unwrap();
        assert_eq!(sim.position().await.unwrap(), 250);
        assert_eq!(sim.move_commands(), vec![250]);
    }

    #[tokio::test]
    async fn stage_rejects_commands_when_closed() {
        let mut sim = SimulatedStage::new();
        assert!(sim.move_to(10).await.is_err());
        sim.close();
        assert_eq!(sim.close_count(), 0);
    }

    #[tokio::test]
    async fn osa_reports_busy_then_idle() {
        let mut osa = SimulatedOsa::new().with_busy_polls(1);
        osa.write("SGL").await.unwrap();
        assert_eq!(osa.query("SWEEP?").await.unwrap(), "1");
        assert_eq!(osa.query("SWEEP?").await.unwrap(), "0");
        assert_eq!(osa.sweeps(), 1);
    }

    #[tokio::test]
    async fn osa_arrays_carry_sample_count_prefix() {
        let mut osa = SimulatedOsa::new().with_samples(5);
        let reply = osa.query("WDATA").await.unwrap();
        let fields: Vec<&str> = reply.split(',').collect();
        assert_eq!(fields[0], "5");
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[1], "1540.000");
    }

    #[tokio::test]
    async fn osa_level_digits_leave_wavelengths_alone() {
        let mut osa = SimulatedOsa::new().with_samples(3);
        osa.write("LDTDIG1").await.unwrap();
        let wavelengths = osa.query("WDATA").await.unwrap();
        assert_eq!(wavelengths, "3,1540.000,1550.000,1560.000");
        let levels = osa.query("LDATA").await.unwrap();
        for field in levels.split(',').skip(1) {
            assert_eq!(field.split('.').nth(1).map(str::len), Some(1), "{field}");
        }
    }

    #[tokio::test]
    async fn osa_records_stage_position_at_trigger() {
        let mut stage = SimulatedStage::new().with_position(1234);
        stage.open(SimulatedStage::DEFAULT_SERIAL).await.unwrap();
        let mut osa = SimulatedOsa::new().observing(stage.clone());
        osa.write("SGL").await.unwrap();
        stage.move_to(0).await.unwrap();
        stage.request_status().await.unwrap();
        osa.write("SGL").await.unwrap();
        assert_eq!(osa.trigger_positions(), vec![1234, 0]);
    }

    #[tokio::test]
    async fn osa_rejects_unknown_commands() {
        let mut osa = SimulatedOsa::new();
        assert!(osa.write("BOGUS").await.is_err());
        assert!(osa.read_raw().await.is_err());
    }
}
