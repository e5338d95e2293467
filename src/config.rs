//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the lab's K10CR1 + ANDO AQ6315 setup)
//! 2. `config/sweep.toml` (or the file passed with `--config`)
//! 3. Environment variables prefixed with `SWEEP_`, `__` separating levels
//!
//! # Example
//! ```no_run
//! use power_sweep::config::SweepConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // SWEEP_SWEEP__NUM_POINTS=20 overrides sweep.num_points
//! let config = SweepConfig::load()?;
//! config.validate()?;
//! println!("{} points", config.sweep.num_points);
//! # Ok(())
//! # }
//! ```

use crate::conversion::{Calibration, DEFAULT_MICROSTEPS_PER_FULLSTEP};
use crate::error::{AppResult, SweepError};
use crate::hardware::capabilities::MotorParams;
use crate::hardware::osa::Sensitivity;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/sweep.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Power/angle calibration
    pub calibration: Calibration,
    /// Sweep plan settings
    pub sweep: PlanConfig,
    /// Rotation stage
    pub stage: StageConfig,
    /// Spectrum analyzer
    pub instrument: InstrumentConfig,
    /// Run directory layout
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Power Sweep".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Sweep plan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Number of power levels between max and min power
    pub num_points: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self { num_points: 150 }
    }
}

/// Stage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageBackend {
    /// Thorlabs APT protocol over USB serial
    Apt,
    /// In-memory simulation
    Simulated,
}

/// Rotation stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Backend driving the stage
    pub backend: StageBackend,
    /// Serial number to open; first discovered stage when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// Serial port path; discovered from the serial number when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Backend status polling interval
    #[serde(with = "humantime_serde")]
    pub status_poll_interval: Duration,
    /// Maximum time to wait for homing
    #[serde(with = "humantime_serde")]
    pub home_timeout: Duration,
    /// Interval between homing status polls
    #[serde(with = "humantime_serde")]
    pub home_poll_interval: Duration,
    /// Delay between the home command and the first status poll
    #[serde(with = "humantime_serde")]
    pub home_settle: Duration,
    /// Status word reported once homing has completed
    pub homed_status: u32,
    /// Maximum time to wait for a move to settle
    #[serde(with = "humantime_serde")]
    pub move_timeout: Duration,
    /// Interval between position polls during a move
    #[serde(with = "humantime_serde")]
    pub move_poll_interval: Duration,
    /// A move is settled when |position - target| is below this
    pub tolerance_units: i32,
    /// Microsteps per full step
    pub microsteps_per_fullstep: f64,
    /// Motor parameters reported by the APT backend
    pub motor: MotorParams,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            backend: StageBackend::Apt,
            serial_number: None,
            port: None,
            status_poll_interval: Duration::from_millis(20),
            home_timeout: Duration::from_secs(120),
            home_poll_interval: Duration::from_secs(1),
            home_settle: Duration::from_millis(500),
            homed_status: 0x8000_0400,
            move_timeout: Duration::from_secs(20),
            move_poll_interval: Duration::from_millis(10),
            tolerance_units: 1,
            microsteps_per_fullstep: DEFAULT_MICROSTEPS_PER_FULLSTEP,
            motor: MotorParams::default(),
        }
    }
}

/// Instrument backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentBackend {
    /// Prologix GPIB-USB controller
    Prologix,
    /// VISA resource (feature `instrument_visa`)
    Visa,
    /// In-memory simulation
    Simulated,
}

/// Spectrum analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Backend carrying the command channel
    pub backend: InstrumentBackend,
    /// Serial port of the Prologix controller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// GPIB primary address of the analyzer
    pub gpib_address: u8,
    /// VISA resource string
    pub resource: String,
    /// Read timeout for one Prologix reply; open timeout for VISA sessions
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Receiver sensitivity
    pub sensitivity: Sensitivity,
    /// Interval between `SWEEP?` polls
    #[serde(with = "humantime_serde")]
    pub sweep_poll_interval: Duration,
    /// Sweep completion timeout; derived from the sensitivity when unset
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub sweep_timeout: Option<Duration>,
    /// Decimal digits of the level data (`LDTDIG`, 0 to 3)
    pub decimal_digits: u8,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            backend: InstrumentBackend::Prologix,
            port: None,
            gpib_address: 20,
            resource: "GPIB0::20::INSTR".to_string(),
            io_timeout: Duration::from_secs(5),
            sensitivity: Sensitivity::NormAuto,
            sweep_poll_interval: Duration::from_millis(200),
            sweep_timeout: None,
            decimal_digits: 3,
        }
    }
}

impl InstrumentConfig {
    /// Configured sweep timeout, or the sensitivity-derived default.
    pub fn effective_sweep_timeout(&self) -> Duration {
        self.sweep_timeout
            .unwrap_or_else(|| self.sensitivity.default_sweep_timeout())
    }
}

/// Run directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory under which dated run directories are created
    pub output_dir: PathBuf,
    /// Instrument name written to the run manifest
    pub instrument_label: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            instrument_label: "ANDO".to_string(),
        }
    }
}

impl SweepConfig {
    /// Load configuration from `config/sweep.toml` and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::from(Serialized::defaults(SweepConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SWEEP_").split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SweepError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.calibration.validate()?;

        if self.sweep.num_points == 0 {
            return Err(SweepError::Configuration(
                "sweep.num_points must be at least 1".to_string(),
            ));
        }

        if self.instrument.sensitivity == Sensitivity::NormHold {
            return Err(SweepError::Configuration(
                "instrument.sensitivity 'norm_hold' cannot be used for sweeps".to_string(),
            ));
        }

        if self.instrument.decimal_digits > 3 {
            return Err(SweepError::Configuration(format!(
                "instrument.decimal_digits must be between 0 and 3, got {}",
                self.instrument.decimal_digits
            )));
        }

        if self.stage.tolerance_units < 1 {
            return Err(SweepError::Configuration(format!(
                "stage.tolerance_units must be at least 1, got {}",
                self.stage.tolerance_units
            )));
        }

        let intervals = [
            ("stage.move_poll_interval", self.stage.move_poll_interval),
            ("stage.home_poll_interval", self.stage.home_poll_interval),
            ("instrument.sweep_poll_interval", self.instrument.sweep_poll_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(SweepError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if !(self.stage.microsteps_per_fullstep.is_finite()
            && self.stage.microsteps_per_fullstep > 0.0)
        {
            return Err(SweepError::Configuration(format!(
                "stage.microsteps_per_fullstep must be positive, got {}",
                self.stage.microsteps_per_fullstep
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_lab_setup() {
        let config = SweepConfig::default();
        assert_eq!(config.sweep.num_points, 150);
        assert_eq!(config.calibration.extinguish_angle_deg, 58.7);
        assert_eq!(config.stage.homed_status, 0x8000_0400);
        assert_eq!(config.stage.move_timeout, Duration::from_secs(20));
        assert_eq!(config.stage.tolerance_units, 1);
        assert_eq!(config.instrument.gpib_address, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = SweepConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.sweep.num_points, 150);
        assert_eq!(config.storage.instrument_label, "ANDO");
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[sweep]
num_points = 12

[stage]
backend = "simulated"
serial_number = "55000123"
move_timeout = "45s"

[instrument]
sensitivity = "high1"
sweep_timeout = "5m"
"#
        )
        .unwrap();

        let config = SweepConfig::load_from(file.path()).unwrap();
        assert_eq!(config.sweep.num_points, 12);
        assert_eq!(config.stage.backend, StageBackend::Simulated);
        assert_eq!(config.stage.serial_number.as_deref(), Some("55000123"));
        assert_eq!(config.stage.move_timeout, Duration::from_secs(45));
        assert_eq!(config.stage.home_timeout, Duration::from_secs(120));
        assert_eq!(config.instrument.sensitivity, Sensitivity::High1);
        assert_eq!(
            config.instrument.effective_sweep_timeout(),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn sweep_timeout_derives_from_sensitivity() {
        let mut config = InstrumentConfig::default();
        config.sensitivity = Sensitivity::High2;
        assert_eq!(
            config.effective_sweep_timeout(),
            Duration::from_secs(144 * 3 + 60)
        );
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = SweepConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = SweepConfig::default();
        config.sweep.num_points = 0;
        assert!(config.validate().is_err());

        let mut config = SweepConfig::default();
        config.instrument.sensitivity = Sensitivity::NormHold;
        assert!(config.validate().is_err());

        let mut config = SweepConfig::default();
        config.calibration.min_power = 200.0;
        assert!(config.validate().is_err());

        let mut config = SweepConfig::default();
        config.stage.move_poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = SweepConfig::default();
        config.instrument.decimal_digits = 4;
        assert!(config.validate().is_err());
        config.instrument.decimal_digits = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_serialize_to_toml() {
        let text = toml::to_string_pretty(&SweepConfig::default()).unwrap();
        assert!(text.contains("num_points = 150"));
        assert!(text.contains("move_timeout = \"20s\""));
        let parsed: SweepConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.instrument.resource, "GPIB0::20::INSTR");
    }
}
