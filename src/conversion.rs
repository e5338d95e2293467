//! Unit conversion between optical power, half-wave-plate angle, and stage
//! device units.
//!
//! The power transmitted through a half-wave plate followed by a polarizer
//! follows `sin²(2θ)`. Inverting that relation gives the rotation angle for a
//! target power, measured from the extinguish angle (minimum transmission).

use crate::error::{AppResult, SweepError};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Microsteps per full step of the Thorlabs integrated stepper controller.
pub const DEFAULT_MICROSTEPS_PER_FULLSTEP: f64 = 2048.0;

/// Power ↔ angle calibration of the polarization stage.
///
/// Immutable for a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Angle (degrees) at which transmitted power is minimal
    pub extinguish_angle_deg: f64,
    /// Power measured at the extinguish angle
    pub min_power: f64,
    /// Maximum power through the half-wave plate
    pub max_power: f64,
}

impl Calibration {
    /// Check that the calibration describes a usable range.
    pub fn validate(&self) -> AppResult<()> {
        let values = [self.extinguish_angle_deg, self.min_power, self.max_power];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SweepError::Configuration(format!(
                "Calibration values must be finite: {:?}",
                self
            )));
        }
        if self.min_power >= self.max_power {
            return Err(SweepError::Configuration(format!(
                "min_power ({}) must be below max_power ({})",
                self.min_power, self.max_power
            )));
        }
        Ok(())
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            extinguish_angle_deg: 58.7,
            min_power: 2.5,
            max_power: 135.9,
        }
    }
}

/// Rotation angle in degrees that transmits `power`.
///
/// # Errors
/// `Domain` if `power` lies outside `[min_power, max_power]`.
pub fn angle_from_power(power: f64, cal: &Calibration) -> AppResult<f64> {
    if !power.is_finite() || power < cal.min_power || power > cal.max_power {
        return Err(SweepError::Domain(format!(
            "power {} outside calibrated range [{}, {}]",
            power, cal.min_power, cal.max_power
        )));
    }
    let fraction = (power - cal.min_power) / (cal.max_power - cal.min_power);
    Ok(-fraction.sqrt().asin() * (180.0 / PI) / 2.0 + cal.extinguish_angle_deg)
}

/// Device units per degree of rotation.
pub fn conversion_factor(
    steps_per_rev: f64,
    microsteps_per_fullstep: f64,
    gearbox_ratio: f64,
    pitch: f64,
) -> AppResult<f64> {
    if !(pitch.is_finite() && pitch > 0.0) {
        return Err(SweepError::Domain(format!("pitch must be positive, got {pitch}")));
    }
    let factor = steps_per_rev * microsteps_per_fullstep * gearbox_ratio / pitch;
    if !(factor.is_finite() && factor > 0.0) {
        return Err(SweepError::Domain(format!(
            "conversion factor must be positive, got {factor}"
        )));
    }
    Ok(factor)
}

/// Absolute device-unit position for `angle_deg`.
pub fn angle_to_device_units(angle_deg: f64, factor: f64) -> AppResult<i32> {
    let units = (angle_deg * factor).abs().round();
    if !units.is_finite() || units > f64::from(i32::MAX) {
        return Err(SweepError::Domain(format!(
            "{angle_deg}° at {factor} units/deg does not fit in device units"
        )));
    }
    Ok(units as i32)
}

/// Angle in degrees for a device-unit position.
pub fn device_units_to_angle(units: i32, factor: f64) -> f64 {
    f64::from(units) / factor
}
