//! Sweep plan: the ordered target powers and the angles that produce them.

use crate::conversion::{angle_from_power, Calibration};
use crate::error::{AppResult, SweepError};
use serde::{Deserialize, Serialize};

/// One planned measurement point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlannedPoint {
    /// Zero-based position in the plan
    pub index: usize,
    /// Target optical power
    pub power: f64,
    /// Rotation angle in degrees that yields `power`
    pub angle_deg: f64,
}

/// Ordered sequence of target powers, linearly spaced from max to min.
///
/// Created once at run start and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPlan {
    calibration: Calibration,
    points: Vec<PlannedPoint>,
}

impl SweepPlan {
    /// Build a plan of `num_points` powers from `max_power` down to `min_power`.
    ///
    /// Endpoints are exact. A single-point plan holds only `max_power`.
    ///
    /// # Errors
    /// `Configuration` for an empty plan or invalid calibration, `Domain` if a
    /// planned power falls outside the calibrated range.
    pub fn linear(calibration: Calibration, num_points: usize) -> AppResult<Self> {
        calibration.validate()?;
        if num_points == 0 {
            return Err(SweepError::Configuration(
                "num_points must be at least 1".to_string(),
            ));
        }

        let points = linspace(calibration.max_power, calibration.min_power, num_points)
            .into_iter()
            .enumerate()
            .map(|(index, power)| {
                Ok(PlannedPoint {
                    index,
                    power,
                    angle_deg: angle_from_power(power, &calibration)?,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            calibration,
            points,
        })
    }

    /// Calibration the plan was derived from.
    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Planned points in execution order.
    pub fn points(&self) -> &[PlannedPoint] {
        &self.points
    }

    /// Number of planned points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when the plan holds no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    if num == 1 {
        return vec![start];
    }
    let step = (stop - start) / (num - 1) as f64;
    (0..num)
        .map(|i| if i == num - 1 { stop } else { start + step * i as f64 })
        .collect()
}
