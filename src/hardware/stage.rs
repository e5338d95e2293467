//! Rotation Stage Controller
//!
//! Owns the motor-controller handle and enforces the stage lifecycle:
//!
//! ```text
//! Disconnected -> Connected -> Homed -> Ready
//!                                ^        |
//!                                +--------+  (each completed move)
//! ```
//!
//! Homing and moves start motion and then poll the device until the expected
//! status or position is observed. Both polls are bounded: the caller gets a
//! `HomeTimeout` or `MoveTimeout` instead of a hang.
//!
//! The handle is released by [`StageController::close`] and again on drop,
//! so error paths and cancelled futures never leak an open stage.

use crate::config::StageConfig;
use crate::conversion::conversion_factor;
use crate::error::{AppResult, SweepError};
use crate::hardware::capabilities::MotorController;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

/// Lifecycle of the stage handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageLifecycle {
    /// No device handle open
    Disconnected,
    /// Handle open, polling started, not yet homed
    Connected,
    /// Homing completed; moves are allowed
    Homed,
    /// Last move settled within tolerance
    Ready,
}

/// Snapshot of the stage controller's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageState {
    /// Device handle is open
    pub connected: bool,
    /// Homing has completed on this connection
    pub homed: bool,
    /// Last polled position in device units
    pub current_position_units: Option<i32>,
}

/// Blocking, closed-loop controller for the rotation stage.
pub struct StageController<M: MotorController> {
    device: M,
    settings: StageConfig,
    lifecycle: StageLifecycle,
    serial: Option<String>,
    last_position: Option<i32>,
}

impl<M: MotorController> StageController<M> {
    /// Wrap a motor-controller backend. No device I/O happens until
    /// [`connect`](Self::connect).
    pub fn new(device: M, settings: StageConfig) -> Self {
        Self {
            device,
            settings,
            lifecycle: StageLifecycle::Disconnected,
            serial: None,
            last_position: None,
        }
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> StageLifecycle {
        self.lifecycle
    }

    /// Snapshot of connection, homing and position.
    pub fn state(&self) -> StageState {
        StageState {
            connected: self.lifecycle != StageLifecycle::Disconnected,
            homed: matches!(
                self.lifecycle,
                StageLifecycle::Homed | StageLifecycle::Ready
            ),
            current_position_units: self.last_position,
        }
    }

    /// Serial number of the connected stage.
    pub fn serial_number(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Settings the controller was built with.
    pub fn settings(&self) -> &StageConfig {
        &self.settings
    }

    /// Last polled position in device units. Does not touch the device.
    pub fn current_position_units(&self) -> Option<i32> {
        self.last_position
    }

    /// Discover and open the stage, then start status polling and load its
    /// settings.
    ///
    /// Uses the configured serial number when present, otherwise the first
    /// stage listed by the backend.
    ///
    /// # Errors
    /// `DeviceNotFound` if no (matching) stage is listed, `Connection` if the
    /// stage cannot be opened or initialized.
    #[instrument(skip(self))]
    pub async fn connect(&mut self) -> AppResult<()> {
        let serials = self.device.list_serial_numbers().await.map_err(|e| {
            warn!(error = %e, "Failed to enumerate stages");
            SweepError::DeviceNotFound
        })?;
        debug!(?serials, "Stage enumeration");

        let serial = match &self.settings.serial_number {
            Some(wanted) if serials.iter().any(|s| s == wanted) => wanted.clone(),
            Some(wanted) => {
                warn!(serial = %wanted, "Configured stage not present");
                return Err(SweepError::DeviceNotFound);
            }
            None => serials.first().cloned().ok_or(SweepError::DeviceNotFound)?,
        };

        // A previous run may have left the handle open.
        self.device.close();

        let connection_error = |e: anyhow::Error| SweepError::Connection {
            serial: serial.clone(),
            message: format!("{e:#}"),
        };
        self.device.open(&serial).await.map_err(connection_error)?;
        self.lifecycle = StageLifecycle::Connected;
        self.serial = Some(serial.clone());

        self.device
            .start_polling(self.settings.status_poll_interval)
            .await
            .map_err(connection_error)?;
        self.device.load_settings().await.map_err(connection_error)?;

        info!(serial = %serial, "Stage connected");
        Ok(())
    }

    /// Home the stage and wait until the device reports the configured
    /// homed status word.
    ///
    /// # Errors
    /// `HomeTimeout` if the status word is not observed within
    /// `home_timeout`.
    #[instrument(skip(self))]
    pub async fn home(&mut self) -> AppResult<()> {
        if self.lifecycle == StageLifecycle::Disconnected {
            return Err(SweepError::stage("home", "stage is not connected"));
        }

        info!("Homing...");
        self.device
            .home()
            .await
            .map_err(|e| SweepError::stage("home", e))?;

        let start = Instant::now();
        sleep(self.settings.home_settle).await;

        loop {
            self.device
                .request_status()
                .await
                .map_err(|e| SweepError::stage("request status", e))?;
            let status = self
                .device
                .status_bits()
                .await
                .map_err(|e| SweepError::stage("status bits", e))?;

            if status == self.settings.homed_status {
                break;
            }

            let elapsed = start.elapsed();
            if elapsed >= self.settings.home_timeout {
                return Err(SweepError::HomeTimeout {
                    elapsed,
                    last_status: status,
                });
            }
            debug!(status = format_args!("0x{status:08X}"), "Still homing");
            sleep(self.settings.home_poll_interval).await;
        }

        self.last_position = Some(
            self.device
                .position()
                .await
                .map_err(|e| SweepError::stage("position", e))?,
        );
        self.lifecycle = StageLifecycle::Homed;
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "Stage homed");
        Ok(())
    }

    /// Device units per degree, from the stage's motor parameters.
    pub async fn conversion_factor(&mut self) -> AppResult<f64> {
        let params = self
            .device
            .motor_params()
            .await
            .map_err(|e| SweepError::stage("motor params", e))?;
        let factor = conversion_factor(
            params.steps_per_rev,
            self.settings.microsteps_per_fullstep,
            params.gearbox_ratio,
            params.pitch,
        )?;
        debug!(?params, factor, "Conversion factor");
        Ok(factor)
    }

    /// Move to `target` device units and block until the stage is within
    /// `tolerance` of it.
    ///
    /// Returns the settled position.
    ///
    /// # Errors
    /// `NotHomed` before homing, `MoveTimeout` if the stage has not settled
    /// when `timeout` expires.
    #[instrument(skip(self))]
    pub async fn move_to(
        &mut self,
        target: i32,
        timeout: std::time::Duration,
        poll_interval: std::time::Duration,
        tolerance: i32,
    ) -> AppResult<i32> {
        if !matches!(
            self.lifecycle,
            StageLifecycle::Homed | StageLifecycle::Ready
        ) {
            return Err(SweepError::NotHomed);
        }

        self.device
            .request_status()
            .await
            .map_err(|e| SweepError::stage("request status", e))?;
        self.device
            .move_to(target)
            .await
            .map_err(|e| SweepError::stage("move", e))?;

        let start = Instant::now();
        let mut last_position = self.last_position.unwrap_or_default();

        while start.elapsed() < timeout {
            self.device
                .request_status()
                .await
                .map_err(|e| SweepError::stage("request status", e))?;
            let position = self
                .device
                .position()
                .await
                .map_err(|e| SweepError::stage("position", e))?;
            last_position = position;
            self.last_position = Some(position);

            if (i64::from(position) - i64::from(target)).abs() < i64::from(tolerance) {
                self.lifecycle = StageLifecycle::Ready;
                debug!(position, elapsed_ms = start.elapsed().as_millis() as u64, "Settled");
                return Ok(position);
            }
            sleep(poll_interval).await;
        }

        Err(SweepError::MoveTimeout {
            target,
            elapsed: start.elapsed(),
            last_position,
        })
    }

    /// Release the device handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.lifecycle == StageLifecycle::Disconnected {
            return;
        }
        self.device.close();
        self.lifecycle = StageLifecycle::Disconnected;
        info!(serial = ?self.serial, "Stage connection closed");
    }
}

impl<M: MotorController> Drop for StageController<M> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedStage;
    use std::time::Duration;

    fn settings() -> StageConfig {
        StageConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn move_before_home_is_refused() {
        let sim = SimulatedStage::new();
        let mut stage = StageController::new(sim.clone(), settings());
        stage.connect().await.unwrap();

        let err = stage
            .move_to(1000, Duration::from_secs(1), Duration::from_millis(10), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::NotHomed));
        assert!(sim.move_commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_progresses_to_ready() {
        let sim = SimulatedStage::new();
        let mut stage = StageController::new(sim.clone(), settings());
        assert_eq!(stage.lifecycle(), StageLifecycle::Disconnected);

        stage.connect().await.unwrap();
        assert_eq!(stage.lifecycle(), StageLifecycle::Connected);
        assert_eq!(stage.serial_number(), Some(SimulatedStage::DEFAULT_SERIAL));

        stage.home().await.unwrap();
        assert_eq!(stage.lifecycle(), StageLifecycle::Homed);
        assert_eq!(stage.current_position_units(), Some(0));

        let settled = stage
            .move_to(500_000, Duration::from_secs(20), Duration::from_millis(10), 1)
            .await
            .unwrap();
        assert_eq!(settled, 500_000);
        assert_eq!(stage.lifecycle(), StageLifecycle::Ready);
        assert!(stage.state().homed);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_safe_when_never_opened() {
        let sim = SimulatedStage::new();
        let mut stage = StageController::new(sim.clone(), settings());
        stage.close();
        stage.close();
        assert_eq!(sim.close_count(), 0);

        stage.connect().await.unwrap();
        stage.close();
        stage.close();
        assert!(!sim.is_open());
        assert_eq!(stage.lifecycle(), StageLifecycle::Disconnected);
    }

    #[tokio::test]
    async fn drop_releases_handle() {
        let sim = SimulatedStage::new();
        {
            let mut stage = StageController::new(sim.clone(), settings());
            stage.connect().await.unwrap();
            assert!(sim.is_open());
        }
        assert!(!sim.is_open());
    }

    #[tokio::test]
    async fn configured_serial_must_be_present() {
        let sim = SimulatedStage::new();
        let mut config = settings();
        config.serial_number = Some("99999999".to_string());
        let mut stage = StageController::new(sim, config);
        assert!(matches!(
            stage.connect().await,
            Err(SweepError::DeviceNotFound)
        ));
    }

    #[tokio::test]
    async fn open_failure_is_a_connection_error() {
        let sim = SimulatedStage::new().failing_open();
        let mut stage = StageController::new(sim, settings());
        match stage.connect().await {
            Err(SweepError::Connection { serial, .. }) => {
                assert_eq!(serial, SimulatedStage::DEFAULT_SERIAL);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(stage.lifecycle(), StageLifecycle::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn conversion_factor_uses_reported_params() {
        let sim = SimulatedStage::new();
        let mut stage = StageController::new(sim, settings());
        stage.connect().await.unwrap();
        let factor = stage.conversion_factor().await.unwrap();
        assert!((factor - 136_533.333).abs() < 1e-2);
    }
}
