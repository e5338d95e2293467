//! Device Contracts
//!
//! The sweep talks to exactly two devices, each through a small trait:
//!
//! - [`MotorController`] - the rotation stage's driver interface
//! - [`InstrumentChannel`] - the request/response text link to the spectrum analyzer
//!
//! Controllers own their device exclusively, so every method takes `&mut self`.
//! Backends report failures with `anyhow::Result`; the stage controller and the
//! sweep client turn those into typed [`SweepError`](crate::error::SweepError)s.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn park<M: MotorController>(stage: &mut M) -> Result<i32> {
//!     stage.move_to(0).await?;
//!     stage.request_status().await?;
//!     stage.position().await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Motor parameters reported by a stage backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorParams {
    /// Full steps per motor revolution
    pub steps_per_rev: f64,
    /// Gearbox reduction ratio
    pub gearbox_ratio: f64,
    /// Degrees of output rotation per gearbox output revolution
    pub pitch: f64,
}

impl Default for MotorParams {
    /// Thorlabs K10CR1 values.
    fn default() -> Self {
        Self {
            steps_per_rev: 200.0,
            gearbox_ratio: 120.0,
            pitch: 360.0,
        }
    }
}

/// Motor-controller driver interface.
///
/// # Contract
/// - Positions are in device units (microsteps)
/// - `move_to` and `home` start motion and return; completion is observed by
///   polling `request_status` followed by `position` or `status_bits`
/// - `close` must be safe to call on a handle that is closed or was never opened
#[async_trait]
pub trait MotorController: Send {
    /// Serial numbers of all attached stages.
    async fn list_serial_numbers(&mut self) -> Result<Vec<String>>;

    /// Open the stage with the given serial number.
    async fn open(&mut self, serial: &str) -> Result<()>;

    /// Release the device handle.
    fn close(&mut self);

    /// Start the backend's status polling at `interval`.
    async fn start_polling(&mut self, interval: Duration) -> Result<()>;

    /// Load the device's persisted settings.
    async fn load_settings(&mut self) -> Result<()>;

    /// Begin homing.
    async fn home(&mut self) -> Result<()>;

    /// Ask the device to refresh its cached status.
    async fn request_status(&mut self) -> Result<()>;

    /// Status word from the most recent status update.
    async fn status_bits(&mut self) -> Result<u32>;

    /// Begin an absolute move.
    async fn move_to(&mut self, position: i32) -> Result<()>;

    /// Position from the most recent status update.
    async fn position(&mut self) -> Result<i32>;

    /// Motor parameters used to derive the angle conversion factor.
    async fn motor_params(&mut self) -> Result<MotorParams>;
}

/// Request/response text channel to an instrument.
///
/// Commands are sent without terminators; implementations add their own.
#[async_trait]
pub trait InstrumentChannel: Send {
    /// Send a command that produces no reply.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Read one reply as raw bytes.
    async fn read_raw(&mut self) -> Result<Vec<u8>>;

    /// Send a command and read its reply as trimmed text.
    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        let raw = self.read_raw().await?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }
}

#[async_trait]
impl<M: MotorController + ?Sized> MotorController for Box<M> {
    async fn list_serial_numbers(&mut self) -> Result<Vec<String>> {
        (**self).list_serial_numbers().await
    }

    async fn open(&mut self, serial: &str) -> Result<()> {
        (**self).open(serial).await
    }

    fn close(&mut self) {
        (**self).close()
    }

    async fn start_polling(&mut self, interval: Duration) -> Result<()> {
        (**self).start_polling(interval).await
    }

    async fn load_settings(&mut self) -> Result<()> {
        (**self).load_settings().await
    }

    async fn home(&mut self) -> Result<()> {
        (**self).home().await
    }

    async fn request_status(&mut self) -> Result<()> {
        (**self).request_status().await
    }

    async fn status_bits(&mut self) -> Result<u32> {
        (**self).status_bits().await
    }

    async fn move_to(&mut self, position: i32) -> Result<()> {
        (**self).move_to(position).await
    }

    async fn position(&mut self) -> Result<i32> {
        (**self).position().await
    }

    async fn motor_params(&mut self) -> Result<MotorParams> {
        (**self).motor_params().await
    }
}

#[async_trait]
impl<C: InstrumentChannel + ?Sized> InstrumentChannel for Box<C> {
    async fn write(&mut self, command: &str) -> Result<()> {
        (**self).write(command).await
    }

    async fn read_raw(&mut self) -> Result<Vec<u8>> {
        (**self).read_raw().await
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        (**self).query(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoChannel {
        last: Vec<u8>,
    }

    #[async_trait]
    impl InstrumentChannel for EchoChannel {
        async fn write(&mut self, command: &str) -> Result<()> {
            self.last = format!("{command}\r\n").into_bytes();
            Ok(())
        }

        async fn read_raw(&mut self) -> Result<Vec<u8>> {
            Ok(std::mem::take(&mut self.last))
        }
    }

    #[tokio::test]
    async fn default_query_trims_reply() {
        let mut channel = EchoChannel { last: Vec::new() };
        assert_eq!(channel.query("SWEEP?").await.unwrap(), "SWEEP?");
    }

    #[tokio::test]
    async fn boxed_channel_forwards() {
        let mut channel: Box<dyn InstrumentChannel> = Box::new(EchoChannel { last: Vec::new() });
        assert_eq!(channel.query("ACTV?").await.unwrap(), "ACTV?");
    }

    #[test]
    fn default_motor_params_match_k10cr1() {
        let params = MotorParams::default();
        assert_eq!(params.steps_per_rev, 200.0);
        assert_eq!(params.gearbox_ratio, 120.0);
        assert_eq!(params.pitch, 360.0);
    }
}
