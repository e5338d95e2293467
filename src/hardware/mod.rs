//! Hardware
//!
//! Device contracts, the controllers built on them, and their backends.
//!
//! - `capabilities`: `MotorController` and `InstrumentChannel` traits
//! - `stage`: closed-loop rotation stage controller
//! - `osa`: ANDO AQ6315 sweep client
//! - `mock`: simulated stage and analyzer
//! - `apt`, `prologix` (feature `instrument_serial`), `visa` (feature `instrument_visa`)

pub mod capabilities;
pub mod mock;
pub mod osa;
pub mod stage;

#[cfg(feature = "instrument_serial")]
pub mod apt;
#[cfg(feature = "instrument_serial")]
pub mod prologix;
#[cfg(feature = "instrument_visa")]
pub mod visa;

use crate::config::{InstrumentBackend, InstrumentConfig, StageBackend, StageConfig};
use crate::error::{AppResult, SweepError};
use capabilities::{InstrumentChannel, MotorController};
use mock::{SimulatedOsa, SimulatedStage};
use tracing::info;

/// Build the configured stage backend. The device is not opened yet.
pub fn stage_backend(config: &StageConfig) -> AppResult<Box<dyn MotorController>> {
    match config.backend {
        StageBackend::Simulated => {
            info!("Using simulated stage");
            Ok(Box::new(SimulatedStage::new().with_params(config.motor)))
        }
        #[cfg(feature = "instrument_serial")]
        StageBackend::Apt => Ok(Box::new(apt::AptStage::new(
            config.port.clone(),
            config.motor,
            std::time::Duration::from_secs(2),
        ))),
        #[cfg(not(feature = "instrument_serial"))]
        StageBackend::Apt => Err(SweepError::FeatureNotEnabled(
            "instrument_serial".to_string(),
        )),
    }
}

/// Open the configured instrument channel.
pub async fn open_instrument_channel(
    config: &InstrumentConfig,
) -> AppResult<Box<dyn InstrumentChannel>> {
    match config.backend {
        InstrumentBackend::Simulated => {
            info!("Using simulated spectrum analyzer");
            Ok(Box::new(SimulatedOsa::new()))
        }
        #[cfg(feature = "instrument_serial")]
        InstrumentBackend::Prologix => {
            let port = config.port.as_deref().ok_or_else(|| {
                SweepError::Configuration(
                    "instrument.port is required for the prologix backend".to_string(),
                )
            })?;
            let channel =
                prologix::PrologixChannel::open(port, config.gpib_address, config.io_timeout)
                    .await
                    .map_err(|e| SweepError::instrument("open", e))?;
            Ok(Box::new(channel))
        }
        #[cfg(not(feature = "instrument_serial"))]
        InstrumentBackend::Prologix => Err(SweepError::FeatureNotEnabled(
            "instrument_serial".to_string(),
        )),
        #[cfg(feature = "instrument_visa")]
        InstrumentBackend::Visa => {
            let channel = visa::VisaChannel::open(&config.resource, config.io_timeout)
                .map_err(|e| SweepError::instrument("open", e))?;
            Ok(Box::new(channel))
        }
        #[cfg(not(feature = "instrument_visa"))]
        InstrumentBackend::Visa => Err(SweepError::FeatureNotEnabled(
            "instrument_visa".to_string(),
        )),
    }
}
