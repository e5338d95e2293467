//! Custom error types for the sweep.
//!
//! `SweepError` is the single error type returned by the library. Device
//! backends report failures as `anyhow::Error`; the stage controller and the
//! sweep client wrap those into typed variants that name the operation that
//! failed, so the operator sees which step aborted the run.
//!
//! ## Error Hierarchy
//!
//! - **`Domain`**: a power outside the calibrated range, or a conversion that
//!   cannot be represented in device units. Raised while building the plan.
//! - **`DeviceNotFound`** / **`Connection`**: stage discovery and open failures.
//! - **`HomeTimeout`**, **`MoveTimeout`**, **`SweepTimeout`**: bounded polls
//!   that expired. Each carries the elapsed time and the last value observed.
//! - **`InstrumentCommunication`**: channel read/write failures and malformed
//!   replies from the spectrum analyzer.
//! - **`Config`** / **`Configuration`**: parsing and semantic validation of
//!   the configuration. **`FeatureNotEnabled`** when the configured backend
//!   was compiled out.
//!
//! No variant is retried. Every one of them aborts the run.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the sweep error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

/// Errors raised while planning or executing a power sweep.
#[derive(Error, Debug)]
pub enum SweepError {
    /// Value outside the domain of a unit conversion.
    #[error("Domain error: {0}")]
    Domain(String),

    /// No stage serial number could be discovered.
    #[error("No stage found. Is the stage plugged in and not held by another program?")]
    DeviceNotFound,

    /// Stage discovered but could not be opened.
    #[error("Failed to connect to stage {serial}: {message}")]
    Connection {
        /// Serial number that failed to open
        serial: String,
        /// Backend failure description
        message: String,
    },

    /// A move was requested before homing completed.
    #[error("Stage must be homed before issuing a move")]
    NotHomed,

    /// Stage operation failed outside of the timeout paths.
    #[error("Stage {operation} failed: {message}")]
    Stage {
        /// Operation that failed (e.g. "move", "position")
        operation: &'static str,
        /// Backend failure description
        message: String,
    },

    /// Homing did not reach the expected status word in time.
    #[error(
        "Stage homing timed out after {:.3} s (last status 0x{last_status:08X})",
        elapsed.as_secs_f64()
    )]
    HomeTimeout {
        /// Time spent polling
        elapsed: Duration,
        /// Last status bits read from the stage
        last_status: u32,
    },

    /// The stage did not settle at the target within the timeout.
    #[error(
        "Stage never reached {target} device units within {:.3} s (last position {last_position}); consider a longer move timeout",
        elapsed.as_secs_f64()
    )]
    MoveTimeout {
        /// Requested position in device units
        target: i32,
        /// Time spent polling
        elapsed: Duration,
        /// Last position read from the stage
        last_position: i32,
    },

    /// The spectrum analyzer stayed busy past the timeout.
    #[error("Instrument sweep did not complete within {:.3} s", elapsed.as_secs_f64())]
    SweepTimeout {
        /// Time spent polling
        elapsed: Duration,
    },

    /// Read/write failure or malformed reply on the instrument channel.
    #[error("Instrument communication failed during {operation}: {message}")]
    InstrumentCommunication {
        /// Operation that failed (e.g. "trigger sweep", "read trace")
        operation: &'static str,
        /// Failure description
        message: String,
    },

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The configured backend was compiled out.
    #[error("Feature '{0}' is not enabled. Rebuild with --features {0}")]
    FeatureNotEnabled(String),

    /// Filesystem failure while recording the run.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SweepError {
    /// Wrap a channel failure with the operation it interrupted.
    pub fn instrument(operation: &'static str, err: impl std::fmt::Display) -> Self {
        SweepError::InstrumentCommunication {
            operation,
            message: format!("{err:#}"),
        }
    }

    /// Wrap a stage backend failure with the operation it interrupted.
    pub fn stage(operation: &'static str, err: impl std::fmt::Display) -> Self {
        SweepError::Stage {
            operation,
            message: format!("{err:#}"),
        }
    }
}

impl From<csv::Error> for SweepError {
    fn from(value: csv::Error) -> Self {
        match value.into_kind() {
            csv::ErrorKind::Io(err) => SweepError::Io(err),
            other => SweepError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{other:?}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_timeout_names_diagnostics() {
        let err = SweepError::MoveTimeout {
            target: 1200,
            elapsed: Duration::from_millis(20_000),
            last_position: 17,
        };
        let msg = err.to_string();
        assert!(msg.contains("1200"));
        assert!(msg.contains("20.000"));
        assert!(msg.contains("17"));
    }

    #[test]
    fn home_timeout_formats_status_as_hex() {
        let err = SweepError::HomeTimeout {
            elapsed: Duration::from_secs(3),
            last_status: 0x8000_0010,
        };
        assert!(err.to_string().contains("0x80000010"));
    }

    #[test]
    fn instrument_helper_keeps_context_chain() {
        let inner = anyhow::anyhow!("bus timeout").context("reading SWEEP?");
        let err = SweepError::instrument("wait for completion", inner);
        match err {
            SweepError::InstrumentCommunication { operation, message } => {
                assert_eq!(operation, "wait for completion");
                assert!(message.contains("reading SWEEP?"));
                assert!(message.contains("bus timeout"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
