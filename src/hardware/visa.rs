//! VISA instrument channel (feature `instrument_visa`).
//!
//! Supports resource strings like `GPIB0::20::INSTR` through an installed
//! VISA runtime. VISA I/O is synchronous and runs under
//! `tokio::task::block_in_place`.

use crate::hardware::capabilities::InstrumentChannel;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;
use tracing::{debug, info};
use visa_rs::prelude::*;

/// Instrument session opened through the default VISA resource manager.
pub struct VisaChannel {
    instrument: Instrument,
    // Closing the resource manager invalidates its sessions.
    _rm: DefaultRM,
    resource: String,
}

impl VisaChannel {
    /// Open `resource`, waiting at most `io_timeout` for the session.
    ///
    /// `io_timeout` bounds only the open. Reads and writes use the session's
    /// VISA timeout attribute (`VI_ATTR_TMO_VALUE`), which keeps the runtime
    /// default.
    pub fn open(resource: &str, io_timeout: Duration) -> Result<Self> {
        let rm = DefaultRM::new().context("Failed to open VISA resource manager")?;
        let name = CString::new(resource).context("VISA resource contains a NUL byte")?;
        let instrument = rm
            .open(&name.into(), AccessMode::NO_LOCK, io_timeout)
            .with_context(|| format!("Failed to open VISA resource {resource}"))?;
        info!(resource, "VISA session opened");
        Ok(Self {
            instrument,
            _rm: rm,
            resource: resource.to_string(),
        })
    }

    /// VISA resource string.
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

#[async_trait]
impl InstrumentChannel for VisaChannel {
    async fn write(&mut self, command: &str) -> Result<()> {
        debug!(command, "VISA write");
        let line = format!("{command}\n");
        tokio::task::block_in_place(|| self.instrument.write_all(line.as_bytes()))
            .with_context(|| format!("VISA write of {command} failed"))
    }

    async fn read_raw(&mut self) -> Result<Vec<u8>> {
        tokio::task::block_in_place(|| {
            let mut reply = Vec::new();
            BufReader::new(&self.instrument).read_until(b'\n', &mut reply)?;
            Ok::<_, std::io::Error>(reply)
        })
        .context("VISA read failed")
    }
}
