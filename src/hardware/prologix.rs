//! Prologix GPIB-USB controller channel.
//!
//! The controller is a USB virtual COM port. Lines starting with `++` are
//! controller commands; everything else is forwarded to the addressed GPIB
//! device. With `++auto 0` the controller only reads from the device after
//! an explicit `++read eoi`.
//!
//! Data bytes that the controller would otherwise interpret (CR, LF, ESC
//! and `+`) are escaped with ESC.

use crate::hardware::capabilities::InstrumentChannel;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

const ESC: u8 = 27;

/// Escape `command` for transmission through the controller.
fn escape(command: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(command.len() + 1);
    for &b in command.as_bytes() {
        if matches!(b, b'\r' | b'\n' | ESC | b'+') {
            out.push(ESC);
        }
        out.push(b);
    }
    out.push(b'\n');
    out
}

/// GPIB device reached through a Prologix GPIB-USB controller.
pub struct PrologixChannel {
    port: BufReader<SerialStream>,
    address: u8,
    io_timeout: Duration,
}

impl PrologixChannel {
    /// Open the controller on `port_path` and address the device at
    /// `gpib_address`.
    pub async fn open(port_path: &str, gpib_address: u8, io_timeout: Duration) -> Result<Self> {
        if gpib_address > 30 {
            bail!("GPIB address {gpib_address} out of range 0-30");
        }
        let port = tokio_serial::new(port_path, 115_200)
            .open_native_async()
            .with_context(|| format!("Failed to open Prologix port {port_path}"))?;

        let mut channel = Self {
            port: BufReader::new(port),
            address: gpib_address,
            io_timeout,
        };
        for setup in ["mode 1", "auto 0", &format!("addr {gpib_address}"), "eoi 1"] {
            channel.controller(setup).await?;
        }
        info!(port = port_path, address = gpib_address, "Prologix controller ready");
        Ok(channel)
    }

    /// GPIB address of the device.
    pub fn address(&self) -> u8 {
        self.address
    }

    async fn controller(&mut self, command: &str) -> Result<()> {
        self.send(format!("++{command}\n").as_bytes()).await
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port.get_mut();
        port.write_all(bytes).await.context("Prologix write failed")?;
        port.flush().await.context("Prologix flush failed")
    }
}

#[async_trait]
impl InstrumentChannel for PrologixChannel {
    async fn write(&mut self, command: &str) -> Result<()> {
        debug!(command, "GPIB write");
        self.send(&escape(command)).await
    }

    async fn read_raw(&mut self) -> Result<Vec<u8>> {
        self.controller("read eoi").await?;
        let mut reply = Vec::new();
        let read = timeout(self.io_timeout, self.port.read_until(b'\n', &mut reply))
            .await
            .context("Prologix read timeout")?
            .context("Prologix read failed")?;
        if read == 0 {
            bail!("Prologix port closed");
        }
        Ok(reply)
    }
}
