//! Thorlabs APT Stepper Stage Driver
//!
//! Reference: Thorlabs APT Communications Protocol, Issue 37
//!
//! Protocol Overview:
//! - Link: USB virtual COM port (FTDI), 115200 baud, 8N1, RTS/CTS
//! - Messages: 6-byte little-endian header, optionally followed by data
//!   - Header only: `[id lo, id hi, param1, param2, dest, source]`
//!   - With data: `[id lo, id hi, len lo, len hi, dest | 0x80, source]`
//! - Destination 0x50 (generic USB unit), source 0x01 (host)
//! - Positions in microsteps as signed 32-bit integers
//!
//! Used for K10CR1-class integrated stepper rotation stages.
//!
//! # Example Usage
//!
//! ```no_run
//! use power_sweep::hardware::apt::AptStage;
//! use power_sweep::hardware::capabilities::{MotorController, MotorParams};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut stage = AptStage::new(None, MotorParams::default(), Duration::from_secs(2));
//!     let serials = stage.list_serial_numbers().await?;
//!     stage.open(&serials[0]).await?;
//!     stage.request_status().await?;
//!     println!("Position: {}", stage.position().await?);
//!     stage.close();
//!     Ok(())
//! }
//! ```

use crate::hardware::capabilities::{MotorController, MotorParams};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_serial::{FlowControl, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

const BAUD_RATE: u32 = 115_200;
/// FTDI vendor ID used by Thorlabs APT controllers.
const THORLABS_VID: u16 = 0x0403;

const DEST_GENERIC_USB: u8 = 0x50;
const SOURCE_HOST: u8 = 0x01;
const DATA_FLAG: u8 = 0x80;
const CHANNEL_1: u16 = 0x01;

const HW_STOP_UPDATEMSGS: u16 = 0x0012;
const MOD_SET_CHANENABLESTATE: u16 = 0x0210;
const MOT_MOVE_HOME: u16 = 0x0443;
const MOT_MOVE_ABSOLUTE: u16 = 0x0453;
const MOT_REQ_STATUSUPDATE: u16 = 0x0480;
const MOT_GET_STATUSUPDATE: u16 = 0x0481;

/// Decoded `MOT_GET_STATUSUPDATE` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Channel identifier
    pub channel: u16,
    /// Position in microsteps
    pub position: i32,
    /// Encoder count (unused on K10CR1)
    pub encoder_count: i32,
    /// Status bits
    pub status_bits: u32,
}

/// Header-only message.
fn short_message(id: u16, param1: u8, param2: u8) -> [u8; 6] {
    let [lo, hi] = id.to_le_bytes();
    [lo, hi, param1, param2, DEST_GENERIC_USB, SOURCE_HOST]
}

/// Header followed by `data`.
fn long_message(id: u16, data: &[u8]) -> Vec<u8> {
    let [lo, hi] = id.to_le_bytes();
    let [len_lo, len_hi] = (data.len() as u16).to_le_bytes();
    let mut message = vec![lo, hi, len_lo, len_hi, DEST_GENERIC_USB | DATA_FLAG, SOURCE_HOST];
    message.extend_from_slice(data);
    message
}

fn move_absolute(position: i32) -> Vec<u8> {
    let mut data = Vec::with_capacity(6);
    data.extend_from_slice(&CHANNEL_1.to_le_bytes());
    data.extend_from_slice(&position.to_le_bytes());
    long_message(MOT_MOVE_ABSOLUTE, &data)
}

fn parse_status_update(data: &[u8]) -> Result<StatusUpdate> {
    if data.len() < 14 {
        bail!("status update too short: {} bytes", data.len());
    }
    let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
    let u32_at = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
    Ok(StatusUpdate {
        channel: u16_at(0),
        position: u32_at(2) as i32,
        encoder_count: u32_at(6) as i32,
        status_bits: u32_at(10),
    })
}

struct AptLink {
    port: SerialStream,
    serial: String,
    poll_interval: Option<Duration>,
    last_update: Option<(Instant, StatusUpdate)>,
}

/// Thorlabs APT stage over a USB serial port.
pub struct AptStage {
    port_override: Option<String>,
    params: MotorParams,
    io_timeout: Duration,
    link: Option<AptLink>,
}

impl AptStage {
    /// Create an unopened driver.
    ///
    /// # Arguments
    /// * `port_override` - Serial port path; looked up by serial number when `None`
    /// * `params` - Motor parameters reported through `motor_params`
    /// * `io_timeout` - Maximum wait for one reply
    pub fn new(port_override: Option<String>, params: MotorParams, io_timeout: Duration) -> Self {
        Self {
            port_override,
            params,
            io_timeout,
            link: None,
        }
    }

    fn link(&mut self) -> Result<&mut AptLink> {
        self.link.as_mut().ok_or_else(|| anyhow!("APT stage is not open"))
    }

    async fn send(&mut self, message: &[u8]) -> Result<()> {
        let link = self.link()?;
        link.port
            .write_all(message)
            .await
            .context("APT write failed")?;
        link.port.flush().await.context("APT flush failed")
    }

    /// Read messages until one with `wanted` id arrives; returns its data.
    async fn read_until(&mut self, wanted: u16) -> Result<Vec<u8>> {
        let io_timeout = self.io_timeout;
        let link = self.link()?;
        timeout(io_timeout, async {
            loop {
                let mut header = [0u8; 6];
                link.port.read_exact(&mut header).await?;
                let id = u16::from_le_bytes([header[0], header[1]]);
                let data = if header[4] & DATA_FLAG != 0 {
                    let len = usize::from(u16::from_le_bytes([header[2], header[3]]));
                    let mut data = vec![0u8; len];
                    link.port.read_exact(&mut data).await?;
                    data
                } else {
                    Vec::new()
                };
                if id == wanted {
                    return Ok::<_, std::io::Error>(data);
                }
                debug!(id = format_args!("0x{id:04X}"), "Skipping APT message");
            }
        })
        .await
        .with_context(|| format!("APT read timeout waiting for 0x{wanted:04X}"))?
        .context("APT read failed")
    }

    fn find_port(&self, serial: &str) -> Result<String> {
        if let Some(port) = &self.port_override {
            return Ok(port.clone());
        }
        usb_ports()?
            .into_iter()
            .find(|(_, sn)| sn == serial)
            .map(|(port, _)| port)
            .ok_or_else(|| anyhow!("no serial port for stage {serial}"))
    }
}

/// (port name, USB serial number) of every attached FTDI device.
fn usb_ports() -> Result<Vec<(String, String)>> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    Ok(ports
        .into_iter()
        .filter_map(|info| match info.port_type {
            serialport::SerialPortType::UsbPort(usb) if usb.vid == THORLABS_VID => {
                usb.serial_number.map(|sn| (info.port_name, sn))
            }
            _ => None,
        })
        .collect())
}

#[async_trait]
impl MotorController for AptStage {
    async fn list_serial_numbers(&mut self) -> Result<Vec<String>> {
        Ok(usb_ports()?.into_iter().map(|(_, sn)| sn).collect())
    }

    async fn open(&mut self, serial: &str) -> Result<()> {
        let path = self.find_port(serial)?;
        let port = tokio_serial::new(&path, BAUD_RATE)
            .flow_control(FlowControl::Hardware)
            .open_native_async()
            .with_context(|| format!("Failed to open APT serial port {path}"))?;

        self.link = Some(AptLink {
            port,
            serial: serial.to_string(),
            poll_interval: None,
            last_update: None,
        });
        info!(serial, port = %path, "APT stage opened");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            debug!(serial = %link.serial, "APT stage closed");
        }
    }

    async fn start_polling(&mut self, interval: Duration) -> Result<()> {
        // Unsolicited updates would interleave with status replies.
        self.send(&short_message(HW_STOP_UPDATEMSGS, 0, 0)).await?;
        self.link()?.poll_interval = Some(interval);
        Ok(())
    }

    async fn load_settings(&mut self) -> Result<()> {
        self.send(&short_message(MOD_SET_CHANENABLESTATE, CHANNEL_1 as u8, 0x01))
            .await
    }

    async fn home(&mut self) -> Result<()> {
        self.send(&short_message(MOT_MOVE_HOME, CHANNEL_1 as u8, 0)).await?;
        self.link()?.last_update = None;
        Ok(())
    }

    async fn request_status(&mut self) -> Result<()> {
        let link = self.link()?;
        if let (Some(interval), Some((at, _))) = (link.poll_interval, link.last_update) {
            if at.elapsed() < interval {
                return Ok(());
            }
        }

        self.send(&short_message(MOT_REQ_STATUSUPDATE, CHANNEL_1 as u8, 0))
            .await?;
        let data = self.read_until(MOT_GET_STATUSUPDATE).await?;
        let update = parse_status_update(&data)?;
        if update.channel != CHANNEL_1 {
            warn!(channel = update.channel, "Status update for unexpected channel");
        }
        self.link()?.last_update = Some((Instant::now(), update));
        Ok(())
    }

    async fn status_bits(&mut self) -> Result<u32> {
        self.link()?
            .last_update
            .map(|(_, u)| u.status_bits)
            .ok_or_else(|| anyhow!("no status update received yet"))
    }

    async fn move_to(&mut self, position: i32) -> Result<()> {
        self.send(&move_absolute(position)).await?;
        self.link()?.last_update = None;
        Ok(())
    }

    async fn position(&mut self) -> Result<i32> {
        self.link()?
            .last_update
            .map(|(_, u)| u.position)
            .ok_or_else(|| anyhow!("no status update received yet"))
    }

    /// Returns the parameters given to [`AptStage::new`]. The K10CR1 has no
    /// simple APT query for them, so they come from configuration rather
    /// than the device.
    async fn motor_params(&mut self) -> Result<MotorParams> {
        Ok(self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_only_encoding() {
        assert_eq!(
            short_message(MOT_MOVE_HOME, 1, 0),
            [0x43, 0x04, 0x01, 0x00, 0x50, 0x01]
        );
        assert_eq!(
            short_message(MOD_SET_CHANENABLESTATE, 1, 1),
            [0x10, 0x02, 0x01, 0x01, 0x50, 0x01]
        );
    }

    #[test]
    fn absolute_move_encoding() {
        let msg = move_absolute(8_014_507);
        assert_eq!(&msg[..6], &[0x53, 0x04, 0x06, 0x00, 0xD0, 0x01]);
        assert_eq!(&msg[6..8], &[0x01, 0x00]);
        assert_eq!(i32::from_le_bytes([msg[8], msg[9], msg[10], msg[11]]), 8_014_507);
        assert_eq!(msg.len(), 12);
    }

    #[test]
    fn status_update_decoding() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&(-1234i32).to_le_bytes());
        data.extend_from_slice(&0i32.to_le_bytes());
        data.extend_from_slice(&0x8000_0400u32.to_le_bytes());

        let update = parse_status_update(&data).unwrap();
        assert_eq!(update.channel, 1);
        assert_eq!(update.position, -1234);
        assert_eq!(update.status_bits, 0x8000_0400);
        assert!(parse_status_update(&data[..10]).is_err());
    }
}
