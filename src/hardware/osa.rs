//! ANDO AQ6315 sweep client.
//!
//! Drives one single-shot sweep at a time over an [`InstrumentChannel`]:
//! `SGL` starts it, `SWEEP?` reports a non-zero value while it runs, and the
//! active trace is read back with `WDAT`/`LDAT`.

use crate::error::{AppResult, SweepError};
use crate::hardware::capabilities::InstrumentChannel;
use crate::measurement::{sanitize_ascii, LevelScale, LevelUnit, ScanParameters, Trace, TraceMetadata};
use anyhow::Context;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument};

/// Receiver sensitivity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    /// NORM HOLD (not usable for sweeps)
    NormHold,
    /// NORM AUTO
    #[default]
    NormAuto,
    /// HIGH 1
    High1,
    /// HIGH 2
    High2,
    /// HIGH 3
    High3,
}

impl Sensitivity {
    /// Instrument command selecting this mode.
    pub fn command(&self) -> &'static str {
        match self {
            Sensitivity::NormHold => "SNHD",
            Sensitivity::NormAuto => "SNAT",
            Sensitivity::High1 => "SHI1",
            Sensitivity::High2 => "SHI2",
            Sensitivity::High3 => "SHI3",
        }
    }

    /// Typical duration of one sweep in this mode.
    pub fn estimated_sweep_time(&self) -> Duration {
        Duration::from_secs(match self {
            Sensitivity::NormHold => 7,
            Sensitivity::NormAuto => 10,
            Sensitivity::High1 => 72,
            Sensitivity::High2 => 144,
            Sensitivity::High3 => 1020,
        })
    }

    /// Completion timeout used when none is configured: three sweeps plus a
    /// minute.
    pub fn default_sweep_timeout(&self) -> Duration {
        self.estimated_sweep_time() * 3 + Duration::from_secs(60)
    }
}

/// Request/response client for the spectrum analyzer.
pub struct SweepClient<C: InstrumentChannel> {
    channel: C,
    decimal_digits: u8,
}

impl<C: InstrumentChannel> SweepClient<C> {
    /// Wrap an open channel. `decimal_digits` is sent with `LDTDIG` before
    /// every readout.
    pub fn new(channel: C, decimal_digits: u8) -> Self {
        Self {
            channel,
            decimal_digits,
        }
    }

    /// Select the receiver sensitivity.
    #[instrument(skip(self))]
    pub async fn configure(&mut self, sensitivity: Sensitivity) -> AppResult<()> {
        self.channel
            .write(sensitivity.command())
            .await
            .map_err(|e| SweepError::instrument("configure sensitivity", e))?;
        debug!(command = sensitivity.command(), "Sensitivity set");
        Ok(())
    }

    /// Start a single sweep.
    pub async fn trigger_sweep(&mut self) -> AppResult<()> {
        self.channel
            .write("SGL")
            .await
            .map_err(|e| SweepError::instrument("trigger sweep", e))
    }

    /// Poll `SWEEP?` every `poll_interval` until the instrument is idle.
    ///
    /// # Errors
    /// `SweepTimeout` if still busy after `timeout`; `InstrumentCommunication`
    /// on channel failure or a non-integer reply.
    #[instrument(skip(self))]
    pub async fn wait_for_completion(
        &mut self,
        poll_interval: Duration,
        timeout: Duration,
    ) -> AppResult<()> {
        let start = Instant::now();
        loop {
            let reply = self
                .channel
                .query("SWEEP?")
                .await
                .map_err(|e| SweepError::instrument("wait for completion", e))?;
            let busy: i64 = reply.parse().map_err(|_| {
                SweepError::instrument(
                    "wait for completion",
                    format!("unexpected SWEEP? reply {reply:?}"),
                )
            })?;
            if busy <= 0 {
                debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Sweep complete");
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(SweepError::SweepTimeout { elapsed });
            }
            sleep(poll_interval).await;
        }
    }

    /// Read the active trace with its metadata.
    #[instrument(skip(self))]
    pub async fn read_trace(&mut self) -> AppResult<Trace> {
        self.read_trace_inner()
            .await
            .map_err(|e| SweepError::instrument("read trace", e))
    }

    async fn read_trace_inner(&mut self) -> anyhow::Result<Trace> {
        let active = self.channel.query("ACTV?").await.context("ACTV?")?;
        let active_trace = match active.as_str() {
            "0" => 'A',
            "1" => 'B',
            "2" => 'C',
            other => anyhow::bail!("unexpected ACTV? reply {other:?}"),
        };

        self.channel.write("*IDN?").await.context("*IDN?")?;
        let instrument_id = sanitize_ascii(&self.channel.read_raw().await.context("*IDN?")?);

        let scan = ScanParameters::parse(
            &self
                .channel
                .query(&format!("ST{active_trace}?"))
                .await
                .context("scan parameters")?,
        );

        self.channel
            .write(&format!("LDTDIG{}", self.decimal_digits))
            .await
            .context("LDTDIG")?;

        let scale = match self.channel.query("LSCL?").await.context("LSCL?")?.parse::<f64>() {
            Ok(v) if v == 0.0 => LevelScale::Linear,
            Ok(_) => LevelScale::Log,
            Err(_) => anyhow::bail!("unexpected LSCL? reply"),
        };
        let density = match self.channel.query("LSUNT?").await.context("LSUNT?")?.as_str() {
            "0" => false,
            "1" => true,
            other => anyhow::bail!("unexpected LSUNT? reply {other:?}"),
        };

        let (wavelengths, wavelength_text) = parse_array(
            &self
                .channel
                .query(&format!("WDAT{active_trace}"))
                .await
                .context("wavelength data")?,
        )
        .context("wavelength data")?;
        let (levels, level_text) = parse_array(
            &self
                .channel
                .query(&format!("LDAT{active_trace}"))
                .await
                .context("level data")?,
        )
        .context("level data")?;

        if wavelengths.is_empty() || wavelengths.len() != levels.len() {
            anyhow::bail!(
                "trace length mismatch: {} wavelengths, {} levels",
                wavelengths.len(),
                levels.len()
            );
        }

        debug!(trace = %active_trace, samples = wavelengths.len(), "Trace read");
        Ok(Trace {
            metadata: TraceMetadata {
                timestamp: Local::now(),
                instrument_id,
                active_trace,
                scan,
                level_unit: LevelUnit { scale, density },
            },
            wavelengths,
            levels,
            wavelength_text,
            level_text,
        })
    }

    /// Release the channel.
    pub fn into_inner(self) -> C {
        self.channel
    }
}

/// Parse a `count,v1,v2,...` reply, dropping the leading count. Returns the
/// values and their text as received.
fn parse_array(reply: &str) -> anyhow::Result<(Vec<f64>, Vec<String>)> {
    let mut values = Vec::new();
    let mut text = Vec::new();
    for field in reply.trim().split(',').skip(1) {
        let field = field.trim();
        values.push(
            field
                .parse::<f64>()
                .with_context(|| format!("bad numeric field {field:?}"))?,
        );
        text.push(field.to_string());
    }
    Ok((values, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedOsa;

    #[test]
    fn sensitivity_commands_and_estimates() {
        assert_eq!(Sensitivity::NormAuto.command(), "SNAT");
        assert_eq!(Sensitivity::High3.command(), "SHI3");
        assert_eq!(Sensitivity::High1.estimated_sweep_time(), Duration::from_secs(72));
        assert_eq!(
            Sensitivity::NormAuto.default_sweep_timeout(),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn array_reply_drops_count() {
        let (values, text) = parse_array("3,1.500,2.5,3.5E-6\r\n").unwrap();
        assert_eq!(values, vec![1.5, 2.5, 3.5e-6]);
        assert_eq!(text, vec!["1.500", "2.5", "3.5E-6"]);
        assert!(parse_array("2,1.0,abc").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_waits_until_idle() {
        let osa = SimulatedOsa::new().with_busy_polls(4);
        let mut client = SweepClient::new(osa.clone(), 3);
        client.trigger_sweep().await.unwrap();
        client
            .wait_for_completion(Duration::from_millis(200), Duration::from_secs(10))
            .await
            .unwrap();
        let polls = osa.commands().iter().filter(|c| *c == "SWEEP?").count();
        assert_eq!(polls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_instrument_times_out() {
        let osa = SimulatedOsa::new().stays_busy();
        let mut client = SweepClient::new(osa, 3);
        client.trigger_sweep().await.unwrap();
        let err = client
            .wait_for_completion(Duration::from_millis(200), Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            SweepError::SweepTimeout { elapsed } => {
                assert!(elapsed >= Duration::from_secs(2));
                assert!(elapsed < Duration::from_millis(2_400));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn trace_readout_collects_metadata() {
        let osa = SimulatedOsa::new().with_samples(11).with_active_trace(1);
        let mut client = SweepClient::new(osa.clone(), 3);
        let trace = client.read_trace().await.unwrap();

        assert_eq!(trace.wavelengths.len(), 11);
        assert_eq!(trace.levels.len(), 11);
        assert_eq!(trace.wavelength_text[0], "1540.000");
        assert_eq!(trace.level_text.len(), 11);
        assert_eq!(trace.metadata.active_trace, 'B');
        assert!(trace.metadata.instrument_id.is_ascii());
        assert!(trace.metadata.instrument_id.starts_with("ANDO ELECTRIC"));
        assert_eq!(trace.metadata.scan.sample_count, "11");
        assert_eq!(trace.metadata.level_unit.label(), "dBm");
        assert!(osa.commands().contains(&"LDTDIG3".to_string()));
        assert!(osa.commands().contains(&"WDATB".to_string()));
    }

    #[tokio::test]
    async fn linear_density_unit() {
        let osa = SimulatedOsa::new().with_linear_scale().with_density();
        let mut client = SweepClient::new(osa, 3);
        let trace = client.read_trace().await.unwrap();
        assert_eq!(trace.metadata.level_unit.label(), "W/nm");
    }

    #[tokio::test]
    async fn mismatched_arrays_are_rejected() {
        let osa = SimulatedOsa::new().with_samples(10).with_level_samples(9);
        let mut client = SweepClient::new(osa, 3);
        assert!(matches!(
            client.read_trace().await,
            Err(SweepError::InstrumentCommunication { operation: "read trace", .. })
        ));
    }

    #[tokio::test]
    async fn channel_failure_names_operation() {
        let osa = SimulatedOsa::new().failing_on("SGL");
        let mut client = SweepClient::new(osa, 3);
        match client.trigger_sweep().await {
            Err(SweepError::InstrumentCommunication { operation, message }) => {
                assert_eq!(operation, "trigger sweep");
                assert!(message.contains("SGL"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
