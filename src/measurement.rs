//! Captured spectra and their metadata.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Labels of the scan parameters returned by the analyzer's `ST{trace}?`
/// query, in the order the instrument reports them.
pub const SCAN_PARAMETER_LABELS: [&str; 10] = [
    "Center Wvl:",
    "Span Range:",
    "REF Level:",
    "Level Scale:",
    "Wvl Resolution:",
    "Avg Count:",
    "Sampl Count:",
    "Sensitivity:",
    "Monochro:",
    "Waveform Type:",
];

/// Scan settings reported alongside a trace, kept as the instrument's text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Center wavelength
    pub center_wavelength: String,
    /// Span range
    pub span: String,
    /// Reference level
    pub reference_level: String,
    /// Level scale (dB/div or linear)
    pub level_scale: String,
    /// Wavelength resolution
    pub resolution: String,
    /// Averaging count
    pub averaging_count: String,
    /// Sample count
    pub sample_count: String,
    /// Sensitivity mode
    pub sensitivity: String,
    /// Monochromator mode
    pub monochromator: String,
    /// Waveform type
    pub waveform_type: String,
}

impl ScanParameters {
    /// Parse the comma-separated reply of `ST{trace}?`.
    ///
    /// Missing trailing fields are left empty.
    pub fn parse(reply: &str) -> Self {
        let mut fields = reply.trim().split(',').map(|f| f.trim().to_string());
        let mut next = || fields.next().unwrap_or_default();
        Self {
            center_wavelength: next(),
            span: next(),
            reference_level: next(),
            level_scale: next(),
            resolution: next(),
            averaging_count: next(),
            sample_count: next(),
            sensitivity: next(),
            monochromator: next(),
            waveform_type: next(),
        }
    }

    /// Values in the order of [`SCAN_PARAMETER_LABELS`].
    pub fn values(&self) -> [&str; 10] {
        [
            &self.center_wavelength,
            &self.span,
            &self.reference_level,
            &self.level_scale,
            &self.resolution,
            &self.averaging_count,
            &self.sample_count,
            &self.sensitivity,
            &self.monochromator,
            &self.waveform_type,
        ]
    }
}

/// Unit of the level array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelScale {
    /// Linear scale, watts
    Linear,
    /// Logarithmic scale, dBm
    Log,
}

/// Level unit: scale plus absolute or per-nanometer density.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelUnit {
    /// Linear or logarithmic
    pub scale: LevelScale,
    /// True when levels are a spectral density (per nm)
    pub density: bool,
}

impl LevelUnit {
    /// Unit label as written in trace files, e.g. `dBm` or `W/nm`.
    pub fn label(&self) -> String {
        let base = match self.scale {
            LevelScale::Linear => "W",
            LevelScale::Log => "dBm",
        };
        if self.density {
            format!("{base}/nm")
        } else {
            base.to_string()
        }
    }
}

/// Metadata recorded with every trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMetadata {
    /// Time the trace was read back
    pub timestamp: DateTime<Local>,
    /// Instrument identification, ASCII only
    pub instrument_id: String,
    /// Active trace letter (A, B or C)
    pub active_trace: char,
    /// Scan settings
    pub scan: ScanParameters,
    /// Unit of `levels`
    pub level_unit: LevelUnit,
}

/// One spectrum read back from the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Trace metadata
    pub metadata: TraceMetadata,
    /// Wavelengths in nm
    pub wavelengths: Vec<f64>,
    /// Levels, index-aligned with `wavelengths`
    pub levels: Vec<f64>,
    /// Wavelength fields exactly as the instrument sent them
    pub wavelength_text: Vec<String>,
    /// Level fields exactly as the instrument sent them
    pub level_text: Vec<String>,
}

/// A trace captured at one plan point.
///
/// Written once by the recorder and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturePoint {
    /// Zero-based plan index
    pub index: usize,
    /// Target optical power
    pub target_power: f64,
    /// Target rotation angle in degrees
    pub target_angle: f64,
    /// Stage position read back after settling
    pub achieved_position_units: i32,
    /// Wavelengths in nm
    pub wavelengths: Vec<f64>,
    /// Levels, index-aligned with `wavelengths`
    pub levels: Vec<f64>,
    /// Instrument text of each wavelength; empty when not read from an instrument
    pub wavelength_text: Vec<String>,
    /// Instrument text of each level; empty when not read from an instrument
    pub level_text: Vec<String>,
    /// Trace metadata
    pub metadata: TraceMetadata,
}

impl CapturePoint {
    /// Wavelength and level fields of every sample as written to a trace
    /// file. The instrument's own text is used where present; computed
    /// values fall back to their shortest exact decimal form.
    pub fn sample_rows(&self) -> impl Iterator<Item = (String, String)> + '_ {
        let field = |text: &[String], values: &[f64], i: usize| {
            text.get(i).cloned().unwrap_or_else(|| values[i].to_string())
        };
        (0..self.wavelengths.len().min(self.levels.len())).map(move |i| {
            (
                field(&self.wavelength_text, &self.wavelengths, i),
                field(&self.level_text, &self.levels, i),
            )
        })
    }
}

/// Trim trailing ASCII whitespace, then replace every non-ASCII byte with a
/// space.
pub fn sanitize_ascii(raw: &[u8]) -> String {
    let end = raw
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    raw[..end]
        .iter()
        .map(|&b| if b.is_ascii() { char::from(b) } else { ' ' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_parameters_parse_in_order() {
        let scan = ScanParameters::parse(
            "1550.00,100.00,-10.0,10.0,0.05,1,1001,SNAT,SGL,TRACE\r\n",
        );
        assert_eq!(scan.center_wavelength, "1550.00");
        assert_eq!(scan.sample_count, "1001");
        assert_eq!(scan.waveform_type, "TRACE");
        assert_eq!(scan.values()[7], "SNAT");
    }

    #[test]
    fn short_scan_reply_leaves_fields_empty() {
        let scan = ScanParameters::parse("1550.00,100.00");
        assert_eq!(scan.span, "100.00");
        assert!(scan.reference_level.is_empty());
        assert!(scan.waveform_type.is_empty());
    }

    #[test]
    fn level_unit_labels() {
        let log = LevelUnit {
            scale: LevelScale::Log,
            density: false,
        };
        let linear_density = LevelUnit {
            scale: LevelScale::Linear,
            density: true,
        };
        assert_eq!(log.label(), "dBm");
        assert_eq!(linear_density.label(), "W/nm");
    }

    #[test]
    fn non_ascii_bytes_become_spaces() {
        let raw = b"ANDO\xb0AQ6315E\r\n";
        assert_eq!(sanitize_ascii(raw), "ANDO AQ6315E");
    }

    #[test]
    fn trailing_non_ascii_bytes_keep_their_spaces() {
        assert_eq!(sanitize_ascii(b"AQ6315E\xff\xfe\r\n"), "AQ6315E  ");
        assert_eq!(sanitize_ascii(b" \r\n"), "");
    }

    #[test]
    fn sample_rows_prefer_instrument_text() {
        let point = CapturePoint {
            index: 0,
            target_power: 2.5,
            target_angle: 58.7,
            achieved_position_units: 0,
            wavelengths: vec![1550.0, 1550.02],
            levels: vec![-10.1, 1.5e-6],
            wavelength_text: vec!["1550.000".to_string(), "1550.020".to_string()],
            level_text: Vec::new(),
            metadata: TraceMetadata {
                timestamp: Local::now(),
                instrument_id: String::new(),
                active_trace: 'A',
                scan: ScanParameters::default(),
                level_unit: LevelUnit {
                    scale: LevelScale::Log,
                    density: false,
                },
            },
        };
        let rows: Vec<_> = point.sample_rows().collect();
        assert_eq!(rows[0], ("1550.000".to_string(), "-10.1".to_string()));
        assert_eq!(rows[1], ("1550.020".to_string(), "0.0000015".to_string()));
    }
}
