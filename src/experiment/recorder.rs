//! Run directory, manifest and trace files.
//!
//! Layout under the configured output directory:
//!
//! ```text
//! <output_dir>/<YYYY-MM-DD>/run 0001/LOGFILE.txt
//! <output_dir>/<YYYY-MM-DD>/run 0001/ando-osa-data_<YYYY-MM-DD>_0001.txt
//! ```
//!
//! All files are tab-separated text written with the `csv` crate.

use crate::error::{AppResult, SweepError};
use crate::experiment::plan::SweepPlan;
use crate::measurement::{CapturePoint, SCAN_PARAMETER_LABELS};
use chrono::{DateTime, Local, NaiveDate};
use csv::{QuoteStyle, Terminator, Writer, WriterBuilder};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the per-run manifest file.
pub const MANIFEST_FILE: &str = "LOGFILE.txt";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Location and identity of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    /// `<output_dir>/<date>/run NNNN`
    pub run_directory: PathBuf,
    /// Path of `LOGFILE.txt`
    pub manifest_path: PathBuf,
    /// NNNN, starting at 1
    pub run_number: u32,
    /// Date the run started
    pub date: NaiveDate,
    /// Time the run started
    pub started_at: DateTime<Local>,
}

/// Writes the manifest and one trace file per captured point.
pub struct RunRecorder {
    output_dir: PathBuf,
    instrument_label: String,
    context: Option<RunContext>,
}

impl RunRecorder {
    /// Recorder writing below `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>, instrument_label: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            instrument_label: instrument_label.into(),
            context: None,
        }
    }

    /// The current run, once [`begin_run`](Self::begin_run) has succeeded.
    pub fn context(&self) -> Option<&RunContext> {
        self.context.as_ref()
    }

    /// Create the next run directory and write its manifest.
    pub fn begin_run(&mut self, plan: &SweepPlan) -> AppResult<&RunContext> {
        self.begin_run_at(plan, Local::now())
    }

    /// [`begin_run`](Self::begin_run) with an explicit start time.
    pub fn begin_run_at(&mut self, plan: &SweepPlan, now: DateTime<Local>) -> AppResult<&RunContext> {
        let date = now.date_naive();
        let day_dir = self.output_dir.join(date.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&day_dir)?;

        let (run_number, run_directory) = create_next_run_dir(&day_dir)?;
        let manifest_path = run_directory.join(MANIFEST_FILE);
        write_manifest(&manifest_path, &self.instrument_label, plan, &now)?;

        info!(
            run = run_number,
            directory = %run_directory.display(),
            "Will save data to run folder {run_number}"
        );

        Ok(&*self.context.insert(RunContext {
            run_directory,
            manifest_path,
            run_number,
            date,
            started_at: now,
        }))
    }

    /// Trace file path for the zero-based plan index.
    pub fn trace_path(&self, index: usize) -> AppResult<PathBuf> {
        let context = self.require_context()?;
        Ok(context.run_directory.join(format!(
            "ando-osa-data_{}_{:04}.txt",
            context.date.format("%Y-%m-%d"),
            index + 1
        )))
    }

    /// Write one captured point to its trace file. Sample fields are written
    /// as the instrument sent them.
    pub fn persist(&self, point: &CapturePoint) -> AppResult<PathBuf> {
        let path = self.trace_path(point.index)?;
        let mut writer = tab_writer(&path)?;
        let meta = &point.metadata;

        writer.write_record(["Instrument:", meta.instrument_id.as_str()])?;
        let timestamp = meta.timestamp.format(TIMESTAMP_FORMAT).to_string();
        writer.write_record(["Time Stamp:", timestamp.as_str()])?;
        for (label, value) in SCAN_PARAMETER_LABELS.iter().zip(meta.scan.values()) {
            writer.write_record([*label, value])?;
        }
        writer.write_record(["", ""])?;
        let level_header = format!("Level({})", meta.level_unit.label());
        writer.write_record(["Wavelength(nm)", level_header.as_str()])?;

        for (wavelength, level) in point.sample_rows() {
            writer.write_record([wavelength, level])?;
        }
        writer.flush()?;

        debug!(path = %path.display(), samples = point.wavelengths.len(), "Trace persisted");
        Ok(path)
    }

    fn require_context(&self) -> AppResult<&RunContext> {
        self.context.as_ref().ok_or_else(|| {
            SweepError::Configuration("no run in progress; call begin_run first".to_string())
        })
    }
}

fn tab_writer(path: &Path) -> AppResult<Writer<File>> {
    Ok(WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(QuoteStyle::Never)
        .flexible(true)
        .terminator(Terminator::Any(b'\n'))
        .from_path(path)?)
}

fn create_next_run_dir(day_dir: &Path) -> AppResult<(u32, PathBuf)> {
    for run_number in 1..=9999 {
        let candidate = day_dir.join(format!("run {run_number:04}"));
        if candidate.exists() {
            continue;
        }
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok((run_number, candidate)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(SweepError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("no free run number left in {}", day_dir.display()),
    )))
}

fn write_manifest(
    path: &Path,
    instrument_label: &str,
    plan: &SweepPlan,
    now: &DateTime<Local>,
) -> AppResult<()> {
    let cal = plan.calibration();
    let mut writer = tab_writer(path)?;

    writer.write_record([format!("Instrument: {instrument_label}")])?;
    writer.write_record(["Time".to_string(), now.format(TIMESTAMP_FORMAT).to_string()])?;
    writer.write_record([format!("Min_pow angle: {:.4}", cal.extinguish_angle_deg)])?;
    writer.write_record([format!("Max Power: {:.4}", cal.max_power)])?;
    writer.write_record([format!("Min Power: {:.4}", cal.min_power)])?;
    writer.write_record([format!("Num Points: {}", plan.len())])?;
    writer.write_record(["FileNum", "Power", " Angle (deg)"])?;
    for point in plan.points() {
        writer.write_record([
            format!("{:04}", point.index + 1),
            format!("{:.6}", point.power),
            format!("{:.6}", point.angle_deg),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::Calibration;
    use crate::measurement::{LevelScale, LevelUnit, ScanParameters, TraceMetadata};
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap()
    }

    fn plan(points: usize) -> SweepPlan {
        SweepPlan::linear(Calibration::default(), points).unwrap()
    }

    fn capture(index: usize) -> CapturePoint {
        CapturePoint {
            index,
            target_power: 135.9,
            target_angle: 13.7,
            achieved_position_units: 1_870_507,
            wavelengths: vec![1549.5, 1550.0],
            levels: vec![-42.125, -12.5],
            wavelength_text: vec!["1549.500".to_string(), "1550.000".to_string()],
            level_text: vec!["-42.125".to_string(), "-12.500".to_string()],
            metadata: TraceMetadata {
                timestamp: fixed_time(),
                instrument_id: "ANDO ELECTRIC,AQ6315E".to_string(),
                active_trace: 'A',
                scan: ScanParameters::parse("1550.00,10.00,-10.0,10.0,0.05,1,2,SNAT,SGL,TRACE"),
                level_unit: LevelUnit {
                    scale: LevelScale::Log,
                    density: false,
                },
            },
        }
    }

    #[test]
    fn manifest_lists_every_planned_point() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = RunRecorder::new(dir.path(), "ANDO");
        let context = recorder.begin_run_at(&plan(3), fixed_time()).unwrap().clone();

        assert_eq!(context.run_number, 1);
        assert_eq!(
            context.run_directory,
            dir.path().join("2024-03-07").join("run 0001")
        );

        let text = fs::read_to_string(&context.manifest_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Instrument: ANDO");
        assert_eq!(lines[1], "Time\t2024-03-07 14:05:09");
        assert_eq!(lines[2], "Min_pow angle: 58.7000");
        assert_eq!(lines[3], "Max Power: 135.9000");
        assert_eq!(lines[4], "Min Power: 2.5000");
        assert_eq!(lines[5], "Num Points: 3");
        assert_eq!(lines[6], "FileNum\tPower\t Angle (deg)");
        assert_eq!(lines[7], "0001\t135.900000\t13.700000");
        assert_eq!(lines[9], "0003\t2.500000\t58.700000");
        assert_eq!(lines.len(), 10);
    }

    #[test]
    fn run_numbers_skip_existing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("2024-03-07");
        fs::create_dir_all(day.join("run 0001")).unwrap();
        fs::create_dir_all(day.join("run 0002")).unwrap();

        let mut recorder = RunRecorder::new(dir.path(), "ANDO");
        let context = recorder.begin_run_at(&plan(1), fixed_time()).unwrap();
        assert_eq!(context.run_number, 3);
        assert!(day.join("run 0003").join(MANIFEST_FILE).is_file());
    }

    #[test]
    fn trace_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = RunRecorder::new(dir.path(), "ANDO");
        recorder.begin_run_at(&plan(1), fixed_time()).unwrap();

        let path = recorder.persist(&capture(0)).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "ando-osa-data_2024-03-07_0001.txt"
        );

        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Instrument:\tANDO ELECTRIC,AQ6315E");
        assert_eq!(lines[1], "Time Stamp:\t2024-03-07 14:05:09");
        assert_eq!(lines[2], "Center Wvl:\t1550.00");
        assert_eq!(lines[11], "Waveform Type:\tTRACE");
        assert_eq!(lines[12], "\t");
        assert_eq!(lines[13], "Wavelength(nm)\tLevel(dBm)");
        assert_eq!(lines[14], "1549.500\t-42.125");
        assert_eq!(lines[15], "1550.000\t-12.500");
        assert_eq!(lines.len(), 16);
    }

    #[test]
    fn closely_spaced_samples_stay_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = RunRecorder::new(dir.path(), "ANDO");
        recorder.begin_run_at(&plan(1), fixed_time()).unwrap();

        let mut point = capture(0);
        point.wavelengths = vec![1550.0, 1550.02, 1550.04];
        point.levels = vec![-10.125, -10.5, -10.75];
        point.wavelength_text = Vec::new();
        point.level_text = Vec::new();
        let text = fs::read_to_string(recorder.persist(&point).unwrap()).unwrap();
        let rows: Vec<&str> = text.lines().skip(14).collect();
        assert_eq!(rows, ["1550\t-10.125", "1550.02\t-10.5", "1550.04\t-10.75"]);

        point.wavelength_text = vec!["1550.000".into(), "1550.020".into(), "1550.040".into()];
        point.level_text = vec!["1.250E-6".into(), "2.500E-6".into(), "5.125E-6".into()];
        let text = fs::read_to_string(recorder.persist(&point).unwrap()).unwrap();
        let rows: Vec<&str> = text.lines().skip(14).collect();
        assert_eq!(
            rows,
            ["1550.000\t1.250E-6", "1550.020\t2.500E-6", "1550.040\t5.125E-6"]
        );
    }

    #[test]
    fn persist_requires_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = RunRecorder::new(dir.path(), "ANDO");
        assert!(recorder.persist(&capture(0)).is_err());
    }
}
