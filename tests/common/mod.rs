//! Shared fixtures for integration tests.

#![allow(dead_code)]

use power_sweep::config::{InstrumentBackend, StageBackend, SweepConfig};
use std::fs;
use std::path::{Path, PathBuf};

/// Simulated backends writing below `output_dir`.
pub fn simulated_config(output_dir: &Path) -> SweepConfig {
    let mut config = SweepConfig::default();
    config.stage.backend = StageBackend::Simulated;
    config.instrument.backend = InstrumentBackend::Simulated;
    config.storage.output_dir = output_dir.to_path_buf();
    config
}

/// Files in `dir`, sorted by name.
pub fn sorted_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}

/// Trace files (`ando-osa-data_*`) in `dir`, sorted by name.
pub fn trace_files(dir: &Path) -> Vec<PathBuf> {
    sorted_files(dir)
        .into_iter()
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("ando-osa-data_"))
        })
        .collect()
}

/// The only run directory created below `output_dir`.
pub fn single_run_dir(output_dir: &Path) -> PathBuf {
    let days: Vec<PathBuf> = fs::read_dir(output_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(days.len(), 1, "expected one dated directory");
    let runs: Vec<PathBuf> = fs::read_dir(&days[0])
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(runs.len(), 1, "expected one run directory");
    runs[0].clone()
}
