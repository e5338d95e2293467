//! CLI Entry Point for power-sweep
//!
//! Provides command-line interface for:
//! - Running a power sweep (real or simulated hardware)
//! - Printing the sweep plan without touching hardware
//! - Listing attached stages
//! - Writing a default configuration file
//!
//! # Usage
//!
//! Run a sweep with the settings in `config/sweep.toml`:
//! ```bash
//! power-sweep run
//! ```
//!
//! Dry run against simulated hardware:
//! ```bash
//! power-sweep run --simulate --points 5 --output /tmp/sweep
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use power_sweep::config::{InstrumentBackend, StageBackend, SweepConfig, DEFAULT_CONFIG_PATH};
use power_sweep::experiment::{SweepOrchestrator, SweepPlan};
use power_sweep::hardware::capabilities::MotorController;
use power_sweep::hardware::{open_instrument_channel, stage_backend};
use power_sweep::logging::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "power-sweep", version)]
#[command(about = "Polarization-stage power sweep with optical spectrum capture", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the sweep
    Run {
        /// Use the simulated stage and analyzer
        #[arg(long)]
        simulate: bool,

        /// Override sweep.num_points
        #[arg(long)]
        points: Option<usize>,

        /// Override storage.output_dir
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the planned powers and angles
    Plan {
        /// Override sweep.num_points
        #[arg(long)]
        points: Option<usize>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List serial numbers of attached stages
    ListStages {
        /// Use the simulated stage
        #[arg(long)]
        simulate: bool,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the default configuration as TOML
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config {
        action: ConfigAction::Init,
    } = cli.command
    {
        print!("{}", toml::to_string_pretty(&SweepConfig::default())?);
        return Ok(());
    }

    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = SweepConfig::load_from(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    match &cli.command {
        Commands::Run {
            simulate,
            points,
            output,
        } => {
            if *simulate {
                config.stage.backend = StageBackend::Simulated;
                config.instrument.backend = InstrumentBackend::Simulated;
            }
            if let Some(points) = points {
                config.sweep.num_points = *points;
            }
            if let Some(output) = output {
                config.storage.output_dir = output.clone();
            }
        }
        Commands::Plan {
            points: Some(points),
            ..
        } => config.sweep.num_points = *points,
        Commands::ListStages { simulate: true } => {
            config.stage.backend = StageBackend::Simulated;
        }
        _ => {}
    }

    config.validate()?;
    logging::init(TracingConfig::from_config(&config)?.with_format(cli.log_format))?;

    match cli.command {
        Commands::Run { .. } => run_sweep(config).await,
        Commands::Plan { json, .. } => print_plan(&config, json),
        Commands::ListStages { .. } => list_stages(&config).await,
        Commands::Config { .. } => Ok(()),
    }
}

async fn run_sweep(config: SweepConfig) -> Result<()> {
    let plan = SweepPlan::linear(config.calibration, config.sweep.num_points)?;
    info!(
        name = %config.application.name,
        points = plan.len(),
        "Starting power sweep"
    );

    let motor = stage_backend(&config.stage)?;
    let channel = open_instrument_channel(&config.instrument).await?;
    let orchestrator = SweepOrchestrator::new(&config, motor, channel);

    tokio::select! {
        result = orchestrator.run(&plan) => {
            let summary = result?;
            println!(
                "Saved {} traces to {}",
                summary.points_captured,
                summary.run_directory.display()
            );
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; closing stage");
            bail!("sweep interrupted")
        }
    }
}

fn print_plan(config: &SweepConfig, json: bool) -> Result<()> {
    let plan = SweepPlan::linear(config.calibration, config.sweep.num_points)?;
    if json {
        println!("{}", serde_json::to_string_pretty(plan.points())?);
        return Ok(());
    }
    println!("FileNum\tPower\tAngle (deg)");
    for point in plan.points() {
        println!(
            "{:04}\t{:.6}\t{:.6}",
            point.index + 1,
            point.power,
            point.angle_deg
        );
    }
    Ok(())
}

async fn list_stages(config: &SweepConfig) -> Result<()> {
    let mut backend = stage_backend(&config.stage)?;
    let serials = backend
        .list_serial_numbers()
        .await
        .context("Failed to enumerate stages")?;
    if serials.is_empty() {
        println!("No stages found");
    }
    for serial in serials {
        println!("{serial}");
    }
    Ok(())
}
