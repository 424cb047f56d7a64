//! CLI entry point for rec_daq
//!
//! ```bash
//! # Record until Ctrl+C
//! rec_daq run --config config/recorder.toml
//!
//! # Same, forcing the simulated bus
//! rec_daq run --config config/recorder.toml --simulate
//!
//! # Print the effective configuration (file + environment)
//! rec_daq validate --config config/recorder.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rec_daq::config::{BusBackend, RecorderConfig};
use rec_daq::{logging, Recorder};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rec_daq")]
#[command(about = "Headless sensor recorder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record until interrupted
    Run {
        /// Configuration file
        #[arg(long, default_value = "config/recorder.toml")]
        config: PathBuf,

        /// Use the simulated bus regardless of configuration
        #[arg(long)]
        simulate: bool,

        /// Seconds between status reports (0 disables)
        #[arg(long, default_value = "10")]
        report_every: u64,
    },

    /// Load and validate a configuration, then print it
    Validate {
        /// Configuration file
        #[arg(long, default_value = "config/recorder.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            simulate,
            report_every,
        } => run(config, simulate, report_every).await,
        Commands::Validate { config } => validate(config),
    }
}

fn load(path: &Path) -> Result<RecorderConfig> {
    let config = RecorderConfig::load_from(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn validate(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    println!(
        "# OK: {} sensor(s), {} controller(s)",
        config.enabled_sensors().count(),
        config.enabled_controllers().count()
    );
    Ok(())
}

async fn run(path: PathBuf, simulate: bool, report_every: u64) -> Result<()> {
    let mut config = load(&path)?;
    if simulate {
        config.bus.backend = BusBackend::Simulated;
    }
    logging::init_from_config(&config)?;
    info!(name = %config.application.name, config = %path.display(), "Starting recorder");

    let recorder = Recorder::from_config(config)?;
    recorder.start().await?;

    let mut report = tokio::time::interval(Duration::from_secs(report_every.max(1)));
    report.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "Failed to listen for Ctrl+C");
                }
                break;
            }
            _ = report.tick(), if report_every > 0 => {
                for entry in recorder.statuses() {
                    info!(
                        interface = %entry.interface,
                        role = entry.role,
                        status = %entry.status,
                        errors = entry.error_count,
                        retained = entry.retained,
                        "Status"
                    );
                }
                info!(bytes = recorder.buffer().memory_usage(), "Buffer usage");
            }
        }
    }

    info!("Interrupted, shutting down");
    recorder.shutdown().await?;
    Ok(())
}
