//! Id mapper CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use id_mapper::{MergeDriver, PassOptions, RunMode, ScrapedFileSource};
use shared::{Config, DataPaths, LogConfig, MediaKind, Service};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Catalogue to map (anime or manga)
    #[arg(short = 't', long = "type")]
    kind: MediaKind,

    /// Read feeds from the start, or resume from the checkpoint
    #[arg(short, long, value_enum, default_value_t = RunMode::Update)]
    mode: RunMode,

    /// Only read these services (repeatable)
    #[arg(short, long = "service")]
    services: Vec<Service>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    // Initialize logging
    shared::logging::init(LogConfig::from_settings(
        &config.logging,
        &config.log_dir(),
        "id-mapper",
        args.verbose,
    ))?;

    info!(kind = %args.kind, mode = %args.mode, "Id mapper starting");
    info!(config_file = %args.config.display(), "Loaded configuration");

    let data_paths = DataPaths::from_config(&config);
    data_paths
        .create_dirs(args.kind)
        .context("Failed to create data directories")?;

    let mut options = PassOptions::new(args.mode);
    options.emit_unanchored = config.mapper.emit_unanchored;
    options.write_conflict_report = config.mapper.write_conflict_report;
    if !args.services.is_empty() {
        options.services = Some(args.services);
    }

    let source = ScrapedFileSource::new(data_paths.clone(), args.kind, config.mapper.batch_size);
    let mut driver = MergeDriver::new(args.kind, data_paths, source, options);

    driver
        .run()
        .with_context(|| format!("Merge pass for {} failed", args.kind))?;

    info!("Id mapper finished successfully");
    Ok(())
}
