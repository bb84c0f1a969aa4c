//! hkmedia CLI - Command-line interface
//!
//! Runs the media transport components standalone, for checking an FFmpeg
//! build or a camera feed without the HomeKit host.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use hkmedia_core::MediaConfig;
use hkmedia_core::tracing_setup::{CliLogLevel, LogSettings};

#[derive(Parser)]
#[command(name = "hkmedia")]
#[command(about = "HomeKit camera media transport tools")]
struct Cli {
    /// Console log level (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "info")]
    log_level: CliLogLevel,

    /// Directory for the full trace of this run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logging = LogSettings::new(cli.log_level);
    if let Some(dir) = cli.logs_dir {
        logging = logging.logs_dir(dir);
    }
    logging.install().context("Failed to initialize tracing")?;

    let config = MediaConfig::from_env();
    commands::run_command(cli.command, &config).await
}
