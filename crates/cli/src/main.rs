//! lipwatch - multi-stream visual speech detection pipeline
//!
//! Command-line entry point: runs a pipeline from a YAML configuration until
//! interrupted, or validates a configuration.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::check_config::CheckConfigCommand;
use commands::run::RunCommand;

#[derive(Parser)]
#[command(
    name = "lipwatch",
    version,
    about = "Watch video streams and recognize speech from lip movement",
    after_help = "EXAMPLES:\n  \
                  # Run until Ctrl-C (or until every file stream ends)\n  \
                  lipwatch run --config pipeline.yaml\n\n  \
                  # Override the pool size for one run\n  \
                  LIPWATCH_MAX_WORKERS=8 lipwatch run --config pipeline.yaml\n\n  \
                  # Print the effective configuration\n  \
                  lipwatch check-config --config pipeline.yaml\n\n\
                  Logging follows RUST_LOG (default: lipwatch=info)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until SIGINT/SIGTERM
    Run(RunCommand),

    /// Validate a configuration and print it with defaults and overrides applied
    CheckConfig(CheckConfigCommand),
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default = if verbose { "lipwatch=debug" } else { "lipwatch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("Failed to set tracing subscriber")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Commands::Run(cmd) => cmd.execute(),
        Commands::CheckConfig(cmd) => cmd.execute(),
    }
}
