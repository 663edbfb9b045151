//! `run`: start the pipeline and stop it on SIGINT/SIGTERM

use anyhow::{Context as _, Result};
use clap::Args;
use lipwatch_orchestrator::{Pipeline, PipelineComponents, PipelineConfig, ShutdownSummary};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// How often the run loop checks whether every stream has ended
const IDLE_CHECK: Duration = Duration::from_millis(250);

#[derive(Args)]
pub struct RunCommand {
    /// Pipeline configuration (YAML)
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,

    /// Keep running after every stream has ended
    #[arg(long)]
    pub keep_alive: bool,
}

impl RunCommand {
    pub fn execute(self) -> Result<()> {
        let config = PipelineConfig::load(&self.config)
            .with_context(|| format!("Invalid configuration {}", self.config.display()))?;
        info!(
            "Loaded {}: {} streams, {} workers, window {}, threshold {}",
            self.config.display(),
            config.enabled_streams().count(),
            config.max_workers,
            config.window_size,
            config.confidence_threshold
        );

        let components = PipelineComponents::from_config(&config)?;
        let pipeline = Pipeline::start(config, components).context("Failed to start pipeline")?;

        // The pipeline runs on its own threads; the runtime only waits for signals
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .context("Failed to create tokio runtime")?;
        runtime.block_on(wait_for_stop(&pipeline, self.keep_alive))?;

        let summary = pipeline.shutdown();
        report(&summary)
    }
}

async fn wait_for_stop(pipeline: &Pipeline, keep_alive: bool) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut idle_check = tokio::time::interval(IDLE_CHECK);

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                return Ok(());
            }
            _ = idle_check.tick() => {
                if !keep_alive && pipeline.is_idle() {
                    info!("All streams ended, shutting down");
                    return Ok(());
                }
            }
        }
    }
}

fn report(summary: &ShutdownSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(&summary.stats).context("Failed to serialize stats")?;
    println!("{json}");

    if !summary.is_clean() {
        warn!(
            "Unclean shutdown: timed out {:?}, {} results undelivered",
            summary.timed_out, summary.undrained
        );
    }
    Ok(())
}
