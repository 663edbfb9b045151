//! `check-config`: validate a configuration file

use anyhow::{Context as _, Result};
use clap::Args;
use lipwatch_orchestrator::PipelineConfig;
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct CheckConfigCommand {
    /// Pipeline configuration (YAML)
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,
}

impl CheckConfigCommand {
    pub fn execute(self) -> Result<()> {
        print!("{}", effective_config(&self.config)?);
        Ok(())
    }
}

/// The configuration at `path` after environment overrides and validation,
/// as YAML
pub fn effective_config(path: &Path) -> Result<String> {
    let config = PipelineConfig::load(path).with_context(|| format!("Invalid configuration {}", path.display()))?;
    serde_yaml::to_string(&config).context("Failed to serialize configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_effective_config_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_workers: 3\nstreams:\n  - id: cam\n    source: /dev/video0\n    type: webcam").unwrap();

        let yaml = effective_config(file.path()).unwrap();
        let config: PipelineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.shutdown_timeout_ms, PipelineConfig::default().shutdown_timeout_ms);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "confidence_threshold: 3.0").unwrap();

        let err = effective_config(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("confidence_threshold"));
    }
}
