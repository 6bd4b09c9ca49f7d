//! CLI subcommands.

pub mod config;
pub mod run;

use std::path::{Path, PathBuf};

use segpipe_core::PipelineConfig;
use tracing::debug;

/// Per-user config file location.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("segpipe")
        .join("config.json")
}

/// Load `explicit` if given, else the per-user file if present, else defaults.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    if let Some(path) = explicit {
        debug!("Loading config from {}", path.display());
        return Ok(PipelineConfig::from_file(path)?);
    }

    let path = default_config_path();
    if path.exists() {
        debug!("Loading config from {}", path.display());
        Ok(PipelineConfig::from_file(&path)?)
    } else {
        Ok(PipelineConfig::default())
    }
}
