//! Run configuration loading and parsing

use anyhow::{bail, Context, Result};
use decay_reco::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from a TOML file)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputConfig {
    /// JSON-lines event files, read in order
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    /// CSV file for the output table (default: stdout)
    pub path: Option<PathBuf>,
    /// Write the statistics report here in addition to the log
    pub report: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessingConfig {
    /// Worker threads; 0 lets rayon decide
    #[serde(default)]
    pub threads: usize,
    /// Events handed to the workers at once
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Stop after this many events
    pub max_events: Option<usize>,
}

fn default_batch_size() -> usize {
    256
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self { threads: 0, batch_size: default_batch_size(), max_events: None }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    if config.processing.batch_size == 0 {
        bail!("processing.batch_size must be at least 1");
    }

    // Relative input paths are relative to the config file
    if let Some(dir) = path.parent() {
        for file in &mut config.input.files {
            if file.is_relative() {
                *file = dir.join(&*file);
            }
        }
    }

    Ok(config)
}
