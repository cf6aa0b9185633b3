//! CLI configuration management.

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Working directory used when `--workdir` is not given.
    #[serde(default)]
    pub default_workdir: Option<PathBuf>,
    /// Global cap on concurrently running jobs.
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_max_parallel_jobs() -> usize {
    4
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            default_workdir: None,
            max_parallel_jobs: default_max_parallel_jobs(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl CliConfig {
    /// Load configuration from the user config directory.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Save configuration to the user config directory.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "gantry", "gantry")
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "default_workdir" => {
                self.default_workdir = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "max_parallel_jobs" => {
                let parsed: usize = value
                    .parse()
                    .with_context(|| format!("Invalid max_parallel_jobs: {value}"))?;
                if parsed == 0 {
                    bail!("max_parallel_jobs must be at least 1");
                }
                self.max_parallel_jobs = parsed;
            }
            "log_format" => {
                self.log_format = match value {
                    "text" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    _ => bail!("Invalid log format: {value}"),
                };
            }
            _ => bail!("Unknown config key: {key}"),
        }
        Ok(())
    }
}
