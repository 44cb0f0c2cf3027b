//! `lifeline.toml` loading.

use lifeline_core::{CoordinatorConfig, DegradationConfig};
use lifeline_graph::GraphConfig;
use lifeline_redis::RedisConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "lifeline.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifelineConfig {
    pub redis: RedisConfig,
    pub neo4j: GraphConfig,
    pub coordinator: CoordinatorConfig,
    pub degradation: DegradationConfig,
}

impl LifelineConfig {
    /// Load from `path`, or from `lifeline.toml` if present, then apply
    /// environment overrides.
    ///
    /// An explicit path must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.redis.apply_env();
        config.neo4j.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordinator.validate().map_err(ConfigError::Invalid)?;
        self.degradation.validate().map_err(ConfigError::Invalid)?;
        if self.redis.key_prefix.is_empty() {
            return Err(ConfigError::Invalid("redis.key_prefix must not be empty".to_string()));
        }
        Ok(())
    }
}
