use blobvault_core::{ChunkerConfig, MIN_ORDER, Result, VaultError, validate_set_name};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_backup_set")]
    pub backup_set: String,
    #[serde(default = "default_index_order")]
    pub index_order: usize,
    #[serde(default)]
    pub chunker: ChunkerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerSection {
    #[serde(default = "default_beta_high_threshold")]
    pub beta_high_threshold: u32,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for ChunkerSection {
    fn default() -> Self {
        Self {
            beta_high_threshold: default_beta_high_threshold(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("blobvault-data")
}

fn default_backup_set() -> String {
    "default".to_string()
}

fn default_index_order() -> usize {
    blobvault_core::DEFAULT_ORDER
}

fn default_beta_high_threshold() -> u32 {
    blobvault_core::chunker::DEFAULT_BETA_HIGH_THRESHOLD
}

fn default_read_buffer_size() -> usize {
    blobvault_core::chunker::DEFAULT_READ_BUFFER_SIZE
}

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix("BLOBVAULT")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Config {
    /// Load `path` if it exists, then apply `BLOBVAULT_*` overrides.
    /// Nested keys use a double underscore, as in
    /// `BLOBVAULT_CHUNKER__BETA_HIGH_THRESHOLD`.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::from_sources(path, environment())
    }

    fn from_sources(path: &str, env: ::config::Environment) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(env)
            .build()
            .map_err(|e| VaultError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| VaultError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.index_order < MIN_ORDER {
            return Err(VaultError::Config(format!(
                "index_order must be at least {}, got {}",
                MIN_ORDER, self.index_order
            )));
        }
        if self.chunker.beta_high_threshold == 0 || self.chunker.beta_high_threshold > 256 {
            return Err(VaultError::Config(format!(
                "chunker.beta_high_threshold must be in 1..=256, got {}",
                self.chunker.beta_high_threshold
            )));
        }
        if self.chunker.read_buffer_size == 0 {
            return Err(VaultError::Config(
                "chunker.read_buffer_size must be positive".to_string(),
            ));
        }
        validate_set_name(&self.backup_set)
            .map_err(|e| VaultError::Config(format!("backup_set: {}", e)))?;
        Ok(())
    }

    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            beta_high_threshold: self.chunker.beta_high_threshold,
            read_buffer_size: self.chunker.read_buffer_size,
        }
    }
}
