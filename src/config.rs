//! Pipeline configuration.
//!
//! Resolution order, highest first:
//! 1. Command-line flag
//! 2. Environment variable (`ETL_DATABASE_PATH`, `ETL_RAW_DATA_DIR`, `ETL_LOG_FILTER`)
//! 3. TOML config file
//! 4. Compiled default
//!
//! The resolved value is passed into constructors; nothing below the CLI
//! reads the environment.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DATABASE_PATH: &str = "ETL_DATABASE_PATH";
pub const ENV_RAW_DATA_DIR: &str = "ETL_RAW_DATA_DIR";
pub const ENV_LOG_FILTER: &str = "ETL_LOG_FILTER";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// SQLite warehouse file
    pub database_path: PathBuf,
    /// Directory holding daily raw CSV drops
    pub raw_data_dir: PathBuf,
    /// Only files starting with this prefix are considered for ingestion
    pub file_prefix: String,
    pub busy_timeout_ms: u64,
    /// `tracing_subscriber::EnvFilter` directive used when RUST_LOG is unset
    pub log_filter: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            database_path: PathBuf::from("data/warehouse.db"),
            raw_data_dir: PathBuf::from("data/raw"),
            file_prefix: "daily_transactions_".to_string(),
            busy_timeout_ms: 5_000,
            log_filter: "ecommerce_etl=info,etl=info".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file; absent keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`)
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DATABASE_PATH) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup(ENV_RAW_DATA_DIR) {
            self.raw_data_dir = PathBuf::from(dir);
        }
        if let Some(filter) = lookup(ENV_LOG_FILTER) {
            self.log_filter = filter;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database_path is empty".to_string()));
        }
        if self.raw_data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("raw_data_dir is empty".to_string()));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
