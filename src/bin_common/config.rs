//! Feed configuration loaded from YAML

use serde::{Deserialize, Serialize};
use std::path::Path;
use streamplex::{EngineConfig, Endpoint};
use thiserror::Error;
use tracing::info;

/// Environment variable that replaces `url` from the file
pub const URL_ENV_VAR: &str = "STREAM_URL";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config file: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Multi-stream feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// `ws://` or `wss://` endpoint shared by every subscription
    pub url: String,

    /// One connection is opened per topic
    pub topics: Vec<String>,

    /// Number of engines, each on its own thread
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Appended to each topic in subscribe requests (e.g. `@trade`)
    #[serde(default = "default_stream_suffix")]
    pub stream_suffix: String,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_shards() -> usize {
    1
}

fn default_stream_suffix() -> String {
    "@trade".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    30
}

impl FeedConfig {
    /// Load configuration from a YAML file
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        let yaml_content = std::fs::read_to_string(config_path)?;
        let mut config: FeedConfig = serde_yaml::from_str(&yaml_content)?;

        if let Ok(url) = std::env::var(URL_ENV_VAR) {
            info!("Overriding stream URL from environment variable");
            config.url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        Endpoint::parse(&self.url).map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.topics.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one topic is required".to_string(),
            ));
        }
        if let Some(topic) = self.topics.iter().find(|t| t.trim().is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "topic names cannot be blank (got {:?})",
                topic
            )));
        }

        if self.shards == 0 {
            return Err(ConfigError::ValidationError(
                "shards must be greater than 0".to_string(),
            ));
        }

        if self.stats_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "stats_interval_secs must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "log_level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        self.engine
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Log configuration summary
    pub fn log(&self) {
        info!("Configuration loaded:");
        info!("  Endpoint: {}", self.url);
        info!("  Topics: {} ({})", self.topics.len(), self.topics.join(", "));
        info!("  Stream suffix: {}", self.stream_suffix);
        info!("  Shards: {}", self.shards);
        info!("  Stats interval: {} seconds", self.stats_interval_secs);
        info!("  Log level: {}", self.log_level);
        self.engine.log();
    }
}
