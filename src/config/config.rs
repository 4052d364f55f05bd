use crate::error::ConfigError;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides `analyzer.api_key`
pub const API_KEY_ENV: &str = "LOGTIDE_API_KEY";

/// Application configuration loaded from a TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub hub: HubConfig,
    pub analyzer: AnalyzerConfig,
}

/// Embedded store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path
    pub path: PathBuf,
    /// Ring buffer capacity per stream
    pub max_logs_per_stream: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./logtide.db"),
            max_logs_per_stream: 10_000,
        }
    }
}

/// File tailing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Files tailed by `logtide run`
    pub files: Vec<PathBuf>,
    /// Lines replayed from the end of a file at startup
    pub backlog_lines: usize,
    /// Sliding window of raw lines kept while reading the backlog
    pub window_lines: usize,
    /// Delay between polls once the end of a file is reached
    pub poll_interval_ms: u64,
    /// Keep following after the backlog instead of stopping at end of file
    pub follow: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            backlog_lines: 100,
            window_lines: 10_000,
            poll_interval_ms: 250,
            follow: true,
        }
    }
}

/// Live fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of the hub command queue
    pub queue_capacity: usize,
    /// Per-subscriber buffer before a slow subscriber is dropped
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            subscriber_buffer: 1024,
        }
    }
}

/// External classifier settings
///
/// The external classifier is only used when an API key is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub api_key: Option<String>,
    /// Base URL of an OpenAI-compatible API
    pub endpoint: String,
    pub model: String,
    pub timeout_seconds: u64,
    /// Number of recent records analyzed per request
    pub batch_size: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.3-70b-versatile".to_string(),
            timeout_seconds: 30,
            batch_size: 100,
        }
    }
}

impl AnalyzerConfig {
    /// API key with empty values treated as absent
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read, and a parse or
    /// validation error if its content is invalid.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is missing or invalid
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            Some(path) => match Self::from_file(path) {
                Ok(config) => config,
                Err(ConfigError::ReadError(e)) => {
                    warn!("Configuration file not readable ({}), using defaults", e);
                    Self::default()
                }
                Err(e) => {
                    warn!(
                        "Invalid configuration in {}: {}; using defaults",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            None => Self::default(),
        }
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.analyzer.api_key = Some(key);
            }
        }
    }

    /// Check that all values are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.max_logs_per_stream == 0 {
            return Err(ConfigError::ValidationError(
                "storage.max_logs_per_stream must be greater than 0".to_string(),
            ));
        }
        if self.ingest.backlog_lines == 0 {
            return Err(ConfigError::ValidationError(
                "ingest.backlog_lines must be greater than 0".to_string(),
            ));
        }
        if self.ingest.window_lines < self.ingest.backlog_lines {
            return Err(ConfigError::ValidationError(format!(
                "ingest.window_lines ({}) must be at least ingest.backlog_lines ({})",
                self.ingest.window_lines, self.ingest.backlog_lines
            )));
        }
        if self.hub.queue_capacity == 0 || self.hub.subscriber_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "hub capacities must be greater than 0".to_string(),
            ));
        }
        if self.analyzer.endpoint.trim().is_empty() || self.analyzer.model.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "analyzer.endpoint and analyzer.model must not be empty".to_string(),
            ));
        }
        if self.analyzer.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "analyzer.batch_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
