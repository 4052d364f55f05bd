/// Configuration management
#[allow(clippy::module_inception)]
pub mod config;

pub use config::{AnalyzerConfig, Config, HubConfig, IngestConfig, StorageConfig};
