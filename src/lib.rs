/// Error types for the pipeline
pub mod error;

/// Core data model
pub mod events;

/// File tailing and line parsing
pub mod ingest;

/// Embedded transactional store
pub mod storage;

/// Live fan-out to subscribers
pub mod hub;

/// Pattern and external classifiers
pub mod ai;

/// Boundary operations for the external API
pub mod service;

/// Configuration management
pub mod config;

/// Self-monitoring metrics
pub mod monitoring;

// Re-export commonly used types
pub use error::{
    AnalysisError, ConfigError, ExternalClassifierError, HubError, ServiceError, StorageError,
    TailerError,
};
pub use events::{Analysis, LogLevel, LogRecord, Severity, Stream, StreamContext};
pub use service::LogService;
pub use storage::Store;
