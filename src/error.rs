use thiserror::Error;

/// Errors raised by the embedded store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Analysis index {index} out of range (context holds {len} analyses)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store is closed")]
    Closed,

    #[error("Store task failed: {0}")]
    TaskFailed(String),
}

impl StorageError {
    pub fn stream_not_found(id: &str) -> Self {
        StorageError::NotFound {
            kind: "stream",
            id: id.to_string(),
        }
    }
}

/// Errors that can occur during analysis
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("No logs to analyze")]
    EmptyInput,
}

/// Errors from the optional external classifier
///
/// These never reach callers of the analyzer: every variant is recovered by
/// falling back to the pattern classifier.
#[derive(Error, Debug, Clone)]
pub enum ExternalClassifierError {
    #[error("Backend communication failed: {0}")]
    BackendError(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    HttpError(String),
}

impl From<reqwest::Error> for ExternalClassifierError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExternalClassifierError::Timeout
        } else {
            ExternalClassifierError::HttpError(err.to_string())
        }
    }
}

/// Errors that terminate a tailer
#[derive(Error, Debug)]
pub enum TailerError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Tailer task aborted: {0}")]
    Aborted(String),
}

/// Errors returned by the hub handle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Hub coordination loop has stopped")]
    Closed,
}

/// Errors raised while delivering a record to one subscriber
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Subscriber disconnected")]
    Disconnected,

    #[error("Subscriber buffer full")]
    Lagged,
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Errors surfaced by the service layer to the transport boundary
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl ServiceError {
    /// HTTP status the transport layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Storage(StorageError::NotFound { .. }) => 404,
            ServiceError::Storage(StorageError::IndexOutOfRange { .. }) => 400,
            ServiceError::Storage(_) => 500,
            ServiceError::Analysis(AnalysisError::EmptyInput) => 404,
            ServiceError::Hub(_) => 503,
            ServiceError::BadRequest(_) => 400,
        }
    }
}
