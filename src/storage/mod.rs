/// Embedded ring-buffer store for logs, stream metadata, context and analyses
pub mod store;

pub use store::{timestamp_key, LogQuery, Store, DEFAULT_MAX_LOGS_PER_STREAM, LOGS_BUCKET_PREFIX};
