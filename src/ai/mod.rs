/// Analyzer, pattern classifier and external classifier backends
pub mod analyzer;
pub mod backends;
pub mod patterns;

pub use analyzer::Analyzer;
pub use backends::{ExternalClassifier, OpenAICompatibleBackend};
pub use patterns::{ErrorPattern, PatternClassifier};

use crate::events::{Analysis, Severity, Timestamp};

/// Verdict produced by a classifier, before it is stamped with a stream and time
///
/// This matches the JSON object external classifiers are asked to return.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub summary: String,
    pub root_cause: String,
    pub severity: Severity,
    pub fixes: Vec<String>,
    pub context: Option<String>,
}

impl Classification {
    pub fn into_analysis(self, stream_id: &str, timestamp: Timestamp) -> Analysis {
        Analysis {
            timestamp,
            stream_id: stream_id.to_string(),
            summary: self.summary,
            root_cause: self.root_cause,
            severity: self.severity,
            fixes: self.fixes,
            context: self.context.filter(|c| !c.trim().is_empty()),
        }
    }
}
