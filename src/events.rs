//! Core data model for log ingestion and analysis
//!
//! This module defines the records that flow through the pipeline: parsed log
//! lines, per-stream metadata, accumulated stream context and analysis results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Severity of a parsed log line
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// All levels, least severe first
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Fatal,
    ];

    /// Parse a level keyword, ignoring case and surrounding brackets
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim().trim_matches(|c| c == '[' || c == ']');
        match token.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// ERROR and FATAL lines count towards error statistics
    pub fn is_error(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Fatal)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single parsed log line
///
/// Records are immutable once created and always belong to exactly one stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    /// Timestamp found in the line, or the ingestion time
    pub timestamp: Timestamp,
    /// Detected level, INFO when none was found
    pub level: LogLevel,
    /// Line with level and timestamp tokens stripped
    pub message: String,
    /// The untouched original line
    pub raw: String,
    /// Free-form labels (pod, namespace, ...)
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Stream this record belongs to
    pub stream_id: String,
}

impl LogRecord {
    /// Create an INFO record stamped with the current time
    pub fn new(stream_id: impl Into<String>, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message: raw.clone(),
            raw,
            labels: BTreeMap::new(),
            stream_id: stream_id.into(),
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Kind of source a stream was read from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Container,
    Pod,
}

impl SourceKind {
    /// Derive the source kind from a stream id prefix such as `file:` or `k8s:`
    pub fn from_stream_id(stream_id: &str) -> Self {
        match stream_id.split_once(':').map(|(prefix, _)| prefix) {
            Some("docker") | Some("container") => SourceKind::Container,
            Some("k8s") | Some("kubectl") | Some("pod") => SourceKind::Pod,
            _ => SourceKind::File,
        }
    }
}

/// Metadata for one logical log source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stream {
    pub id: String,
    /// Display name
    pub name: String,
    pub source: SourceKind,
    pub active: bool,
    /// Records currently held in the stream's ring buffer
    #[serde(default)]
    pub log_count: u64,
    /// Records observed during the last minute
    #[serde(default)]
    pub logs_per_min: u64,
    /// Cached ratio of ERROR/FATAL lines to all lines
    #[serde(default)]
    pub error_rate: f64,
    pub last_seen: Timestamp,
    /// One-line summary of the latest analysis
    #[serde(default)]
    pub context_summary: String,
}

impl Stream {
    /// Create metadata for a stream seen for the first time
    pub fn new(id: &str) -> Self {
        let name = match id.split_once(':') {
            Some((_, rest)) if !rest.is_empty() => rest
                .rsplit('/')
                .next()
                .filter(|segment| !segment.is_empty())
                .unwrap_or(rest)
                .to_string(),
            _ => id.to_string(),
        };

        Self {
            id: id.to_string(),
            name,
            source: SourceKind::from_stream_id(id),
            active: true,
            log_count: 0,
            logs_per_min: 0,
            error_rate: 0.0,
            last_seen: Utc::now(),
            context_summary: String::new(),
        }
    }
}

/// Incident priority, P0 being the most urgent
///
/// Variants are declared least urgent first so that the derived ordering
/// matches urgency: `P0 > P1 > P2 > P3`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    P3,
    P2,
    P1,
    P0,
}

impl Severity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "P0" => Some(Severity::P0),
            "P1" => Some(Severity::P1),
            "P2" => Some(Severity::P2),
            "P3" => Some(Severity::P3),
            _ => None,
        }
    }

    /// Move towards `other` if it is more urgent, never away from it
    pub fn escalate(self, other: Severity) -> Severity {
        self.max(other)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::P0 => "P0",
            Severity::P1 => "P1",
            Severity::P2 => "P2",
            Severity::P3 => "P3",
        };
        f.write_str(label)
    }
}

/// Full result of one classification run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Analysis {
    pub timestamp: Timestamp,
    pub stream_id: String,
    pub summary: String,
    pub root_cause: String,
    pub severity: Severity,
    /// Suggested fixes, most relevant first
    #[serde(default)]
    pub fixes: Vec<String>,
    /// How this analysis relates to earlier ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Condensed analysis kept in a stream's context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSummary {
    pub timestamp: Timestamp,
    pub summary: String,
    pub root_cause: String,
    pub severity: Severity,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
}

impl From<&Analysis> for AnalysisSummary {
    fn from(analysis: &Analysis) -> Self {
        Self {
            timestamp: analysis.timestamp,
            summary: analysis.summary.clone(),
            root_cause: analysis.root_cause.clone(),
            severity: analysis.severity,
            resolved: false,
            resolution_note: None,
        }
    }
}

/// Recurring issues observed on a stream
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamPatterns {
    pub common_errors: Vec<String>,
    pub error_rate: f64,
}

/// Accumulated knowledge about a stream used to enrich future analyses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamContext {
    pub stream_id: String,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    /// Chronological by append order
    pub analyses: Vec<AnalysisSummary>,
    pub patterns: StreamPatterns,
    pub total_logs: u64,
    pub error_count: u64,
}

/// Upper bound on the recurring keyword list
pub const MAX_COMMON_ERRORS: usize = 10;

impl StreamContext {
    /// Empty context for a stream with no prior activity
    pub fn new(stream_id: &str) -> Self {
        let now = Utc::now();
        Self {
            stream_id: stream_id.to_string(),
            first_seen: now,
            last_seen: now,
            analyses: Vec::new(),
            patterns: StreamPatterns::default(),
            total_logs: 0,
            error_count: 0,
        }
    }

    /// Most recently appended analysis summary
    pub fn latest_analysis(&self) -> Option<&AnalysisSummary> {
        self.analyses.last()
    }

    /// Fold an ingested batch into the running totals
    pub fn record_batch(&mut self, total: u64, errors: u64, seen_at: Timestamp) {
        self.total_logs = self.total_logs.saturating_add(total);
        self.error_count = self.error_count.saturating_add(errors);
        self.last_seen = seen_at;
        if self.total_logs > 0 {
            self.patterns.error_rate = self.error_count as f64 / self.total_logs as f64;
        }
    }

    /// Merge keywords into the recurring list, keeping first-seen order
    pub fn merge_common_errors<I, S>(&mut self, keywords: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for keyword in keywords {
            let keyword = keyword.into();
            if self.patterns.common_errors.len() >= MAX_COMMON_ERRORS {
                break;
            }
            if !self.patterns.common_errors.contains(&keyword) {
                self.patterns.common_errors.push(keyword);
            }
        }
    }

    /// Mark the summary at `index` as resolved
    ///
    /// Returns `false` and leaves the context untouched when the index is out of range.
    pub fn resolve(&mut self, index: usize, note: Option<String>) -> bool {
        match self.analyses.get_mut(index) {
            Some(summary) => {
                summary.resolved = true;
                summary.resolution_note = note.filter(|n| !n.is_empty());
                true
            }
            None => false,
        }
    }
}
