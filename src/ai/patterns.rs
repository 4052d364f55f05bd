//! Deterministic keyword classifier
//!
//! Scores a batch against a fixed list of known failure patterns. The same batch and
//! context always produce the same classification, which makes this classifier the
//! offline answer whenever no external model is configured or the model fails.

use crate::ai::Classification;
use crate::events::{LogLevel, LogRecord, Severity, StreamContext};

/// Known failure signature
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPattern {
    pub keywords: Vec<&'static str>,
    pub root_cause: &'static str,
    /// Suggested fixes, most relevant first
    pub fixes: Vec<&'static str>,
    /// Severity this pattern escalates to when matched
    pub severity: Severity,
}

impl ErrorPattern {
    fn new(
        keywords: &[&'static str],
        root_cause: &'static str,
        fixes: &[&'static str],
        severity: Severity,
    ) -> Self {
        Self {
            keywords: keywords.to_vec(),
            root_cause,
            fixes: fixes.to_vec(),
            severity,
        }
    }
}

/// Patterns in matching order; ties go to the earlier entry
pub fn default_patterns() -> Vec<ErrorPattern> {
    vec![
        ErrorPattern::new(
            &["connection", "timeout", "refused"],
            "Network connectivity issue - service unreachable or connection timing out",
            &[
                "Check network connectivity and firewall rules",
                "Verify target service is running and accessible",
                "Review connection timeout settings",
            ],
            Severity::P1,
        ),
        ErrorPattern::new(
            &["out of memory", "oom", "memory limit"],
            "Application exceeding memory limits",
            &[
                "Increase memory allocation for the container/pod",
                "Review memory leaks in application code",
                "Enable memory profiling to identify hot spots",
            ],
            Severity::P0,
        ),
        ErrorPattern::new(
            &["database", "db", "sql", "query"],
            "Database-related error - connection, query, or schema issue",
            &[
                "Verify database connection parameters",
                "Check database server status and load",
                "Review query performance and indexes",
            ],
            Severity::P1,
        ),
        ErrorPattern::new(
            &["authentication", "auth", "unauthorized", "403", "401"],
            "Authentication or authorization failure",
            &[
                "Verify API keys and credentials are valid",
                "Check token expiration and refresh mechanisms",
                "Review RBAC policies and permissions",
            ],
            Severity::P2,
        ),
        ErrorPattern::new(
            &["disk", "storage", "volume", "no space"],
            "Storage capacity issue - disk full or volume mount problem",
            &[
                "Check available disk space on nodes",
                "Review log rotation and cleanup policies",
                "Increase persistent volume size if needed",
            ],
            Severity::P0,
        ),
        ErrorPattern::new(
            &["crash", "panic", "fatal", "segfault"],
            "Critical application crash or fatal error",
            &[
                "Review application logs for stack traces",
                "Check recent code deployments for regressions",
                "Enable core dumps for debugging",
            ],
            Severity::P0,
        ),
        ErrorPattern::new(
            &["ssl", "tls", "certificate", "x509"],
            "SSL/TLS certificate validation failure",
            &[
                "Verify certificate expiration dates",
                "Check certificate chain and CA trust",
                "Review certificate SANs and hostname matching",
            ],
            Severity::P1,
        ),
        ErrorPattern::new(
            &["rate limit", "throttle", "429"],
            "API rate limiting or throttling in effect",
            &[
                "Implement exponential backoff in client code",
                "Review and increase rate limit quotas",
                "Optimize request patterns to reduce frequency",
            ],
            Severity::P2,
        ),
        ErrorPattern::new(
            &["dns", "resolve", "hostname"],
            "DNS resolution failure",
            &[
                "Check DNS server configuration",
                "Verify service names and namespace in K8s",
                "Review /etc/resolv.conf settings",
            ],
            Severity::P1,
        ),
        ErrorPattern::new(
            &["port", "bind", "address already in use"],
            "Port already in use - potential duplicate service",
            &[
                "Check for duplicate deployments on same port",
                "Review port allocation and conflicts",
                "Verify service discovery configuration",
            ],
            Severity::P2,
        ),
    ]
}

const GENERIC_FIXES: [&str; 3] = [
    "Review full error logs for detailed stack traces",
    "Check recent deployments or configuration changes",
    "Consult service documentation for common issues",
];

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "been", "before", "being", "could", "does", "error", "errors",
    "fatal", "from", "have", "into", "just", "more", "must", "only", "other", "over", "some",
    "such", "than", "that", "their", "them", "then", "there", "these", "they", "this", "those",
    "were", "what", "when", "where", "which", "while", "will", "with", "would", "your",
];

const MAX_SIGNIFICANT_WORDS: usize = 3;

/// Level counts that drive the baseline severity
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct LevelCounts {
    errors: usize,
    warnings: usize,
    fatal: bool,
}

impl LevelCounts {
    fn of(records: &[LogRecord]) -> Self {
        records.iter().fold(Self::default(), |mut counts, record| {
            match record.level {
                LogLevel::Fatal => {
                    counts.errors += 1;
                    counts.fatal = true;
                }
                LogLevel::Error => counts.errors += 1,
                LogLevel::Warn => counts.warnings += 1,
                LogLevel::Debug | LogLevel::Info => {}
            }
            counts
        })
    }

    /// Severity derived from counts alone
    fn baseline(&self) -> Severity {
        if self.fatal || self.errors > 50 {
            Severity::P0
        } else if self.errors > 10 {
            Severity::P1
        } else if self.errors > 0 || self.warnings > 20 {
            Severity::P2
        } else {
            Severity::P3
        }
    }
}

/// Keyword and severity scorer over a batch of records
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    patterns: Vec<ErrorPattern>,
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternClassifier {
    pub fn new() -> Self {
        Self::with_patterns(default_patterns())
    }

    pub fn with_patterns(patterns: Vec<ErrorPattern>) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &[ErrorPattern] {
        &self.patterns
    }

    /// Classify a batch in the light of the stream's context
    pub fn classify(&self, records: &[LogRecord], context: &StreamContext) -> Classification {
        let counts = LevelCounts::of(records);
        let messages = error_messages(records);
        let baseline = counts.baseline();

        let mut classification = match self.best_match(&messages) {
            Some(pattern) => Classification {
                summary: format!(
                    "Detected {} issue ({} errors in logs)",
                    pattern.keywords.first().copied().unwrap_or("known"),
                    counts.errors
                ),
                root_cause: pattern.root_cause.to_string(),
                severity: baseline.escalate(pattern.severity),
                fixes: pattern.fixes.iter().map(|fix| fix.to_string()).collect(),
                context: None,
            },
            None => {
                let words = significant_words(&messages);
                let (summary, root_cause) = if words.is_empty() {
                    (
                        format!("Generic errors detected ({} errors)", counts.errors),
                        "Unable to identify specific pattern. Manual investigation recommended."
                            .to_string(),
                    )
                } else {
                    let joined = words.join(", ");
                    (
                        format!(
                            "Recurring errors mentioning {} ({} errors)",
                            joined, counts.errors
                        ),
                        format!(
                            "No known failure pattern matched; errors repeatedly mention: {}",
                            joined
                        ),
                    )
                };
                Classification {
                    summary,
                    root_cause,
                    severity: baseline,
                    fixes: GENERIC_FIXES.iter().map(|fix| fix.to_string()).collect(),
                    context: None,
                }
            }
        };

        if let Some(latest) = context.latest_analysis().filter(|latest| !latest.resolved) {
            classification.context = Some(format!(
                "May be related to previous unresolved issue: {} ({})",
                latest.summary, latest.severity
            ));
        }

        classification
    }

    /// Pattern keywords present in the batch's error messages, in pattern order
    pub fn recurring_keywords(&self, records: &[LogRecord]) -> Vec<String> {
        let messages = error_messages(records);
        let mut keywords: Vec<String> = Vec::new();
        for pattern in &self.patterns {
            for keyword in &pattern.keywords {
                if keyword_matches(keyword, &messages) && !keywords.iter().any(|k| k == keyword) {
                    keywords.push(keyword.to_string());
                }
            }
        }
        keywords
    }

    /// Highest-scoring pattern, first one wins a tie, none when nothing scores
    fn best_match(&self, messages: &[String]) -> Option<&ErrorPattern> {
        let mut best: Option<(&ErrorPattern, usize)> = None;
        for pattern in &self.patterns {
            let score = pattern
                .keywords
                .iter()
                .filter(|keyword| keyword_matches(keyword, messages))
                .count();
            if score > best.map_or(0, |(_, best_score)| best_score) {
                best = Some((pattern, score));
            }
        }
        best.map(|(pattern, _)| pattern)
    }
}

/// Lowercased messages of ERROR and FATAL records
fn error_messages(records: &[LogRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|record| record.level.is_error())
        .map(|record| record.message.to_lowercase())
        .collect()
}

fn keyword_matches(keyword: &str, messages: &[String]) -> bool {
    let keyword = keyword.to_lowercase();
    messages.iter().any(|message| message.contains(&keyword))
}

/// Most frequent words longer than three characters, first seen wins a tie
fn significant_words(messages: &[String]) -> Vec<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for message in messages {
        for word in message
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| word.chars().count() > 3 && !STOPWORDS.contains(word))
        {
            match counts.iter_mut().find(|(seen, _)| seen == word) {
                Some((_, count)) => *count += 1,
                None => counts.push((word.to_string(), 1)),
            }
        }
    }

    // Stable sort keeps first-seen order among equal counts
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
        .into_iter()
        .take(MAX_SIGNIFICANT_WORDS)
        .map(|(word, _)| word)
        .collect()
}
