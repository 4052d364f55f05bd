use crate::ai::backends::{ExternalClassifier, OpenAICompatibleBackend};
use crate::ai::patterns::PatternClassifier;
use crate::config::AnalyzerConfig;
use crate::error::AnalysisError;
use crate::events::{Analysis, LogRecord, StreamContext};
use crate::monitoring::{AnalysisTimer, SelfMonitoringCollector};
use crate::storage::Store;
use chrono::Utc;
use log::{debug, info, warn};
use std::fmt::Write as _;
use std::sync::Arc;

/// Number of earlier analyses quoted in the prompt
const HISTORY_IN_PROMPT: usize = 3;

/// Context-aware log classifier
///
/// Loads the stream's accumulated context, asks the external classifier when one is
/// configured and falls back to the deterministic pattern classifier otherwise or on
/// any external failure. Holds no mutable state between calls.
pub struct Analyzer {
    store: Arc<Store>,
    external: Option<Arc<dyn ExternalClassifier>>,
    patterns: PatternClassifier,
    monitoring: Option<Arc<SelfMonitoringCollector>>,
}

impl Analyzer {
    /// Create an analyzer that only uses the pattern classifier
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            external: None,
            patterns: PatternClassifier::new(),
            monitoring: None,
        }
    }

    /// Create an analyzer, adding an external classifier when an API key is configured
    ///
    /// A backend that cannot be built is logged and left out.
    pub fn from_config(store: Arc<Store>, config: &AnalyzerConfig) -> Self {
        let analyzer = Self::new(store);
        match OpenAICompatibleBackend::from_config(config) {
            Ok(Some(backend)) => {
                info!("External classifier enabled: {} at {}", config.model, config.endpoint);
                analyzer.with_external(Arc::new(backend))
            }
            Ok(None) => {
                info!("No API key configured, using the pattern classifier only");
                analyzer
            }
            Err(e) => {
                warn!("External classifier unavailable, using the pattern classifier: {}", e);
                analyzer
            }
        }
    }

    pub fn with_external(mut self, external: Arc<dyn ExternalClassifier>) -> Self {
        self.external = Some(external);
        self
    }

    /// Set the self-monitoring collector for tracking latency and fallbacks
    pub fn set_monitoring(&mut self, monitoring: Arc<SelfMonitoringCollector>) {
        self.monitoring = Some(monitoring);
    }

    pub fn has_external(&self) -> bool {
        self.external.is_some()
    }

    /// Pattern keywords present in the batch's error messages
    pub fn recurring_keywords(&self, records: &[LogRecord]) -> Vec<String> {
        self.patterns.recurring_keywords(records)
    }

    /// Classify a batch of records for a stream
    ///
    /// # Errors
    ///
    /// Returns `AnalysisError::EmptyInput` if `records` is empty. Context and
    /// external classifier failures never surface.
    pub async fn analyze(
        &self,
        stream_id: &str,
        records: &[LogRecord],
    ) -> Result<Analysis, AnalysisError> {
        if records.is_empty() {
            return Err(AnalysisError::EmptyInput);
        }

        let timer = self
            .monitoring
            .as_ref()
            .map(|m| AnalysisTimer::start(Arc::clone(m)));

        let owned_id = stream_id.to_string();
        let context = match self
            .store
            .call(move |store| store.get_context(&owned_id))
            .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!("Could not load context for {}, analyzing without it: {}", stream_id, e);
                StreamContext::new(stream_id)
            }
        };

        let classification = match &self.external {
            Some(external) => {
                let prompt = self.format_prompt(stream_id, records, &context);
                match external.classify(&prompt).await {
                    Ok(classification) => {
                        debug!("{} classified {} records for {}", external.name(), records.len(), stream_id);
                        classification
                    }
                    Err(e) => {
                        warn!(
                            "External classifier {} failed for {}, falling back to patterns: {}",
                            external.name(),
                            stream_id,
                            e
                        );
                        if let Some(monitoring) = &self.monitoring {
                            monitoring.record_fallback();
                        }
                        self.patterns.classify(records, &context)
                    }
                }
            }
            None => self.patterns.classify(records, &context),
        };

        let analysis = classification.into_analysis(stream_id, Utc::now());

        if let Some(timer) = timer {
            let elapsed = timer.finish();
            info!(
                "Analysis of {} ({} records) completed in {:?}: {} {}",
                stream_id,
                records.len(),
                elapsed,
                analysis.severity,
                analysis.summary
            );
        } else {
            info!(
                "Analysis of {} ({} records): {} {}",
                stream_id,
                records.len(),
                analysis.severity,
                analysis.summary
            );
        }

        Ok(analysis)
    }

    /// Render the composite prompt sent to external classifiers
    ///
    /// Contains the stream id, the most recent analyses with their resolution state,
    /// recurring error keywords with the current error rate, every record as a
    /// leveled and timestamped line, and the expected answer format.
    pub fn format_prompt(
        &self,
        stream_id: &str,
        records: &[LogRecord],
        context: &StreamContext,
    ) -> String {
        let mut prompt = format!("# Log Analysis for Stream: {}\n\n", stream_id);

        if !context.analyses.is_empty() {
            prompt.push_str("## Historical Context\n");
            let skip = context.analyses.len().saturating_sub(HISTORY_IN_PROMPT);
            for summary in context.analyses.iter().skip(skip) {
                let _ = writeln!(
                    prompt,
                    "- {}: {} ({}, {})",
                    summary.timestamp.format("%Y-%m-%d %H:%M"),
                    summary.summary,
                    summary.severity,
                    if summary.resolved { "RESOLVED" } else { "UNRESOLVED" }
                );
            }
            prompt.push('\n');
        }

        if !context.patterns.common_errors.is_empty() {
            prompt.push_str("## Common Error Patterns\n");
            for keyword in &context.patterns.common_errors {
                let _ = writeln!(prompt, "- {}", keyword);
            }
            let _ = writeln!(
                prompt,
                "- Current error rate: {:.1}%\n",
                context.patterns.error_rate * 100.0
            );
        }

        let _ = writeln!(prompt, "## Recent Logs (Last {} Lines)", records.len());
        for record in records {
            let _ = writeln!(
                prompt,
                "[{}] [{}] {}",
                record.timestamp.format("%H:%M:%S"),
                record.level,
                record.message
            );
        }

        prompt.push_str(
            r#"
## Analysis Tasks
1. Is this related to any previous issues in the historical context?
2. Identify the root cause
3. Assign severity: P0 (critical), P1 (high), P2 (medium), P3 (low)
4. Suggest 2-3 actionable fixes

Respond in JSON format:
{
  "summary": "Brief one-line summary",
  "root_cause": "Detailed root cause analysis",
  "severity": "P0|P1|P2|P3",
  "fixes": ["Fix 1", "Fix 2", "Fix 3"],
  "context": "How this relates to previous issues"
}
"#,
        );

        prompt
    }
}
