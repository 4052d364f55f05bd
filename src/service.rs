//! Boundary operations behind the HTTP and live APIs
//!
//! `LogService` is what a transport layer calls: it validates request parameters,
//! maps errors to client-visible payloads and serializes analyze/resolve per stream.

use crate::ai::Analyzer;
use crate::error::{AnalysisError, ServiceError, StorageError};
use crate::events::{Analysis, LogLevel, LogRecord, Stream, StreamContext, Timestamp};
use crate::hub::{HubHandle, Subscription};
use crate::storage::{LogQuery, Store};
use chrono::{Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Records returned by a logs request without an explicit limit
pub const DEFAULT_LOG_LIMIT: usize = 100;

/// Records replayed to a live subscriber before live delivery
pub const LIVE_HISTORY_LIMIT: usize = 100;

/// Query parameters of `GET /streams/{id}/logs`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct LogsRequest {
    /// Absent or 0 means the default limit
    pub limit: Option<usize>,
    /// Duration such as "90s", "5m" or "1h30m"; unparsable values are ignored
    pub since: Option<String>,
    /// Comma-separated levels, case-insensitive
    pub levels: Option<String>,
}

impl LogsRequest {
    /// Resolve the request into a store query relative to `now`
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::BadRequest` for an unknown level name.
    pub fn to_query(&self, now: Timestamp) -> Result<LogQuery, ServiceError> {
        let limit = match self.limit {
            Some(limit) if limit > 0 => limit,
            _ => DEFAULT_LOG_LIMIT,
        };

        let since = self
            .since
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| {
                let parsed = parse_duration(s);
                if parsed.is_none() {
                    debug!("Ignoring unparsable since={:?}", s);
                }
                parsed
            })
            .map(|duration| now - duration);

        let mut levels = Vec::new();
        for token in self
            .levels
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            let level = LogLevel::from_token(token)
                .ok_or_else(|| ServiceError::BadRequest(format!("unknown level: {}", token)))?;
            if !levels.contains(&level) {
                levels.push(level);
            }
        }

        Ok(LogQuery {
            limit,
            since,
            levels,
        })
    }
}

/// Body of `POST /streams/{id}/resolve`
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ResolveRequest {
    pub analysis_index: usize,
    #[serde(default)]
    pub note: String,
}

/// Structured error payload
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub status: u16,
}

impl From<&ServiceError> for ErrorBody {
    fn from(err: &ServiceError) -> Self {
        Self {
            error: err.to_string(),
            status: err.status_code(),
        }
    }
}

/// A live channel: recent history first, then every new record
pub struct LiveSession {
    pub history: Vec<LogRecord>,
    pub subscription: Subscription,
}

/// Operations backing the external API
pub struct LogService {
    store: Arc<Store>,
    analyzer: Analyzer,
    hub: HubHandle,
    batch_size: usize,
    stream_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LogService {
    pub fn new(store: Arc<Store>, analyzer: Analyzer, hub: HubHandle, batch_size: usize) -> Self {
        Self {
            store,
            analyzer,
            hub,
            batch_size: batch_size.max(1),
            stream_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Serialization point for context read-modify-write on one stream
    fn stream_lock(&self, stream_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .stream_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(stream_id.to_string()).or_default())
    }

    /// Give back a lock taken with `stream_lock`, forgetting it once nobody holds it
    fn release_stream_lock(&self, stream_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .stream_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(lock);
        if locks
            .get(stream_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(stream_id);
        }
    }

    pub async fn list_streams(&self) -> Result<Vec<Stream>, ServiceError> {
        Ok(self.store.call(|store| store.list_streams()).await?)
    }

    pub async fn get_stream(&self, stream_id: &str) -> Result<Stream, ServiceError> {
        let stream_id = stream_id.to_string();
        Ok(self
            .store
            .call(move |store| store.get_stream(&stream_id))
            .await?)
    }

    pub async fn get_logs(
        &self,
        stream_id: &str,
        request: &LogsRequest,
    ) -> Result<Vec<LogRecord>, ServiceError> {
        let query = request.to_query(Utc::now())?;
        let stream_id = stream_id.to_string();
        Ok(self
            .store
            .call(move |store| store.get_logs(&stream_id, &query))
            .await?)
    }

    /// Analyze the most recent records of a stream and record the result
    ///
    /// The analysis is persisted and its summary appended to the stream context in
    /// one transaction.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown stream and `EmptyInput` when the
    /// stream holds no records.
    pub async fn analyze_stream(&self, stream_id: &str) -> Result<Analysis, ServiceError> {
        let lock = self.stream_lock(stream_id);
        let result = {
            let _guard = lock.lock().await;
            self.analyze_locked(stream_id).await
        };
        self.release_stream_lock(stream_id, lock);
        result
    }

    async fn analyze_locked(&self, stream_id: &str) -> Result<Analysis, ServiceError> {
        let owned_id = stream_id.to_string();
        let batch_size = self.batch_size;
        let records = self
            .store
            .call(move |store| {
                let records = store.get_logs(&owned_id, &LogQuery::latest(batch_size))?;
                if records.is_empty() {
                    // Distinguish an unknown stream from an empty one
                    store.get_stream(&owned_id)?;
                }
                Ok(records)
            })
            .await?;
        if records.is_empty() {
            return Err(AnalysisError::EmptyInput.into());
        }

        info!(
            "Analysis requested for {} ({} records)",
            stream_id,
            records.len()
        );
        let analysis = self.analyzer.analyze(stream_id, &records).await?;
        let keywords = self.analyzer.recurring_keywords(&records);
        let analysis = self
            .store
            .call(move |store| {
                store.record_analysis(&analysis, &keywords)?;
                Ok(analysis)
            })
            .await?;
        Ok(analysis)
    }

    /// A stream's context, empty for a stream with no history
    pub async fn get_context(&self, stream_id: &str) -> Result<StreamContext, ServiceError> {
        let stream_id = stream_id.to_string();
        Ok(self
            .store
            .call(move |store| store.get_context(&stream_id))
            .await?)
    }

    /// Mark one analysis summary as resolved
    ///
    /// # Errors
    ///
    /// An out-of-range index is a client error and leaves the context unchanged.
    pub async fn resolve(
        &self,
        stream_id: &str,
        request: &ResolveRequest,
    ) -> Result<StreamContext, ServiceError> {
        let lock = self.stream_lock(stream_id);
        let result = {
            let _guard = lock.lock().await;
            let owned_id = stream_id.to_string();
            let index = request.analysis_index;
            let note = Some(request.note.clone()).filter(|n| !n.trim().is_empty());
            self.store
                .call(move |store| store.resolve_analysis(&owned_id, index, note))
                .await
        };
        self.release_stream_lock(stream_id, lock);

        let ctx = result?;
        info!(
            "Analysis {} of {} marked resolved",
            request.analysis_index, stream_id
        );
        Ok(ctx)
    }

    pub async fn analysis_history(
        &self,
        stream_id: &str,
        limit: usize,
    ) -> Result<Vec<Analysis>, ServiceError> {
        let stream_id = stream_id.to_string();
        Ok(self
            .store
            .call(move |store| store.get_analysis_history(&stream_id, limit))
            .await?)
    }

    /// Open a live channel on a stream
    ///
    /// The subscription is registered before history is read, so no record falls in
    /// between; a record arriving in that gap may appear in both.
    pub async fn open_live(&self, stream_id: &str) -> Result<LiveSession, ServiceError> {
        let subscription = self.hub.subscribe(stream_id).await?;
        let owned_id = stream_id.to_string();
        let history = match self
            .store
            .call(move |store| store.get_logs(&owned_id, &LogQuery::latest(LIVE_HISTORY_LIMIT)))
            .await
        {
            Ok(history) => history,
            Err(e) => {
                self.hub.unregister(stream_id, subscription.id).await?;
                return Err(e.into());
            }
        };
        debug!(
            "Live channel {} opened on {} with {} history records",
            subscription.id,
            stream_id,
            history.len()
        );
        Ok(LiveSession {
            history,
            subscription,
        })
    }

    /// Close a live channel
    pub async fn close_live(&self, session: LiveSession) -> Result<(), ServiceError> {
        let Subscription { id, stream_id, .. } = session.subscription;
        self.hub.unregister(&stream_id, id).await?;
        debug!("Live channel {} on {} closed", id, stream_id);
        Ok(())
    }
}

impl From<StorageError> for ErrorBody {
    fn from(err: StorageError) -> Self {
        ErrorBody::from(&ServiceError::from(err))
    }
}

/// Parse a duration like "300ms", "90s", "5m" or "1h30m"
///
/// Accepts the units ns, us, µs, ms, s, m and h with optional fractions. Returns
/// `None` for anything else.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text == "0" {
        return Some(Duration::zero());
    }

    let mut rest = text;
    let mut total_nanos: f64 = 0.0;
    let mut parsed_any = false;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return None,
        };
        rest = &rest[unit_len..];

        total_nanos += value * nanos_per_unit;
        parsed_any = true;
    }

    if !parsed_any || !total_nanos.is_finite() || total_nanos > i64::MAX as f64 {
        return None;
    }
    Some(Duration::nanoseconds(total_nanos as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::events::Severity;
    use crate::hub;
    use crate::ingest::parse_line;
    use chrono::TimeZone;

    fn service() -> LogService {
        let store = Arc::new(Store::open_in_memory(10_000).unwrap());
        let (hub, _task) = hub::spawn(&HubConfig::default(), None);
        let analyzer = Analyzer::new(Arc::clone(&store));
        LogService::new(store, analyzer, hub, 100)
    }

    fn ingest(service: &LogService, stream_id: &str, lines: &[&str]) {
        let records: Vec<_> = lines.iter().map(|l| parse_line(stream_id, l)).collect();
        service.store().append_logs(stream_id, &records).unwrap();
    }

    fn scenario_a_lines() -> Vec<&'static str> {
        vec![
            "[ERROR] connection refused to db",
            "[ERROR] connection refused to db",
            "[ERROR] connection refused to db",
            "[INFO] health check ok",
            "[INFO] health check ok",
        ]
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s"), Some(Duration::seconds(90)));
        assert_eq!(parse_duration("5m"), Some(Duration::minutes(5)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration("1.5h"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration("250ms"), Some(Duration::milliseconds(250)));
        assert_eq!(parse_duration("0"), Some(Duration::zero()));
        assert_eq!(parse_duration("5"), None);
        assert_eq!(parse_duration("5 minutes"), None);
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_logs_request_defaults() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let query = LogsRequest::default().to_query(now).unwrap();
        assert_eq!(query.limit, DEFAULT_LOG_LIMIT);
        assert!(query.since.is_none());
        assert!(query.levels.is_empty());

        let query = LogsRequest {
            limit: Some(0),
            since: Some("not-a-duration".to_string()),
            levels: Some(" ".to_string()),
        }
        .to_query(now)
        .unwrap();
        assert_eq!(query.limit, DEFAULT_LOG_LIMIT);
        assert!(query.since.is_none());
    }

    #[test]
    fn test_logs_request_parses_since_and_levels() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let query = LogsRequest {
            limit: Some(5),
            since: Some("1h".to_string()),
            levels: Some("error, warn,ERROR".to_string()),
        }
        .to_query(now)
        .unwrap();

        assert_eq!(query.limit, 5);
        assert_eq!(
            query.since,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap())
        );
        assert_eq!(query.levels, vec![LogLevel::Error, LogLevel::Warn]);

        let bad = LogsRequest {
            levels: Some("error,loud".to_string()),
            ..LogsRequest::default()
        };
        let err = bad.to_query(now).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_analyze_scenario_end_to_end() {
        let service = service();
        ingest(&service, "s1", &scenario_a_lines());

        let analysis = service.analyze_stream("s1").await.unwrap();
        assert_eq!(analysis.severity, Severity::P1);
        assert!(analysis.root_cause.contains("Network connectivity"));
        assert!(analysis
            .fixes
            .iter()
            .any(|fix| fix.contains("firewall") || fix.contains("connectivity")));

        let ctx = service.get_context("s1").await.unwrap();
        assert_eq!(ctx.analyses.len(), 1);
        assert_eq!(ctx.analyses[0].summary, analysis.summary);
        assert!(!ctx.analyses[0].resolved);
        assert!(ctx.patterns.common_errors.contains(&"refused".to_string()));
        assert_eq!(ctx.total_logs, 5);
        assert_eq!(ctx.error_count, 3);

        let history = service.analysis_history("s1", 10).await.unwrap();
        assert_eq!(history, vec![analysis]);

        let stream = service.get_stream("s1").await.unwrap();
        assert!(stream.context_summary.starts_with("Last: Detected connection issue"));
    }

    #[tokio::test]
    async fn test_second_analysis_links_unresolved_issue() {
        let service = service();
        ingest(&service, "s1", &scenario_a_lines());

        let first = service.analyze_stream("s1").await.unwrap();
        let second = service.analyze_stream("s1").await.unwrap();
        assert_eq!(
            second.context,
            Some(format!(
                "May be related to previous unresolved issue: {} ({})",
                first.summary, first.severity
            ))
        );
    }

    #[tokio::test]
    async fn test_analyze_unknown_stream_is_not_found() {
        let service = service();
        let err = service.analyze_stream("nope").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(matches!(
            err,
            ServiceError::Storage(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_analyze_empty_stream_is_empty_input() {
        let service = service();
        service.store().update_stream(&Stream::new("s1")).unwrap();

        let err = service.analyze_stream("s1").await.unwrap_err();
        assert!(matches!(err, ServiceError::Analysis(AnalysisError::EmptyInput)));
        assert_eq!(ErrorBody::from(&err).status, 404);
    }

    #[tokio::test]
    async fn test_concurrent_analyses_keep_every_summary() {
        let service = Arc::new(service());
        ingest(&service, "s1", &scenario_a_lines());

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.analyze_stream("s1").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(service.get_context("s1").await.unwrap().analyses.len(), 4);
    }

    #[tokio::test]
    async fn test_resolve_and_out_of_range() {
        let service = service();
        ingest(&service, "s1", &scenario_a_lines());
        service.analyze_stream("s1").await.unwrap();

        let before = service.get_context("s1").await.unwrap();
        let err = service
            .resolve(
                "s1",
                &ResolveRequest {
                    analysis_index: 5,
                    note: "nope".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(service.get_context("s1").await.unwrap(), before);

        let request: ResolveRequest =
            serde_json::from_str(r#"{"analysis_index":0,"note":"restarted the db"}"#).unwrap();
        let ctx = service.resolve("s1", &request).await.unwrap();
        assert!(ctx.analyses[0].resolved);
        assert_eq!(
            ctx.analyses[0].resolution_note.as_deref(),
            Some("restarted the db")
        );
    }

    fn tracked_locks(service: &LogService) -> usize {
        service.stream_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_stream_locks_are_released_after_use() {
        let service = service();
        assert!(service.analyze_stream("nope").await.is_err());
        assert!(service
            .resolve(
                "nope",
                &ResolveRequest {
                    analysis_index: 0,
                    note: String::new(),
                },
            )
            .await
            .is_err());
        assert_eq!(tracked_locks(&service), 0);

        ingest(&service, "s1", &scenario_a_lines());
        service.analyze_stream("s1").await.unwrap();
        assert_eq!(tracked_locks(&service), 0);
    }

    #[tokio::test]
    async fn test_stream_lock_survives_while_another_caller_waits() {
        let service = service();
        let held = service.stream_lock("s1");
        let waiting = service.stream_lock("s1");

        service.release_stream_lock("s1", held);
        assert_eq!(tracked_locks(&service), 1);

        service.release_stream_lock("s1", waiting);
        assert_eq!(tracked_locks(&service), 0);
    }

    // Scenario D
    #[tokio::test]
    async fn test_context_of_unknown_stream_is_empty() {
        let service = service();
        let ctx = service.get_context("never-seen").await.unwrap();
        assert!(ctx.analyses.is_empty());
        assert_eq!(ctx.total_logs, 0);
        assert_eq!(ctx.error_count, 0);
    }

    #[tokio::test]
    async fn test_get_logs_and_streams() {
        let service = service();
        ingest(
            &service,
            "file:/var/log/app.log",
            &["[INFO] boot", "[ERROR] failed to bind", "[WARN] slow"],
        );

        let errors = service
            .get_logs(
                "file:/var/log/app.log",
                &LogsRequest {
                    levels: Some("error".to_string()),
                    ..LogsRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "failed to bind");

        let streams = service.list_streams().await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].name, "app.log");
        assert_eq!(
            service.get_stream("missing").await.unwrap_err().status_code(),
            404
        );
    }

    #[tokio::test]
    async fn test_live_session_history_then_live() {
        let service = service();
        ingest(&service, "s1", &["[INFO] old one", "[INFO] old two"]);

        let mut session = service.open_live("s1").await.unwrap();
        let history: Vec<_> = session.history.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(history, vec!["old one", "old two"]);

        service
            .hub
            .publish(parse_line("s1", "[WARN] fresh"))
            .await
            .unwrap();
        assert_eq!(session.subscription.recv().await.unwrap().message, "fresh");

        service.close_live(session).await.unwrap();
        assert_eq!(service.hub.subscriber_count("s1").await.unwrap(), 0);
    }

    #[test]
    fn test_error_body_serialization() {
        let body = ErrorBody::from(StorageError::stream_not_found("s9"));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], 404);
        assert_eq!(json["error"], "stream not found: s9");
    }
}
