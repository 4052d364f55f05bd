//! SQLite-backed store
//!
//! Every stream owns a ring buffer of at most `max_logs_per_stream` records. Records
//! are keyed by a fixed-width, lexicographically sortable nanosecond timestamp plus an
//! insertion sequence, so two lines sharing a timestamp are both kept and read back in
//! insertion order. Appends, evictions and the derived stream/context statistics are
//! applied in one transaction.

use crate::error::StorageError;
use crate::events::{
    Analysis, AnalysisSummary, LogLevel, LogRecord, Stream, StreamContext, Timestamp,
};
use chrono::{Duration, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Name-space prefix of per-stream log buckets
pub const LOGS_BUCKET_PREFIX: &str = "logs:";

/// Ring buffer capacity used when none is configured
pub const DEFAULT_MAX_LOGS_PER_STREAM: usize = 10_000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    id   TEXT PRIMARY KEY,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS context (
    stream_id TEXT PRIMARY KEY,
    data      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS analysis (
    key       TEXT PRIMARY KEY,
    stream_id TEXT NOT NULL,
    data      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_analysis_stream_key ON analysis(stream_id, key);

CREATE TABLE IF NOT EXISTS logs (
    seq    INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket TEXT NOT NULL,
    ts_key TEXT NOT NULL,
    data   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_bucket_key ON logs(bucket, ts_key, seq);
"#;

/// Serialize a timestamp into a fixed-width key that sorts chronologically
pub fn timestamp_key(timestamp: &Timestamp) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string()
}

fn bucket_name(stream_id: &str) -> String {
    format!("{}{}", LOGS_BUCKET_PREFIX, stream_id)
}

/// Filters for reading a stream's records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogQuery {
    /// Maximum number of records, 0 for no limit
    pub limit: usize,
    /// Only records strictly newer than this instant
    pub since: Option<Timestamp>,
    /// Only records with one of these levels, empty for all
    pub levels: Vec<LogLevel>,
}

impl LogQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// Transactional store for logs, streams, context and analyses
///
/// The connection sits behind a mutex, so writers are serialized and each reader
/// observes a committed snapshot.
pub struct Store {
    conn: Mutex<Option<Connection>>,
    max_logs_per_stream: usize,
}

impl Store {
    /// Open or create a database file
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Database` if the file cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path, max_logs_per_stream: usize) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(1))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("Opened {} (journal_mode={})", path.display(), mode);
        Self::init(conn, max_logs_per_stream)
    }

    /// Open a private in-memory database
    pub fn open_in_memory(max_logs_per_stream: usize) -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?, max_logs_per_stream)
    }

    fn init(conn: Connection, max_logs_per_stream: usize) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            max_logs_per_stream: max_logs_per_stream.max(1),
        })
    }

    /// Ring buffer capacity per stream
    pub fn max_logs_per_stream(&self) -> usize {
        self.max_logs_per_stream
    }

    /// Run store work on the blocking pool
    ///
    /// Transactions hold the connection mutex and do synchronous I/O; async callers
    /// go through here so a slow write only holds up the calling task.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or `StorageError::TaskFailed` if the blocking
    /// task panicked or was cancelled.
    pub async fn call<T, F>(self: &Arc<Self>, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Store) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StorageError::TaskFailed(e.to_string()))?
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Run `f` inside a transaction that commits only if `f` succeeds
    fn write<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` against a consistent snapshot
    fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.finish()?;
        Ok(value)
    }

    /// Persist records for a stream and update its derived statistics
    ///
    /// Inserts every record, evicts the oldest surplus records beyond the ring buffer
    /// capacity, creates or refreshes the stream metadata and folds the batch into the
    /// stream context, all in one transaction. Nothing is applied on error.
    pub fn append_logs(&self, stream_id: &str, records: &[LogRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        let bucket = bucket_name(stream_id);
        let cap = self.max_logs_per_stream;

        self.write(|tx| {
            let mut error_count = 0u64;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO logs (bucket, ts_key, data) VALUES (?1, ?2, ?3)",
                )?;
                for record in records {
                    let data = serde_json::to_string(record)?;
                    insert.execute(params![bucket, timestamp_key(&record.timestamp), data])?;
                    if record.level.is_error() {
                        error_count += 1;
                    }
                }
            }

            let mut count = count_bucket(tx, &bucket)?;
            if count > cap {
                let surplus = count - cap;
                let evicted = tx.execute(
                    "DELETE FROM logs WHERE seq IN (
                        SELECT seq FROM logs WHERE bucket = ?1
                        ORDER BY ts_key ASC, seq ASC LIMIT ?2
                    )",
                    params![bucket, surplus as i64],
                )?;
                debug!("Evicted {} records from {}", evicted, bucket);
                count -= evicted;
            }

            let now = Utc::now();

            let mut stream = load_stream(tx, stream_id)?.unwrap_or_else(|| {
                info!("New stream observed: {}", stream_id);
                Stream::new(stream_id)
            });
            stream.active = true;
            stream.last_seen = now;
            stream.log_count = count as u64;

            let mut ctx =
                load_context(tx, stream_id)?.unwrap_or_else(|| StreamContext::new(stream_id));
            ctx.record_batch(records.len() as u64, error_count, now);
            stream.error_rate = ctx.patterns.error_rate;

            save_stream(tx, &stream)?;
            save_context(tx, stream_id, &ctx)?;
            Ok(())
        })
    }

    /// Read a stream's records in chronological order
    ///
    /// Records are visited newest first so that `limit` keeps the most recent ones, and
    /// the result is reversed before returning. An unknown stream yields an empty vector.
    pub fn get_logs(&self, stream_id: &str, query: &LogQuery) -> Result<Vec<LogRecord>, StorageError> {
        let bucket = bucket_name(stream_id);
        let since_key = query.since.as_ref().map(timestamp_key).unwrap_or_default();

        self.read(|tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT data FROM logs WHERE bucket = ?1 AND ts_key > ?2
                 ORDER BY ts_key DESC, seq DESC",
            )?;
            let mut rows = stmt.query(params![bucket, since_key])?;

            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                if query.limit > 0 && records.len() >= query.limit {
                    break;
                }

                let data: String = row.get(0)?;
                let record: LogRecord = match serde_json::from_str(&data) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Skipping unreadable record in {}: {}", bucket, e);
                        continue;
                    }
                };

                if !query.levels.is_empty() && !query.levels.contains(&record.level) {
                    continue;
                }
                records.push(record);
            }

            records.reverse();
            Ok(records)
        })
    }

    /// Number of records currently held for a stream
    pub fn count_logs(&self, stream_id: &str) -> Result<usize, StorageError> {
        let bucket = bucket_name(stream_id);
        self.read(|tx| count_bucket(tx, &bucket))
    }

    /// All known streams, enriched with live statistics
    pub fn list_streams(&self) -> Result<Vec<Stream>, StorageError> {
        self.read(|tx| {
            let mut stmt = tx.prepare("SELECT data FROM streams ORDER BY id ASC")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut streams = Vec::with_capacity(rows.len());
            for data in rows {
                let stream: Stream = serde_json::from_str(&data)?;
                streams.push(enrich_stream(tx, stream)?);
            }
            Ok(streams)
        })
    }

    /// Stream metadata, enriched with live statistics
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no line was ever stored for the stream.
    pub fn get_stream(&self, stream_id: &str) -> Result<Stream, StorageError> {
        self.read(|tx| match load_stream(tx, stream_id)? {
            Some(stream) => enrich_stream(tx, stream),
            None => Err(StorageError::stream_not_found(stream_id)),
        })
    }

    /// Replace a stream's metadata record
    pub fn update_stream(&self, stream: &Stream) -> Result<(), StorageError> {
        self.write(|tx| save_stream(tx, stream))
    }

    /// A stream's context, or a fresh empty one if the stream has no history
    pub fn get_context(&self, stream_id: &str) -> Result<StreamContext, StorageError> {
        self.read(|tx| {
            Ok(load_context(tx, stream_id)?.unwrap_or_else(|| StreamContext::new(stream_id)))
        })
    }

    /// Replace a stream's context
    pub fn update_context(&self, stream_id: &str, ctx: &StreamContext) -> Result<(), StorageError> {
        self.write(|tx| save_context(tx, stream_id, ctx))
    }

    /// Append an analysis to the history
    pub fn store_analysis(&self, analysis: &Analysis) -> Result<(), StorageError> {
        self.write(|tx| save_analysis(tx, analysis))
    }

    /// Persist an analysis and fold its summary into the stream context
    ///
    /// `keywords` are merged into the context's recurring error list. Returns the
    /// updated context.
    pub fn record_analysis(
        &self,
        analysis: &Analysis,
        keywords: &[String],
    ) -> Result<StreamContext, StorageError> {
        let stream_id = analysis.stream_id.as_str();
        self.write(|tx| {
            save_analysis(tx, analysis)?;

            let mut ctx =
                load_context(tx, stream_id)?.unwrap_or_else(|| StreamContext::new(stream_id));
            ctx.analyses.push(AnalysisSummary::from(analysis));
            ctx.merge_common_errors(keywords.iter().cloned());
            save_context(tx, stream_id, &ctx)?;
            Ok(ctx)
        })
    }

    /// Mark the analysis summary at `index` as resolved
    ///
    /// # Errors
    ///
    /// Returns `StorageError::IndexOutOfRange` and leaves the context unchanged if the
    /// index does not address an existing summary.
    pub fn resolve_analysis(
        &self,
        stream_id: &str,
        index: usize,
        note: Option<String>,
    ) -> Result<StreamContext, StorageError> {
        self.write(|tx| {
            let mut ctx =
                load_context(tx, stream_id)?.unwrap_or_else(|| StreamContext::new(stream_id));
            if !ctx.resolve(index, note) {
                return Err(StorageError::IndexOutOfRange {
                    index,
                    len: ctx.analyses.len(),
                });
            }
            save_context(tx, stream_id, &ctx)?;
            Ok(ctx)
        })
    }

    /// Analyses for a stream in chronological order, the first `limit` of them
    ///
    /// A `limit` of 0 returns the whole history.
    pub fn get_analysis_history(
        &self,
        stream_id: &str,
        limit: usize,
    ) -> Result<Vec<Analysis>, StorageError> {
        let limit = if limit == 0 { -1 } else { limit as i64 };
        self.read(|tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT data FROM analysis WHERE stream_id = ?1 ORDER BY key ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![stream_id, limit], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut analyses = Vec::with_capacity(rows.len());
            for data in &rows {
                match serde_json::from_str::<Analysis>(data) {
                    Ok(analysis) => analyses.push(analysis),
                    Err(e) => warn!("Skipping unreadable analysis for {}: {}", stream_id, e),
                }
            }
            Ok(analyses)
        })
    }

    /// Close the database, further calls fail with `StorageError::Closed`
    ///
    /// Closing an already closed store is a no-op.
    pub fn close(&self) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            if let Err((conn, e)) = conn.close() {
                *guard = Some(conn);
                return Err(StorageError::Database(e));
            }
            info!("Store closed");
        }
        Ok(())
    }
}

fn count_bucket(conn: &Connection, bucket: &str) -> Result<usize, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM logs WHERE bucket = ?1",
        params![bucket],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn load_stream(conn: &Connection, stream_id: &str) -> Result<Option<Stream>, StorageError> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM streams WHERE id = ?1",
            params![stream_id],
            |row| row.get(0),
        )
        .optional()?;
    data.map(|d| serde_json::from_str(&d).map_err(StorageError::from))
        .transpose()
}

fn save_stream(conn: &Connection, stream: &Stream) -> Result<(), StorageError> {
    let data = serde_json::to_string(stream)?;
    conn.execute(
        "INSERT OR REPLACE INTO streams (id, data) VALUES (?1, ?2)",
        params![stream.id, data],
    )?;
    Ok(())
}

fn load_context(conn: &Connection, stream_id: &str) -> Result<Option<StreamContext>, StorageError> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM context WHERE stream_id = ?1",
            params![stream_id],
            |row| row.get(0),
        )
        .optional()?;
    data.map(|d| serde_json::from_str(&d).map_err(StorageError::from))
        .transpose()
}

fn save_context(conn: &Connection, stream_id: &str, ctx: &StreamContext) -> Result<(), StorageError> {
    let data = serde_json::to_string(ctx)?;
    conn.execute(
        "INSERT OR REPLACE INTO context (stream_id, data) VALUES (?1, ?2)",
        params![stream_id, data],
    )?;
    Ok(())
}

fn save_analysis(conn: &Connection, analysis: &Analysis) -> Result<(), StorageError> {
    let key = format!("{}:{}", analysis.stream_id, timestamp_key(&analysis.timestamp));
    let data = serde_json::to_string(analysis)?;
    conn.execute(
        "INSERT OR REPLACE INTO analysis (key, stream_id, data) VALUES (?1, ?2, ?3)",
        params![key, analysis.stream_id, data],
    )?;
    Ok(())
}

/// Fill in the derived fields of a stream from its bucket and context
fn enrich_stream(conn: &Connection, mut stream: Stream) -> Result<Stream, StorageError> {
    let bucket = bucket_name(&stream.id);
    stream.log_count = count_bucket(conn, &bucket)? as u64;

    let minute_ago = timestamp_key(&(Utc::now() - Duration::minutes(1)));
    let per_min: i64 = conn.query_row(
        "SELECT COUNT(*) FROM logs WHERE bucket = ?1 AND ts_key > ?2",
        params![bucket, minute_ago],
        |row| row.get(0),
    )?;
    stream.logs_per_min = per_min as u64;

    if let Some(ctx) = load_context(conn, &stream.id)? {
        stream.error_rate = ctx.patterns.error_rate;
        if let Some(latest) = ctx.latest_analysis() {
            stream.context_summary = format!("Last: {} ({})", latest.summary, latest.severity);
        }
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Severity;
    use chrono::TimeZone;

    fn record_at(stream_id: &str, secs: i64, level: LogLevel, message: &str) -> LogRecord {
        LogRecord::new(stream_id, message)
            .with_level(level)
            .with_timestamp(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    fn analysis_at(stream_id: &str, secs: i64, summary: &str) -> Analysis {
        Analysis {
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            stream_id: stream_id.to_string(),
            summary: summary.to_string(),
            root_cause: "cause".to_string(),
            severity: Severity::P2,
            fixes: vec!["fix".to_string()],
            context: None,
        }
    }

    #[test]
    fn test_timestamp_key_sorts_chronologically() {
        let a = Utc.timestamp_opt(1_700_000_000, 5).unwrap();
        let b = Utc.timestamp_opt(1_700_000_000, 40).unwrap();
        let c = Utc.timestamp_opt(1_700_000_001, 0).unwrap();
        assert!(timestamp_key(&a) < timestamp_key(&b));
        assert!(timestamp_key(&b) < timestamp_key(&c));
        assert_eq!(timestamp_key(&a).len(), timestamp_key(&c).len());
    }

    #[test]
    fn test_append_and_get_logs_in_order() {
        let store = Store::open_in_memory(100).unwrap();
        let records = vec![
            record_at("s1", 3, LogLevel::Info, "third"),
            record_at("s1", 1, LogLevel::Info, "first"),
            record_at("s1", 2, LogLevel::Error, "second"),
        ];
        store.append_logs("s1", &records).unwrap();

        let logs = store.get_logs("s1", &LogQuery::default()).unwrap();
        let messages: Vec<_> = logs.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_get_logs_unknown_stream_is_empty() {
        let store = Store::open_in_memory(100).unwrap();
        assert!(store.get_logs("nope", &LogQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn test_get_logs_limit_keeps_newest() {
        let store = Store::open_in_memory(100).unwrap();
        let records: Vec<_> = (0..10)
            .map(|i| record_at("s1", i, LogLevel::Info, &format!("line {}", i)))
            .collect();
        store.append_logs("s1", &records).unwrap();

        let logs = store.get_logs("s1", &LogQuery::latest(3)).unwrap();
        let messages: Vec<_> = logs.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn test_get_logs_since_is_exclusive_and_levels_filter() {
        let store = Store::open_in_memory(100).unwrap();
        let records = vec![
            record_at("s1", 0, LogLevel::Error, "old error"),
            record_at("s1", 10, LogLevel::Error, "boundary error"),
            record_at("s1", 20, LogLevel::Info, "new info"),
            record_at("s1", 30, LogLevel::Warn, "new warn"),
            record_at("s1", 40, LogLevel::Error, "new error"),
        ];
        store.append_logs("s1", &records).unwrap();

        let query = LogQuery {
            limit: 0,
            since: Some(Utc.timestamp_opt(1_700_000_010, 0).unwrap()),
            levels: vec![LogLevel::Error, LogLevel::Warn],
        };
        let logs = store.get_logs("s1", &query).unwrap();
        let messages: Vec<_> = logs.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["new warn", "new error"]);
    }

    #[test]
    fn test_duplicate_timestamps_are_both_kept() {
        let store = Store::open_in_memory(100).unwrap();
        let records = vec![
            record_at("s1", 5, LogLevel::Info, "a"),
            record_at("s1", 5, LogLevel::Info, "b"),
        ];
        store.append_logs("s1", &records).unwrap();

        let logs = store.get_logs("s1", &LogQuery::default()).unwrap();
        let messages: Vec<_> = logs.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b"]);
    }

    #[test]
    fn test_ring_buffer_evicts_oldest_by_key() {
        let store = Store::open_in_memory(5).unwrap();
        let records: Vec<_> = (0..8)
            .rev()
            .map(|i| record_at("s1", i, LogLevel::Info, &format!("line {}", i)))
            .collect();
        store.append_logs("s1", &records).unwrap();

        assert_eq!(store.count_logs("s1").unwrap(), 5);
        let logs = store.get_logs("s1", &LogQuery::default()).unwrap();
        assert_eq!(logs.first().unwrap().message, "line 3");
        assert_eq!(logs.last().unwrap().message, "line 7");
    }

    #[test]
    fn test_eviction_is_per_stream() {
        let store = Store::open_in_memory(3).unwrap();
        let a: Vec<_> = (0..5).map(|i| record_at("a", i, LogLevel::Info, "a")).collect();
        let b: Vec<_> = (0..2).map(|i| record_at("b", i, LogLevel::Info, "b")).collect();
        store.append_logs("a", &a).unwrap();
        store.append_logs("b", &b).unwrap();

        assert_eq!(store.count_logs("a").unwrap(), 3);
        assert_eq!(store.count_logs("b").unwrap(), 2);
    }

    #[test]
    fn test_append_updates_stream_and_context() {
        let store = Store::open_in_memory(100).unwrap();
        let records = vec![
            record_at("file:/var/log/app.log", 0, LogLevel::Error, "e1"),
            record_at("file:/var/log/app.log", 1, LogLevel::Fatal, "e2"),
            record_at("file:/var/log/app.log", 2, LogLevel::Info, "i1"),
            record_at("file:/var/log/app.log", 3, LogLevel::Info, "i2"),
        ];
        store.append_logs("file:/var/log/app.log", &records).unwrap();

        let stream = store.get_stream("file:/var/log/app.log").unwrap();
        assert_eq!(stream.name, "app.log");
        assert_eq!(stream.log_count, 4);
        assert!(stream.active);
        assert!((stream.error_rate - 0.5).abs() < f64::EPSILON);

        let ctx = store.get_context("file:/var/log/app.log").unwrap();
        assert_eq!(ctx.total_logs, 4);
        assert_eq!(ctx.error_count, 2);
    }

    #[test]
    fn test_totals_keep_growing_past_capacity() {
        let store = Store::open_in_memory(2).unwrap();
        for i in 0..5 {
            store
                .append_logs("s1", &[record_at("s1", i, LogLevel::Error, "boom")])
                .unwrap();
        }

        let ctx = store.get_context("s1").unwrap();
        assert_eq!(ctx.total_logs, 5);
        assert_eq!(ctx.error_count, 5);
        assert_eq!(store.count_logs("s1").unwrap(), 2);
    }

    #[test]
    fn test_get_stream_not_found() {
        let store = Store::open_in_memory(100).unwrap();
        assert!(matches!(
            store.get_stream("missing"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn test_update_and_list_streams() {
        let store = Store::open_in_memory(100).unwrap();
        let mut stream = Stream::new("docker:redis");
        stream.name = "Redis cache".to_string();
        store.update_stream(&stream).unwrap();
        store.update_stream(&Stream::new("docker:api")).unwrap();

        let streams = store.list_streams().unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].id, "docker:api");
        assert_eq!(streams[1].name, "Redis cache");
    }

    #[test]
    fn test_list_streams_enrichment() {
        let store = Store::open_in_memory(100).unwrap();
        let now = Utc::now();
        let records = vec![
            LogRecord::new("s1", "recent").with_timestamp(now),
            LogRecord::new("s1", "old").with_timestamp(now - Duration::minutes(10)),
        ];
        store.append_logs("s1", &records).unwrap();
        store
            .record_analysis(&analysis_at("s1", 0, "Disk almost full"), &[])
            .unwrap();

        let streams = store.list_streams().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].log_count, 2);
        assert_eq!(streams[0].logs_per_min, 1);
        assert_eq!(streams[0].context_summary, "Last: Disk almost full (P2)");
    }

    #[test]
    fn test_get_context_defaults_for_unknown_stream() {
        let store = Store::open_in_memory(100).unwrap();
        let ctx = store.get_context("fresh").unwrap();
        assert_eq!(ctx.stream_id, "fresh");
        assert!(ctx.analyses.is_empty());
        assert_eq!(ctx.total_logs, 0);
        assert_eq!(ctx.error_count, 0);
    }

    #[test]
    fn test_update_context_round_trip() {
        let store = Store::open_in_memory(100).unwrap();
        let mut ctx = StreamContext::new("s1");
        ctx.merge_common_errors(["timeout"]);
        store.update_context("s1", &ctx).unwrap();

        assert_eq!(store.get_context("s1").unwrap(), ctx);
    }

    #[test]
    fn test_analysis_history_is_chronological_and_limited() {
        let store = Store::open_in_memory(100).unwrap();
        store.store_analysis(&analysis_at("s1", 20, "third")).unwrap();
        store.store_analysis(&analysis_at("s1", 0, "first")).unwrap();
        store.store_analysis(&analysis_at("s1", 10, "second")).unwrap();
        store.store_analysis(&analysis_at("s10", 5, "other stream")).unwrap();

        let all = store.get_analysis_history("s1", 0).unwrap();
        let summaries: Vec<_> = all.iter().map(|a| a.summary.as_str()).collect();
        assert_eq!(summaries, vec!["first", "second", "third"]);

        let bounded = store.get_analysis_history("s1", 2).unwrap();
        let summaries: Vec<_> = bounded.iter().map(|a| a.summary.as_str()).collect();
        assert_eq!(summaries, vec!["first", "second"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_call_keeps_runtime_responsive_while_connection_is_busy() {
        let store = Arc::new(Store::open_in_memory(100).unwrap());

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let _guard = store.conn.lock().unwrap();
                locked_tx.send(()).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(300));
            })
        };
        locked_rx.recv().unwrap();

        let append = tokio::spawn({
            let store = Arc::clone(&store);
            async move {
                store
                    .call(|s| s.append_logs("s1", &[record_at("s1", 0, LogLevel::Info, "x")]))
                    .await
            }
        });

        let started = std::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(
            started.elapsed() < std::time::Duration::from_millis(200),
            "timer stalled for {:?}",
            started.elapsed()
        );

        append.await.unwrap().unwrap();
        holder.join().unwrap();
        assert_eq!(store.count_logs("s1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_call_reports_store_errors() {
        let store = Arc::new(Store::open_in_memory(100).unwrap());
        let err = store.call(|s| s.get_stream("missing")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[test]
    fn test_record_and_resolve_analysis() {
        let store = Store::open_in_memory(100).unwrap();
        let ctx = store
            .record_analysis(&analysis_at("s1", 0, "Network issue"), &["refused".to_string()])
            .unwrap();
        assert_eq!(ctx.analyses.len(), 1);
        assert!(!ctx.analyses[0].resolved);
        assert_eq!(ctx.patterns.common_errors, vec!["refused"]);

        let resolved = store
            .resolve_analysis("s1", 0, Some("restarted db".to_string()))
            .unwrap();
        assert!(resolved.analyses[0].resolved);
        assert_eq!(
            resolved.analyses[0].resolution_note.as_deref(),
            Some("restarted db")
        );
        assert_eq!(store.get_context("s1").unwrap(), resolved);
    }

    #[test]
    fn test_resolve_out_of_range_leaves_context_unchanged() {
        let store = Store::open_in_memory(100).unwrap();
        store
            .record_analysis(&analysis_at("s1", 0, "Network issue"), &[])
            .unwrap();
        let before = store.get_context("s1").unwrap();

        let result = store.resolve_analysis("s1", 1, Some("nope".to_string()));
        assert!(matches!(
            result,
            Err(StorageError::IndexOutOfRange { index: 1, len: 1 })
        ));
        assert_eq!(store.get_context("s1").unwrap(), before);
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = Store::open_in_memory(100).unwrap();
        assert!(store.close().is_ok());
        assert!(store.close().is_ok());
        assert!(matches!(store.count_logs("s1"), Err(StorageError::Closed)));
    }

    #[test]
    fn test_file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logtide.db");
        {
            let store = Store::open(&path, 100).unwrap();
            store
                .append_logs("s1", &[record_at("s1", 0, LogLevel::Warn, "disk 91%")])
                .unwrap();
            store.close().unwrap();
        }

        let store = Store::open(&path, 100).unwrap();
        let logs = store.get_logs("s1", &LogQuery::default()).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Warn);
    }

    // Scenario B: the 10,001st line evicts the very first one
    #[test]
    fn test_sequential_ingest_past_default_capacity() {
        let store = Store::open_in_memory(DEFAULT_MAX_LOGS_PER_STREAM).unwrap();
        for i in 0..=DEFAULT_MAX_LOGS_PER_STREAM as i64 {
            let record = LogRecord::new("s1", format!("line {}", i))
                .with_timestamp(Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::milliseconds(i));
            store.append_logs("s1", &[record]).unwrap();
        }

        let logs = store.get_logs("s1", &LogQuery::latest(0)).unwrap();
        assert_eq!(logs.len(), DEFAULT_MAX_LOGS_PER_STREAM);
        assert_eq!(logs[0].message, "line 1");
    }
}
