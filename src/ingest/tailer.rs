use crate::config::IngestConfig;
use crate::error::TailerError;
use crate::events::LogRecord;
use crate::hub::HubHandle;
use crate::ingest::parser::parse_line;
use crate::monitoring::SelfMonitoringCollector;
use crate::storage::Store;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

/// Lifecycle of a tailer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    Opening,
    ReplayingBacklog,
    Following,
    Stopped(StopReason),
}

/// Why a tailer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// End of file reached with following disabled
    EndOfFile,
    /// The file shrank below the position already read
    Truncated,
    /// `stop` was called
    Requested,
    /// Opening or reading the file failed
    Failed,
}

/// Reading behavior of a tailer
#[derive(Debug, Clone, PartialEq)]
pub struct TailerOptions {
    /// Lines replayed from the end of the file at startup
    pub backlog_lines: usize,
    /// Raw lines kept in memory while scanning for the backlog
    pub window_lines: usize,
    pub poll_interval: Duration,
    /// Keep reading appended lines after the backlog
    pub follow: bool,
}

impl Default for TailerOptions {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

impl From<&IngestConfig> for TailerOptions {
    fn from(config: &IngestConfig) -> Self {
        Self {
            backlog_lines: config.backlog_lines,
            window_lines: config.window_lines.max(config.backlog_lines),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            follow: config.follow,
        }
    }
}

/// Reads one file into one stream
///
/// Replays the newest lines of the file as a single batch, then follows appended
/// lines one at a time. Every parsed record is written to the store and published to
/// the hub. Store and hub failures are logged and ingestion continues; only failing
/// to open or read the file ends the tailer.
pub struct FileTailer {
    path: PathBuf,
    stream_id: String,
    store: Arc<Store>,
    hub: Option<HubHandle>,
    options: TailerOptions,
    monitoring: Option<Arc<SelfMonitoringCollector>>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<TailerState>>,
}

/// Control handle for a spawned tailer
pub struct TailerHandle {
    stream_id: String,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<TailerState>>,
    task: JoinHandle<Result<(), TailerError>>,
}

/// Stream id used for a tailed file
pub fn file_stream_id(path: &Path) -> String {
    format!("file:{}", path.display())
}

impl FileTailer {
    pub fn new(
        path: impl Into<PathBuf>,
        stream_id: impl Into<String>,
        store: Arc<Store>,
        hub: Option<HubHandle>,
        options: TailerOptions,
    ) -> Self {
        Self {
            path: path.into(),
            stream_id: stream_id.into(),
            store,
            hub,
            options,
            monitoring: None,
            running: Arc::new(AtomicBool::new(true)),
            state: Arc::new(Mutex::new(TailerState::Opening)),
        }
    }

    pub fn set_monitoring(&mut self, monitoring: Arc<SelfMonitoringCollector>) {
        self.monitoring = Some(monitoring);
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn state(&self) -> TailerState {
        read_state(&self.state)
    }

    fn set_state(&self, state: TailerState) {
        debug!("Tailer {} -> {:?}", self.stream_id, state);
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    /// Run the tailer on a new task
    pub fn spawn(self) -> TailerHandle {
        let stream_id = self.stream_id.clone();
        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move { self.run().await });
        TailerHandle {
            stream_id,
            running,
            state,
            task,
        }
    }

    /// Tail the file until it ends, shrinks, fails, or `stop` is requested
    ///
    /// # Errors
    ///
    /// Returns `TailerError::Open` if the file cannot be opened and
    /// `TailerError::IoError` if reading fails.
    pub async fn run(&self) -> Result<(), TailerError> {
        match self.tail().await {
            Ok(reason) => {
                info!("Tailer for {} stopped: {:?}", self.stream_id, reason);
                self.set_state(TailerState::Stopped(reason));
                Ok(())
            }
            Err(e) => {
                error!("Tailer for {} failed: {}", self.stream_id, e);
                self.set_state(TailerState::Stopped(StopReason::Failed));
                Err(e)
            }
        }
    }

    async fn tail(&self) -> Result<StopReason, TailerError> {
        self.set_state(TailerState::Opening);
        let file = File::open(&self.path)
            .await
            .map_err(|source| TailerError::Open {
                path: self.path.display().to_string(),
                source,
            })?;
        let mut reader = BufReader::new(file);

        self.set_state(TailerState::ReplayingBacklog);
        let mut window: VecDeque<Vec<u8>> = VecDeque::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut position: u64 = 0;
        let mut total_lines: u64 = 0;

        loop {
            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                break;
            }
            position += n as u64;

            if !line.ends_with(b"\n") {
                // Unterminated last line, completed later when following
                pending = line;
                break;
            }

            total_lines += 1;
            window.push_back(line);
            if window.len() > self.options.window_lines {
                window.pop_front();
            }
        }

        if !self.options.follow && !pending.is_empty() {
            total_lines += 1;
            window.push_back(std::mem::take(&mut pending));
        }

        debug!(
            "Read {} lines ({} bytes) from {}",
            total_lines,
            position,
            self.path.display()
        );
        self.replay_backlog(window).await;

        if !self.options.follow {
            return Ok(StopReason::EndOfFile);
        }

        self.set_state(TailerState::Following);
        info!("Following {} (stream: {})", self.path.display(), self.stream_id);

        while self.running.load(Ordering::SeqCst) {
            let n = reader.read_until(b'\n', &mut pending).await?;
            if n == 0 {
                let len = tokio::fs::metadata(&self.path).await?.len();
                if len < position {
                    warn!(
                        "{} shrank from {} to {} bytes, stopping",
                        self.path.display(),
                        position,
                        len
                    );
                    return Ok(StopReason::Truncated);
                }
                tokio::time::sleep(self.options.poll_interval).await;
                continue;
            }

            position += n as u64;
            if pending.ends_with(b"\n") {
                let line = std::mem::take(&mut pending);
                if let Some(record) = self.parse(&line) {
                    self.ingest(vec![record]).await;
                }
            }
        }

        Ok(StopReason::Requested)
    }

    /// Store the newest backlog lines in one batch, then publish them in order
    async fn replay_backlog(&self, window: VecDeque<Vec<u8>>) {
        let skip = window.len().saturating_sub(self.options.backlog_lines);
        let records: Vec<LogRecord> = window
            .iter()
            .skip(skip)
            .filter_map(|line| self.parse(line))
            .collect();

        if records.is_empty() {
            return;
        }
        info!("Replaying {} backlog lines for {}", records.len(), self.stream_id);
        self.ingest(records).await;
    }

    fn parse(&self, line: &[u8]) -> Option<LogRecord> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(['\n', '\r']);
        if text.trim().is_empty() {
            return None;
        }
        Some(parse_line(&self.stream_id, text))
    }

    async fn ingest(&self, records: Vec<LogRecord>) {
        let count = records.len();
        let stream_id = self.stream_id.clone();
        let (stored, records) = match self
            .store
            .call(move |store| Ok((store.append_logs(&stream_id, &records), records)))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "Failed to store {} records for {}: {}",
                    count, self.stream_id, e
                );
                return;
            }
        };

        match stored {
            Ok(()) => {
                if let Some(monitoring) = &self.monitoring {
                    monitoring.record_lines_ingested(records.len() as u64);
                }
            }
            Err(e) => error!(
                "Failed to store {} records for {}: {}",
                records.len(),
                self.stream_id,
                e
            ),
        }

        if let Some(hub) = &self.hub {
            for record in records {
                if let Err(e) = hub.publish(record).await {
                    warn!("Live publish for {} failed: {}", self.stream_id, e);
                    break;
                }
            }
        }
    }
}

fn read_state(state: &Mutex<TailerState>) -> TailerState {
    match state.lock() {
        Ok(state) => *state,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

impl TailerHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn state(&self) -> TailerState {
        read_state(&self.state)
    }

    /// Ask the tailer to stop at its next poll
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the tailer to end
    pub async fn join(self) -> Result<(), TailerError> {
        self.task
            .await
            .map_err(|e| TailerError::Aborted(e.to_string()))?
    }
}

/// Start one tailer per file, each on its own stream `file:<path>`
pub fn spawn_file_tailers(
    paths: &[PathBuf],
    store: &Arc<Store>,
    hub: Option<&HubHandle>,
    options: &TailerOptions,
    monitoring: Option<&Arc<SelfMonitoringCollector>>,
) -> Vec<TailerHandle> {
    paths
        .iter()
        .map(|path| {
            let mut tailer = FileTailer::new(
                path.clone(),
                file_stream_id(path),
                Arc::clone(store),
                hub.cloned(),
                options.clone(),
            );
            if let Some(monitoring) = monitoring {
                tailer.set_monitoring(Arc::clone(monitoring));
            }
            info!("Starting tailer for {}", path.display());
            tailer.spawn()
        })
        .collect()
}
