use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use logtide::ai::Analyzer;
use logtide::config::Config;
use logtide::error::ServiceError;
use logtide::hub;
use logtide::ingest::{spawn_file_tailers, TailerOptions};
use logtide::monitoring::SelfMonitoringCollector;
use logtide::service::{ErrorBody, LogService, LogsRequest, ResolveRequest};
use logtide::storage::Store;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Interval between self-monitoring reports while running
const MONITORING_INTERVAL: Duration = Duration::from_secs(60);

/// Command-line arguments
#[derive(Parser)]
#[command(
    name = "logtide",
    about = "Log ingestion, storage, live fan-out and incident analysis",
    long_about = "Tails log files into a bounded per-stream store, fans new lines out to live \
                  subscribers and classifies recent errors with known failure patterns or an \
                  optional OpenAI-compatible model."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Tail files into the store until interrupted
    Run {
        /// File to tail in addition to ingest.files, may be repeated
        #[arg(short, long = "file", value_name = "PATH")]
        files: Vec<PathBuf>,
    },
    /// List known streams
    Streams,
    /// Print records of a stream
    Logs {
        stream_id: String,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Only records newer than this duration, e.g. 5m or 1h30m
        #[arg(short, long)]
        since: Option<String>,
        /// Comma-separated levels, e.g. error,warn
        #[arg(long)]
        levels: Option<String>,
    },
    /// Analyze the most recent records of a stream
    Analyze { stream_id: String },
    /// Print the accumulated context of a stream
    Context { stream_id: String },
    /// Mark an analysis in the stream context as resolved
    Resolve {
        stream_id: String,
        #[arg(short, long)]
        index: usize,
        #[arg(short, long, default_value = "")]
        note: String,
    },
    /// Print stored analyses of a stream, oldest first
    History {
        stream_id: String,
        /// Maximum number of analyses from the start of the history, 0 for all
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// Missing configuration files are not an error: defaults are used instead.
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

/// Print a successful result as JSON, or the structured error payload
fn print_json<T: Serialize>(result: Result<T, ServiceError>) -> anyhow::Result<()> {
    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&ErrorBody::from(&e))?);
            Err(anyhow!(e))
        }
    }
}

/// Tail files until Ctrl+C, or until every tailer stops when not following
async fn run(config: &Config, store: Arc<Store>, files: Vec<PathBuf>) -> anyhow::Result<()> {
    let mut paths = config.ingest.files.clone();
    for file in files {
        if !paths.contains(&file) {
            paths.push(file);
        }
    }
    if paths.is_empty() {
        bail!("No files to tail: pass --file or set ingest.files");
    }

    let monitoring = Arc::new(SelfMonitoringCollector::new());
    let (hub, hub_task) = hub::spawn(&config.hub, Some(Arc::clone(&monitoring)));
    let tailers = spawn_file_tailers(
        &paths,
        &store,
        Some(&hub),
        &TailerOptions::from(&config.ingest),
        Some(&monitoring),
    );

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        signal.notify_one();
    })
    .context("Error setting SIGINT handler for graceful shutdown")?;

    info!("Tailing {} files. Press Ctrl+C to stop.", tailers.len());

    let mut report = tokio::time::interval(MONITORING_INTERVAL);
    report.tick().await;
    let mut check = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = report.tick() => {
                monitoring.collect_metrics();
            }
            _ = check.tick() => {
                if tailers.iter().all(|t| t.is_finished()) {
                    info!("All tailers stopped");
                    break;
                }
            }
        }
    }

    for tailer in &tailers {
        tailer.stop();
    }
    for tailer in tailers {
        let stream_id = tailer.stream_id().to_string();
        if let Err(e) = tailer.join().await {
            error!("Tailer for {} failed: {}", stream_id, e);
        }
    }

    drop(hub);
    if let Err(e) = hub_task.await {
        error!("Hub task failed: {}", e);
    }
    monitoring.collect_metrics();
    Ok(())
}

/// Service for one-shot commands, with its own hub on the current runtime
fn service(config: &Config, store: &Arc<Store>) -> LogService {
    let monitoring = Arc::new(SelfMonitoringCollector::new());
    let (hub, _hub_task) = hub::spawn(&config.hub, Some(Arc::clone(&monitoring)));
    let mut analyzer = Analyzer::from_config(Arc::clone(store), &config.analyzer);
    analyzer.set_monitoring(monitoring);
    LogService::new(Arc::clone(store), analyzer, hub, config.analyzer.batch_size)
}

async fn execute(cli: Cli, config: Config) -> anyhow::Result<()> {
    let store = Arc::new(
        Store::open(&config.storage.path, config.storage.max_logs_per_stream).with_context(
            || format!("Failed to open store at {}", config.storage.path.display()),
        )?,
    );

    let result = match cli.command {
        Command::Run { files } => run(&config, Arc::clone(&store), files).await,
        Command::Streams => print_json(service(&config, &store).list_streams().await),
        Command::Logs {
            stream_id,
            limit,
            since,
            levels,
        } => print_json(
            service(&config, &store)
                .get_logs(
                    &stream_id,
                    &LogsRequest {
                        limit,
                        since,
                        levels,
                    },
                )
                .await,
        ),
        Command::Analyze { stream_id } => {
            print_json(service(&config, &store).analyze_stream(&stream_id).await)
        }
        Command::Context { stream_id } => {
            print_json(service(&config, &store).get_context(&stream_id).await)
        }
        Command::Resolve {
            stream_id,
            index,
            note,
        } => print_json(
            service(&config, &store)
                .resolve(
                    &stream_id,
                    &ResolveRequest {
                        analysis_index: index,
                        note,
                    },
                )
                .await,
        ),
        Command::History { stream_id, limit } => {
            print_json(service(&config, &store).analysis_history(&stream_id, limit).await)
        }
    };

    if let Err(e) = store.close() {
        error!("Failed to close store: {}", e);
    }
    result
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let mut config = Config::load_or_default(cli.config.as_deref());
    config.apply_env();

    if let Err(e) = execute(cli, config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
