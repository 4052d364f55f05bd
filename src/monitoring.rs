//! Self-monitoring metrics collection
//!
//! Tracks the health of the pipeline itself: ingestion rate, analysis latency,
//! how often the external classifier had to fall back, and live delivery success.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Snapshot of the pipeline's own performance
#[derive(Debug, Clone)]
pub struct SelfMonitoringMetrics {
    /// Current memory usage in bytes
    pub memory_usage_bytes: u64,
    /// Lines ingested by all tailers in the last minute
    pub lines_ingested_per_minute: u64,
    /// Average analysis latency in milliseconds
    pub avg_analysis_latency_ms: f64,
    /// Analyses answered by the pattern classifier after an external failure
    pub fallback_count: u64,
    pub successful_deliveries_per_minute: u64,
    pub failed_deliveries_per_minute: u64,
    /// Live delivery success rate as a percentage (0-100)
    pub delivery_success_rate: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct LineCount {
    count: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct DeliveryResult {
    success: bool,
    timestamp: DateTime<Utc>,
}

/// Collector shared by the tailers, the hub and the analyzer
#[derive(Debug)]
pub struct SelfMonitoringCollector {
    /// Recent analysis latencies
    analysis_latencies: Mutex<VecDeque<Duration>>,
    delivery_results: Mutex<VecDeque<DeliveryResult>>,
    /// Ingested line counts, one entry per store write
    line_counts: Mutex<VecDeque<LineCount>>,
    fallbacks: AtomicU64,
    max_latency_samples: usize,
    max_delivery_samples: usize,
    max_count_age: chrono::Duration,
}

impl Default for SelfMonitoringCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SelfMonitoringCollector {
    pub fn new() -> Self {
        Self {
            analysis_latencies: Mutex::new(VecDeque::new()),
            delivery_results: Mutex::new(VecDeque::new()),
            line_counts: Mutex::new(VecDeque::new()),
            fallbacks: AtomicU64::new(0),
            max_latency_samples: 100,
            max_delivery_samples: 1000,
            max_count_age: chrono::Duration::minutes(5),
        }
    }

    /// Record the latency of one analysis
    pub fn record_analysis_latency(&self, duration: Duration) {
        debug!("Recording analysis latency: {:?}", duration);

        let mut latencies = lock(&self.analysis_latencies);
        latencies.push_back(duration);
        while latencies.len() > self.max_latency_samples {
            latencies.pop_front();
        }
    }

    /// Record that the external classifier failed and the fallback answered
    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of delivering one record to one subscriber
    pub fn record_delivery(&self, success: bool) {
        let mut results = lock(&self.delivery_results);
        results.push_back(DeliveryResult {
            success,
            timestamp: Utc::now(),
        });
        while results.len() > self.max_delivery_samples {
            results.pop_front();
        }
    }

    /// Record that lines were written to the store
    pub fn record_lines_ingested(&self, count: u64) {
        if count == 0 {
            return;
        }

        let now = Utc::now();
        let mut counts = lock(&self.line_counts);
        counts.push_back(LineCount {
            count,
            timestamp: now,
        });

        let cutoff = now - self.max_count_age;
        while counts.front().is_some_and(|front| front.timestamp < cutoff) {
            counts.pop_front();
        }
    }

    /// Current resident memory of the process
    fn memory_usage(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                let rss_kb = status
                    .lines()
                    .find(|line| line.starts_with("VmRSS:"))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok());
                if let Some(kb) = rss_kb {
                    return kb * 1024;
                }
            }
        }

        #[cfg(unix)]
        {
            // Peak rather than current usage, good enough as a fallback
            let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
            if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } == 0 {
                #[cfg(target_os = "macos")]
                return usage.ru_maxrss as u64;

                #[cfg(not(target_os = "macos"))]
                return (usage.ru_maxrss as u64).saturating_mul(1024);
            }
        }

        0
    }

    fn avg_analysis_latency_ms(&self) -> f64 {
        let latencies = lock(&self.analysis_latencies);
        if latencies.is_empty() {
            return 0.0;
        }

        let total_ms: f64 = latencies.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        total_ms / latencies.len() as f64
    }

    fn lines_per_minute(&self) -> u64 {
        let one_minute_ago = Utc::now() - chrono::Duration::minutes(1);
        lock(&self.line_counts)
            .iter()
            .filter(|count| count.timestamp >= one_minute_ago)
            .map(|count| count.count)
            .sum()
    }

    fn delivery_rates(&self) -> (u64, u64, f64) {
        let one_minute_ago = Utc::now() - chrono::Duration::minutes(1);
        let results = lock(&self.delivery_results);

        let (successful, failed) = results
            .iter()
            .filter(|result| result.timestamp >= one_minute_ago)
            .fold((0u64, 0u64), |(ok, failed), result| {
                if result.success {
                    (ok + 1, failed)
                } else {
                    (ok, failed + 1)
                }
            });

        if successful + failed == 0 {
            return (0, 0, 100.0);
        }
        let rate = successful as f64 / (successful + failed) as f64 * 100.0;
        (successful, failed, rate)
    }

    /// Collect and log a snapshot
    pub fn collect_metrics(&self) -> SelfMonitoringMetrics {
        let memory_usage_bytes = self.memory_usage();
        let avg_analysis_latency_ms = self.avg_analysis_latency_ms();
        let lines_ingested_per_minute = self.lines_per_minute();
        let (successful, failed, delivery_success_rate) = self.delivery_rates();
        let fallback_count = self.fallbacks.load(Ordering::Relaxed);

        info!(
            "Self-monitoring: memory={}MB, lines/min={}, analysis_latency={:.1}ms, fallbacks={}, delivery_success={:.1}%",
            memory_usage_bytes / 1024 / 1024,
            lines_ingested_per_minute,
            avg_analysis_latency_ms,
            fallback_count,
            delivery_success_rate
        );

        if memory_usage_bytes > 500 * 1024 * 1024 {
            warn!(
                "High memory usage detected: {}MB",
                memory_usage_bytes / 1024 / 1024
            );
        }

        if avg_analysis_latency_ms > 30_000.0 {
            warn!(
                "High analysis latency detected: {:.1}ms",
                avg_analysis_latency_ms
            );
        }

        if delivery_success_rate < 90.0 && successful + failed > 0 {
            warn!(
                "Low live delivery success rate: {:.1}%",
                delivery_success_rate
            );
        }

        SelfMonitoringMetrics {
            memory_usage_bytes,
            lines_ingested_per_minute,
            avg_analysis_latency_ms,
            fallback_count,
            successful_deliveries_per_minute: successful,
            failed_deliveries_per_minute: failed,
            delivery_success_rate,
            timestamp: Utc::now(),
        }
    }
}

/// Measures one analysis and records its latency when finished
pub struct AnalysisTimer {
    start_time: Instant,
    collector: Arc<SelfMonitoringCollector>,
}

impl AnalysisTimer {
    pub fn start(collector: Arc<SelfMonitoringCollector>) -> Self {
        Self {
            start_time: Instant::now(),
            collector,
        }
    }

    /// Stop timing and record the latency
    pub fn finish(self) -> Duration {
        let duration = self.start_time.elapsed();
        self.collector.record_analysis_latency(duration);
        duration
    }
}
